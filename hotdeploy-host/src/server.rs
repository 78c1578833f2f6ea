//! WebSocket accept loop
//!
//! Each accepted connection is authenticated from its handshake, greeted,
//! added to the [`ConnectionSet`] and then served by its own [`RpcEndpoint`]
//! until the peer goes away.

use crate::config::HostConfig;
use crate::connections::{ConnectionSet, EventPublisher};
use crate::dispatcher::HostDispatcher;
use crate::registry::UnitManager;
use hotdeploy::transport::{self, CloseReason};
use hotdeploy::{RequestHandler, RpcEndpoint};
use hotdeploy_api::{
    Notification, AUTH_REJECTED_CLOSE_CODE, CONNECT_TIMEOUT, GREETING_METHOD, TOKEN_HEADER,
    TOKEN_QUERY_PARAM,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// Close code sent to every client when the host stops
pub const GOING_AWAY_CLOSE_CODE: u16 = 1001;

/// Host server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct Shared {
    config: HostConfig,
    dispatcher: Arc<HostDispatcher>,
    connections: ConnectionSet,
}

/// Bound but not yet running host
pub struct HostServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl HostServer {
    /// Bind the listen address from `config`
    pub async fn bind(
        config: HostConfig,
        manager: Arc<dyn UnitManager>,
    ) -> Result<Self, ServerError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        if config.enable_auth && config.token.is_empty() {
            tracing::warn!("Authentication enabled with an empty token; every client will be rejected");
        }

        let connections = ConnectionSet::new();
        let dispatcher = Arc::new(HostDispatcher::new(
            manager,
            EventPublisher::new(connections.clone()),
        ));

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                dispatcher,
                connections,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for pushing notifications to every connected client
    pub fn publisher(&self) -> EventPublisher {
        self.shared.dispatcher.publisher().clone()
    }

    pub fn connections(&self) -> ConnectionSet {
        self.shared.connections.clone()
    }

    /// Serve until the process ends
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes, then close every connection
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            addr = %self.listener.local_addr()?,
            auth = self.shared.config.enable_auth,
            "Host listening"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            serve_connection(shared, stream, peer).await;
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                _ = &mut shutdown => break,
            }
        }

        let connections = self.shared.connections.len().await;
        tracing::info!(connections, "Host shutting down");
        self.shared
            .connections
            .close_all(GOING_AWAY_CLOSE_CODE, "host shutting down")
            .await;
        Ok(())
    }
}

impl std::fmt::Debug for HostServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServer")
            .field("listener", &self.listener.local_addr().ok())
            .finish()
    }
}

async fn serve_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let mut presented: Option<String> = None;
    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        presented = presented_token(request);
        Ok(response)
    };

    let handshake = tokio_tungstenite::accept_hdr_async(stream, capture);
    let ws = match tokio::time::timeout(CONNECT_TIMEOUT, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            tracing::debug!(%peer, error = %e, "Handshake failed");
            return;
        }
        Err(_) => {
            tracing::debug!(%peer, "Handshake timed out");
            return;
        }
    };

    let (mut writer, reader) = transport::split(ws);

    if !shared.config.accepts(presented.as_deref()) {
        tracing::warn!(%peer, "Rejecting unauthenticated connection");
        if let Err(e) = writer
            .send_close(AUTH_REJECTED_CLOSE_CODE, "unauthorized")
            .await
        {
            tracing::debug!(%peer, error = %e, "Failed to send rejection");
        }
        let _ = writer.close().await;
        return;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    transport::spawn_writer(writer, rx);

    let handler: Arc<dyn RequestHandler> = shared.dispatcher.clone();
    let endpoint = RpcEndpoint::new(tx.clone()).with_handler(handler);

    // Queued before the connection joins the broadcast set so it is always the first frame
    let greeting = shared.dispatcher.greeting().await;
    match serde_json::to_value(&greeting) {
        Ok(params) => {
            if let Err(e) = endpoint.notify(Notification::new(GREETING_METHOD, params)) {
                tracing::debug!(%peer, error = %e, "Failed to queue greeting");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode greeting"),
    }

    let id = shared.connections.insert(tx).await;
    tracing::info!(%peer, connection = id, "Client connected");

    let reason = transport::pump(reader, &endpoint).await;

    shared.connections.remove(id).await;
    endpoint.close();
    match reason {
        CloseReason::Closed { code, reason } => {
            tracing::info!(%peer, connection = id, code, reason = %reason, "Client disconnected");
        }
        CloseReason::Eof => tracing::info!(%peer, connection = id, "Client disconnected"),
        CloseReason::Error(e) => {
            tracing::warn!(%peer, connection = id, error = %e, "Connection failed");
        }
    }
}

/// Token from the token header, else from the query string
fn presented_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(TOKEN_HEADER) {
        return value.to_str().ok().map(str::to_string);
    }
    request
        .uri()
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == TOKEN_QUERY_PARAM)
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
}
