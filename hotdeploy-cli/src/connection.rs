//! Connection lifecycle manager
//!
//! Owns the client's single connection to a host and walks it through
//! `Disconnected → Connecting → AwaitingGreeting → Ready`. Once ready it asks
//! the host for its operating parameters and probes for remote transfer
//! support. A dropped connection is re-established at most once per
//! [`ConnectionManager::ensure_ready`] call; an authentication rejection is
//! final and never retried.

use crate::api::HostApi;
use hotdeploy::transport::{self, CloseReason};
use hotdeploy::{CallError, Outbound, RpcEndpoint, TransportError};
use hotdeploy_api::{
    DebugInfo, Greeting, Notification, AUTH_REJECTED_CLOSE_CODE, CONNECT_TIMEOUT, GREETING_METHOD,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("Timed out connecting to {url} after {}ms", after.as_millis())]
    Timeout { url: String, after: Duration },

    #[error("Host rejected the token (close code 4001)")]
    AuthRejected,

    #[error("Connection closed before the greeting: {0}")]
    Closed(String),

    #[error(transparent)]
    Call(#[from] CallError),
}

impl ConnectionError {
    /// Whether a later attempt could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectionError::AuthRejected)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingGreeting,
    Ready,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    Authenticated,
    Rejected,
}

/// Features detected after the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Host answers `writeFiles`/`removeDir`
    pub remote_transfer: bool,
}

/// Point-in-time view of the connection
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub url: String,
    pub state: ConnectionState,
    pub auth: AuthState,
    pub capabilities: Capabilities,
    pub greeting: Option<Greeting>,
    pub host_info: Option<DebugInfo>,
    pub last_close: Option<CloseReason>,
}

struct Session {
    endpoint: Arc<RpcEndpoint>,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    auth: AuthState,
    /// Bumped for every new session so a stale reader cannot clobber a newer one
    generation: u64,
    session: Option<Session>,
    capabilities: Capabilities,
    greeting: Option<Greeting>,
    host_info: Option<DebugInfo>,
    last_close: Option<CloseReason>,
}

/// Client side of one host connection
pub struct ConnectionManager {
    url: String,
    token: Option<String>,
    connect_timeout: Duration,
    inner: Arc<Mutex<Inner>>,
    connecting: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<Notification>,
}

impl ConnectionManager {
    /// Create a disconnected manager.
    ///
    /// Host notifications other than the greeting are delivered on the
    /// returned receiver, across reconnects.
    pub fn new(
        address: &str,
        token: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            url: transport::to_ws_url(address),
            token: token.filter(|t| !t.is_empty()),
            connect_timeout: CONNECT_TIMEOUT,
            inner: Arc::new(Mutex::new(Inner::default())),
            connecting: tokio::sync::Mutex::new(()),
            events,
        };
        (manager, events_rx)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner().state
    }

    pub fn auth_state(&self) -> AuthState {
        self.inner().auth
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner().capabilities
    }

    pub fn host_info(&self) -> Option<DebugInfo> {
        self.inner().host_info.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.inner();
        ConnectionStatus {
            url: self.url.clone(),
            state: inner.state,
            auth: inner.auth,
            capabilities: inner.capabilities,
            greeting: inner.greeting.clone(),
            host_info: inner.host_info.clone(),
            last_close: inner.last_close.clone(),
        }
    }

    /// Endpoint of the live session, if ready
    pub fn endpoint(&self) -> Option<Arc<RpcEndpoint>> {
        let inner = self.inner();
        match (&inner.state, &inner.session) {
            (ConnectionState::Ready, Some(session)) => Some(session.endpoint.clone()),
            _ => None,
        }
    }

    /// Return the live endpoint, reconnecting once if the connection dropped
    pub async fn ensure_ready(&self) -> Result<Arc<RpcEndpoint>, ConnectionError> {
        if let Some(endpoint) = self.endpoint() {
            return Ok(endpoint);
        }
        if self.auth_state() == AuthState::Rejected {
            return Err(ConnectionError::AuthRejected);
        }
        tracing::info!(url = %self.url, "Reconnecting");
        self.connect().await
    }

    /// Open a new session, replacing any existing one
    pub async fn connect(&self) -> Result<Arc<RpcEndpoint>, ConnectionError> {
        let _connecting = self.connecting.lock().await;
        self.close();

        let generation = {
            let mut inner = self.inner();
            inner.generation += 1;
            inner.state = ConnectionState::Connecting;
            inner.auth = AuthState::Unauthenticated;
            inner.capabilities = Capabilities::default();
            inner.greeting = None;
            inner.host_info = None;
            inner.generation
        };
        tracing::debug!(url = %self.url, generation, "Connecting");

        let deadline = Instant::now() + self.connect_timeout;
        let result = self.establish(generation, deadline).await;

        match result {
            Ok(endpoint) => {
                self.discover(&endpoint).await;
                Ok(endpoint)
            }
            Err(e) => {
                let mut inner = self.inner();
                if inner.generation == generation {
                    inner.state = ConnectionState::Disconnected;
                    inner.session = None;
                    if matches!(e, ConnectionError::AuthRejected) {
                        inner.auth = AuthState::Rejected;
                    }
                }
                Err(e)
            }
        }
    }

    /// Close the current session, if any
    pub fn close(&self) {
        let session = {
            let mut inner = self.inner();
            inner.generation += 1;
            inner.state = ConnectionState::Disconnected;
            inner.session.take()
        };
        if let Some(session) = session {
            let _ = session.outbound.send(Outbound::Close {
                code: 1000,
                reason: "client closing".to_string(),
            });
            session.endpoint.close();
            session.reader.abort();
            tracing::debug!(url = %self.url, "Connection closed");
        }
    }

    async fn establish(
        &self,
        generation: u64,
        deadline: Instant,
    ) -> Result<Arc<RpcEndpoint>, ConnectionError> {
        let dial = transport::connect(&self.url, self.token.as_deref());
        let (writer, reader) = match tokio::time::timeout_at(deadline, dial).await {
            Ok(Ok(halves)) => halves,
            Ok(Err(source)) => {
                return Err(ConnectionError::Connect {
                    url: self.url.clone(),
                    source,
                })
            }
            Err(_) => return Err(self.timeout_error()),
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        transport::spawn_writer(writer, outbound_rx);

        let (events_tx, mut session_events) = mpsc::unbounded_channel();
        let endpoint = Arc::new(RpcEndpoint::new(outbound.clone()).with_event_sink(events_tx));

        let (closed_tx, mut closed_rx) = oneshot::channel();
        let reader_task = {
            let endpoint = endpoint.clone();
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let reason = transport::pump(reader, &endpoint).await;
                endpoint.close();
                session_ended(&inner, generation, &reason);
                let _ = closed_tx.send(reason);
            })
        };

        self.set_state(generation, ConnectionState::AwaitingGreeting);

        let greeting = loop {
            tokio::select! {
                biased;
                event = session_events.recv() => match event {
                    Some(n) if n.method == GREETING_METHOD => {
                        break serde_json::from_value::<Greeting>(n.params).ok();
                    }
                    Some(n) => {
                        let _ = self.events.send(n);
                    }
                    None => return Err(ConnectionError::Closed("event stream ended".to_string())),
                },
                reason = &mut closed_rx => {
                    return Err(match reason {
                        Ok(reason) => classify_close(&reason),
                        Err(_) => ConnectionError::Closed("reader stopped".to_string()),
                    });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = outbound.send(Outbound::Close {
                        code: 1000,
                        reason: "greeting timeout".to_string(),
                    });
                    endpoint.close();
                    reader_task.abort();
                    return Err(self.timeout_error());
                }
            }
        };

        // Forward later notifications for the rest of the session
        let forward = self.events.clone();
        tokio::spawn(async move {
            while let Some(notification) = session_events.recv().await {
                if forward.send(notification).is_err() {
                    break;
                }
            }
        });

        let mut inner = self.inner();
        if inner.generation != generation {
            reader_task.abort();
            return Err(ConnectionError::Closed("superseded by a newer connection".to_string()));
        }
        inner.state = ConnectionState::Ready;
        inner.auth = AuthState::Authenticated;
        inner.greeting = greeting;
        inner.session = Some(Session {
            endpoint: endpoint.clone(),
            outbound,
            reader: reader_task,
        });
        tracing::info!(url = %self.url, "Connected");

        Ok(endpoint)
    }

    /// Informational call and capability probe run once per session
    async fn discover(&self, endpoint: &RpcEndpoint) {
        let api = HostApi::new(endpoint);

        let host_info = match api.debug_info().await {
            Ok(info) => {
                tracing::debug!(
                    root = %info.managed_root_path,
                    units = info.total_units,
                    "Host info received"
                );
                Some(info)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch host info");
                None
            }
        };

        let remote_transfer = match api.write_files(Vec::new()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Remote transfer not supported");
                false
            }
        };

        let mut inner = self.inner();
        inner.host_info = host_info;
        inner.capabilities = Capabilities { remote_transfer };
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        let mut inner = self.inner();
        if inner.generation == generation {
            inner.state = state;
        }
    }

    fn timeout_error(&self) -> ConnectionError {
        ConnectionError::Timeout {
            url: self.url.clone(),
            after: self.connect_timeout,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish()
    }
}

fn session_ended(inner: &Mutex<Inner>, generation: u64, reason: &CloseReason) {
    let mut inner = inner
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if inner.generation != generation {
        return;
    }
    let was_ready = inner.state == ConnectionState::Ready;
    inner.state = ConnectionState::Disconnected;
    inner.session = None;
    inner.last_close = Some(reason.clone());
    if matches!(reason, CloseReason::Closed { code, .. } if *code == AUTH_REJECTED_CLOSE_CODE) {
        inner.auth = AuthState::Rejected;
    }
    if was_ready {
        tracing::warn!(reason = ?reason, "Disconnected from host");
    }
}

/// Map a close seen before the greeting to a connection error
pub fn classify_close(reason: &CloseReason) -> ConnectionError {
    match reason {
        CloseReason::Closed { code, .. } if *code == AUTH_REJECTED_CLOSE_CODE => {
            ConnectionError::AuthRejected
        }
        CloseReason::Closed { code, reason } => {
            ConnectionError::Closed(format!("code {} {}", code, reason).trim().to_string())
        }
        CloseReason::Eof => ConnectionError::Closed("connection ended".to_string()),
        CloseReason::Error(e) => ConnectionError::Closed(e.clone()),
    }
}
