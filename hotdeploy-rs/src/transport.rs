//! WebSocket transport
//!
//! Thin wrapper around `tokio-tungstenite` providing reader/writer halves
//! that work for both accepted (host) and dialled (client) streams, plus the
//! two loops every connection runs: a writer draining an outbound queue and
//! a reader pumping text frames into an [`RpcEndpoint`].

use crate::endpoint::RpcEndpoint;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hotdeploy_api::TOKEN_HEADER;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

/// Stream type produced by [`connect`]
pub type ClientStream = tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid WebSocket URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("Invalid token header value")]
    InvalidToken,

    #[error("WebSocket connect failed: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("WebSocket I/O failed: {0}")]
    Io(#[source] tungstenite::Error),
}

/// Frame queued for the writer loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Received WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Close { code: u16, reason: String },
}

/// Why a connection's reader loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame
    Closed { code: u16, reason: String },
    /// Stream ended without a close frame
    Eof,
    /// Read failed
    Error(String),
}

/// Write half of a WebSocket connection
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(TransportError::Io)
    }

    /// Send a close frame with an application close code
    pub async fn send_close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(TransportError::Io)
    }

    /// Flush pending writes and close the sink
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await.map_err(TransportError::Io)
    }
}

/// Read half of a WebSocket connection
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Receive the next text or close message, `None` when the stream ends.
    ///
    /// Binary frames are treated as UTF-8 text; ping/pong and raw frames are
    /// handled by tungstenite and skipped here.
    pub async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(WsMessage::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(WsMessage::Text(text))),
                    Err(_) => {
                        tracing::trace!("Dropping non UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(e) => return Some(Err(TransportError::Io(e))),
            }
        }
    }
}

/// Split a WebSocket into writer and reader halves
pub fn split<S>(ws: WebSocketStream<S>) -> (WsWriter<S>, WsReader<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (WsWriter { sink }, WsReader { stream })
}

/// Dial a host, presenting `token` in the token header when given
pub async fn connect(
    url: &str,
    token: Option<&str>,
) -> Result<(WsWriter<ClientStream>, WsReader<ClientStream>), TransportError> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|source| TransportError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

    if let Some(token) = token.filter(|t| !t.is_empty()) {
        let value = tungstenite::http::HeaderValue::from_str(token)
            .map_err(|_| TransportError::InvalidToken)?;
        request.headers_mut().insert(TOKEN_HEADER, value);
    }

    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(TransportError::Connect)?;

    Ok(split(ws))
}

/// Normalize an address into a `ws://` URL.
///
/// Bare `host:port` gets a `ws://` prefix; `http(s)://` is rewritten.
pub fn to_ws_url(address: &str) -> String {
    if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else if let Some(rest) = address.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = address.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", address)
    }
}

/// Drain `outbound` into the writer until the queue closes or a close frame is sent
pub fn spawn_writer<S>(
    mut writer: WsWriter<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let result = match frame {
                Outbound::Text(text) => writer.send_text(text).await,
                Outbound::Close { code, reason } => {
                    let result = writer.send_close(code, &reason).await;
                    let _ = writer.close().await;
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "Failed to send close frame");
                    }
                    return;
                }
            };
            if let Err(e) = result {
                tracing::debug!(error = %e, "Write failed, stopping writer");
                return;
            }
        }
        let _ = writer.close().await;
    })
}

/// Feed every text frame into `endpoint` until the connection ends
pub async fn pump<S>(mut reader: WsReader<S>, endpoint: &RpcEndpoint) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match reader.recv().await {
            Some(Ok(WsMessage::Text(text))) => endpoint.handle_frame(&text),
            Some(Ok(WsMessage::Close { code, reason })) => {
                return CloseReason::Closed { code, reason };
            }
            Some(Err(e)) => return CloseReason::Error(e.to_string()),
            None => return CloseReason::Eof,
        }
    }
}
