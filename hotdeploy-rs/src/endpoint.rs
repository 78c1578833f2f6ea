//! Per-connection RPC endpoint
//!
//! Correlates outgoing calls with incoming responses by numeric id, applies a
//! per-call deadline and serves incoming requests through an optional
//! [`RequestHandler`]. The same type is used on the host and on every client.
//!
//! A pending call is settled exactly once: whichever of the response path or
//! the timeout path removes it from the pending map wins. A late response for
//! a timed-out id finds nothing and is dropped.

use crate::frame;
use crate::transport::Outbound;
use async_trait::async_trait;
use hotdeploy_api::{Envelope, Notification, Request, Response, RpcErrorObject};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Errors surfaced to the issuer of a call
#[derive(Debug, Error)]
pub enum CallError {
    #[error("Call `{method}` timed out after {}ms", after.as_millis())]
    Timeout { method: String, after: Duration },

    #[error("Call `{method}` failed with code {code}: {message}")]
    Remote {
        method: String,
        code: i64,
        message: String,
    },

    #[error("Connection closed while calling `{method}`")]
    Closed { method: String },

    #[error("Failed to encode call `{method}`: {source}")]
    Encode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unexpected result from `{method}`: {reason}")]
    Decode { method: String, reason: String },
}

impl CallError {
    /// Remote error code, if the host answered with an error
    pub fn code(&self) -> Option<i64> {
        match self {
            CallError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }
}

/// Anything that can issue a call and await its settlement
#[async_trait]
pub trait Caller: Send + Sync {
    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError>;
}

/// Services incoming requests on one side of a connection
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcErrorObject>;
}

struct PendingCall {
    method: String,
    created: Instant,
    settle: oneshot::Sender<Result<Value, RpcErrorObject>>,
}

/// RPC endpoint bound to one connection's outbound queue
pub struct RpcEndpoint {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: Option<mpsc::UnboundedSender<Notification>>,
    handler: Option<Arc<dyn RequestHandler>>,
}

impl RpcEndpoint {
    /// Create an endpoint that only issues calls
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
            events: None,
            handler: None,
        }
    }

    /// Deliver incoming notifications to `sink`
    pub fn with_event_sink(mut self, sink: mpsc::UnboundedSender<Notification>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Answer incoming requests with `handler`
    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Number of calls awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending_map().len()
    }

    /// Push a notification to the peer
    pub fn notify(&self, notification: Notification) -> Result<(), CallError> {
        let method = notification.method.clone();
        let text = frame::encode(&Envelope::from(notification)).map_err(|source| {
            CallError::Encode {
                method: method.clone(),
                source,
            }
        })?;
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| CallError::Closed { method })
    }

    /// Process one incoming text frame.
    ///
    /// Malformed frames and responses with no pending call are dropped.
    pub fn handle_frame(&self, text: &str) {
        let envelope = match frame::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::trace!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        match envelope {
            Envelope::Response(response) => self.settle(response),
            Envelope::Notification(notification) => {
                if let Some(sink) = &self.events {
                    let _ = sink.send(notification);
                }
            }
            Envelope::Request(request) => self.serve(request),
        }
    }

    /// Reject every pending call; used when the connection goes away
    pub fn close(&self) {
        let drained: Vec<(u64, PendingCall)> = self.pending_map().drain().collect();
        for (id, call) in drained {
            tracing::debug!(id, method = %call.method, "Abandoning pending call");
            // Dropping the sender wakes the caller with `Closed`
            drop(call.settle);
        }
    }

    fn settle(&self, response: Response) {
        let Some(call) = self.pending_map().remove(&response.id) else {
            tracing::debug!(id = response.id, "Dropping response with no pending call");
            return;
        };
        tracing::trace!(
            id = response.id,
            method = %call.method,
            elapsed_ms = call.created.elapsed().as_millis() as u64,
            "Call settled"
        );
        let _ = call.settle.send(response.into_outcome());
    }

    fn serve(&self, request: Request) {
        let outbound = self.outbound.clone();
        let Some(handler) = self.handler.clone() else {
            let response = Response::err(request.id, RpcErrorObject::method_not_found(&request.method));
            send_response(&outbound, response);
            return;
        };

        tokio::spawn(async move {
            let id = request.id;
            let method = request.method.clone();
            // The inner task isolates panics so the request is still answered
            let task = tokio::spawn(async move {
                handler.handle(&request.method, request.params).await
            });
            let response = match task.await {
                Ok(Ok(result)) => Response::ok(id, result),
                Ok(Err(error)) => Response::err(id, error),
                Err(join_error) => {
                    tracing::error!(id, method = %method, error = %join_error, "Request handler failed");
                    Response::err(
                        id,
                        RpcErrorObject::internal(format!("Handler for {} failed", method)),
                    )
                }
            };
            send_response(&outbound, response);
        });
    }

    fn pending_map(&self) -> MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn send_response(outbound: &mpsc::UnboundedSender<Outbound>, response: Response) {
    let id = response.id;
    match frame::encode(&Envelope::from(response)) {
        Ok(text) => {
            if outbound.send(Outbound::Text(text)).is_err() {
                tracing::debug!(id, "Connection closed before response was sent");
            }
        }
        Err(e) => tracing::error!(id, error = %e, "Failed to encode response"),
    }
}

#[async_trait]
impl Caller for RpcEndpoint {
    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = frame::encode(&Envelope::from(Request::new(id, method, params))).map_err(
            |source| CallError::Encode {
                method: method.to_string(),
                source,
            },
        )?;

        let (settle, settled) = oneshot::channel();
        self.pending_map().insert(
            id,
            PendingCall {
                method: method.to_string(),
                created: Instant::now(),
                settle,
            },
        );

        if self.outbound.send(Outbound::Text(text)).is_err() {
            self.pending_map().remove(&id);
            return Err(CallError::Closed {
                method: method.to_string(),
            });
        }

        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(CallError::Remote {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            }),
            Ok(Err(_)) => Err(CallError::Closed {
                method: method.to_string(),
            }),
            Err(_) => {
                self.pending_map().remove(&id);
                Err(CallError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }
}

impl std::fmt::Debug for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEndpoint")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("pending", &self.pending_count())
            .field("serves_requests", &self.handler.is_some())
            .finish()
    }
}
