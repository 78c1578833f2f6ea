//! # hotdeploy: live plugin deployment runtime
//!
//! Shared plumbing for the hotdeploy host service and its clients:
//!
//! - [`frame`]: envelope encoding and shape-based decoding
//! - [`endpoint`]: per-connection call correlation, deadlines and request serving
//! - [`transport`]: WebSocket halves and the reader/writer loops
//! - [`tracing_support`]: logging initialisation for the binaries
//!
//! ```rust,ignore
//! use hotdeploy::{transport, Caller, RpcEndpoint};
//! use std::sync::Arc;
//!
//! let (writer, reader) = transport::connect("ws://127.0.0.1:8998", None).await?;
//! let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//! transport::spawn_writer(writer, rx);
//! let endpoint = Arc::new(RpcEndpoint::new(tx));
//! let pump_endpoint = endpoint.clone();
//! tokio::spawn(async move { transport::pump(reader, &pump_endpoint).await });
//! let pong = endpoint.call("ping", vec![], hotdeploy_api::CALL_TIMEOUT).await?;
//! ```

pub mod endpoint;
pub mod frame;
pub mod tracing_support;
pub mod transport;

pub use endpoint::{CallError, Caller, RequestHandler, RpcEndpoint};
pub use frame::FrameError;
pub use tracing_support::{init_subscriber, init_subscriber_with_config, TracingConfig, TracingFormat};
pub use transport::{CloseReason, Outbound, TransportError};

pub use hotdeploy_api as api;

/// Version string reported by the host and client binaries
pub fn version_short() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
