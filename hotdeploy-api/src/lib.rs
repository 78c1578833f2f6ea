//! hotdeploy-api: Shared types for the hotdeploy protocol
//!
//! This crate defines the protocol between the long-lived host service and
//! its clients (the interactive shell and build-tool triggered deploys).
//! Communication uses JSON envelopes over a WebSocket.

use std::time::Duration;

pub mod envelope;
pub mod method;
pub mod unit;

pub use envelope::{Envelope, Notification, Request, Response, RpcErrorObject};
pub use method::{FileEntry, HostMethod, HostRequest};
pub use unit::{
    is_valid_identity, DebugInfo, Greeting, ManifestError, RuntimeStatus, UnitAction, UnitEvent,
    UnitManifest, UnitSummary,
};

/// Protocol version carried by every envelope
pub const PROTOCOL_VERSION: u32 = 1;

/// Default listen port of the host service
pub const DEFAULT_PORT: u16 = 8998;

/// Default listen address of the host service (loopback only)
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Identity of the host service itself; destructive calls against it are refused
pub const SELF_ID: &str = "hotdeploy";

/// Name of the descriptor file inside every deployable unit
pub const MANIFEST_FILE: &str = "manifest.json";

/// Header carrying the shared-secret token at connect time
pub const TOKEN_HEADER: &str = "x-hotdeploy-token";

/// Query parameter accepted as an alternative to [`TOKEN_HEADER`]
pub const TOKEN_QUERY_PARAM: &str = "token";

/// WebSocket close code sent when authentication fails
pub const AUTH_REJECTED_CLOSE_CODE: u16 = 4001;

/// Notification sent by the host right after a connection is accepted
pub const GREETING_METHOD: &str = "hello";

/// Notification broadcast after a unit changed state on the host
pub const UNIT_CHANGED_EVENT: &str = "unitChanged";

/// Literal answer to `ping`
pub const PONG: &str = "pong";

/// Bound on establishing a connection and receiving the greeting
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for interactive calls
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for transfer and activation calls issued by a deploy
pub const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default debounce window of the change watcher
pub const DEBOUNCE: Duration = Duration::from_millis(400);

/// Error codes carried in error Responses
pub mod codes {
    /// Method is not part of the operation table
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Parameters did not match the operation's contract
    pub const INVALID_PARAMS: i64 = -32602;
    /// Handler failed unexpectedly
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Plugin-management collaborator reported a failure
    pub const UNIT_ERROR: i64 = -32000;
    /// `reloadUnit` targeted the host service itself
    pub const SELF_RELOAD_REFUSED: i64 = -32010;
    /// `unregisterUnit` targeted the host service itself
    pub const SELF_UNREGISTER_REFUSED: i64 = -32011;
}
