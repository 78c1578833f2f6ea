//! hotdeploy-host: long-lived host service for hotdeploy
//!
//! Accepts client connections over WebSocket, authenticates them, answers the
//! host operation table against a [`UnitManager`] and fans unit events out to
//! every connected client.
//!
//! ```rust,ignore
//! use hotdeploy_host::{DirectoryUnitManager, HostConfig, HostServer};
//! use std::sync::Arc;
//!
//! let manager = DirectoryUnitManager::new("/srv/hotdeploy/units")?;
//! manager.scan().await?;
//! let server = HostServer::bind(HostConfig::default(), Arc::new(manager)).await?;
//! server.run().await?;
//! ```

pub mod config;
pub mod connections;
pub mod dispatcher;
pub mod files;
pub mod registry;
pub mod server;

pub use config::{default_config_path, ConfigError, HostConfig, HostConfigStore};
pub use connections::{ConnectionId, ConnectionSet, EventPublisher};
pub use dispatcher::HostDispatcher;
pub use files::{FileOpError, ManagedFiles};
pub use registry::{DirectoryUnitManager, UnitError, UnitManager};
pub use server::{HostServer, ServerError};

use std::path::PathBuf;

/// `<local data dir>/hotdeploy/units`
pub fn default_managed_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hotdeploy")
        .join("units")
}
