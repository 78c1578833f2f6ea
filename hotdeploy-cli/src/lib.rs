//! hotdeploy-cli: client side of hotdeploy
//!
//! Connects to a host, deploys build output into its managed root and
//! activates it, optionally on every source change. The `hotdeploy` binary
//! wraps this in a one-shot deploy mode and an interactive shell.
//!
//! ```rust,ignore
//! use hotdeploy_cli::{deploy, ConnectionManager, Deployer, TransferMode};
//!
//! let (connection, _events) = ConnectionManager::new("127.0.0.1:8998", None);
//! let outcome = deploy::deploy_connected(
//!     &connection,
//!     &Deployer::default(),
//!     TransferMode::Auto,
//!     "plugin/build".as_ref(),
//! )
//! .await?;
//! println!("{} activated: {}", outcome.identity, outcome.activated);
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod connection;
pub mod deploy;
pub mod secondary;
pub mod shell;
pub mod transfer;
pub mod watcher;

pub use api::HostApi;
pub use cli::Cli;
pub use config::{ClientConfig, ClientConfigError, SecondarySet};
pub use connection::{
    AuthState, Capabilities, ConnectionError, ConnectionManager, ConnectionState, ConnectionStatus,
};
pub use deploy::{Activation, DeployError, DeployJob, DeployOutcome, DeployTarget, Deployer};
pub use secondary::{SecondaryError, SecondaryReport};
pub use shell::{ReplCommand, Reply, Shell, ShellError};
pub use transfer::{TransferError, TransferMode, TransferStrategy};
pub use watcher::{ChangeWatcher, WatchMode, WatchSignal, WatcherError};
