//! Command-line surface of the `hotdeploy` client

use crate::transfer::TransferMode;
use crate::watcher::WatchMode;
use clap::Parser;
use hotdeploy::{TracingConfig, TracingFormat};
use hotdeploy_api::{DEFAULT_HOST, DEFAULT_PORT};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "hotdeploy",
    version,
    about = "Deploy build output to a running hotdeploy host"
)]
pub struct Cli {
    /// Host address (`host:port`, or a full ws:// URL)
    #[arg(default_value_t = default_address())]
    pub address: String,

    /// Shared-secret token presented to the host
    #[arg(long, env = "HOTDEPLOY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Watch a unit directory and deploy it on change
    #[arg(long, value_name = "DIR", conflicts_with = "deploy")]
    pub watch: Option<PathBuf>,

    /// Treat every subdirectory of the watched directory as a unit
    #[arg(long, requires = "watch")]
    pub watch_all: bool,

    /// Deploy a build output once and exit
    #[arg(long, value_name = "DIR")]
    pub deploy: Option<PathBuf>,

    /// How files reach the host's managed root
    #[arg(long, value_enum, default_value_t = TransferMode::Auto)]
    pub transfer: TransferMode,

    /// Client config file with secondary artifact sets
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    pub verbose: bool,
}

fn default_address() -> String {
    format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT)
}

impl Cli {
    pub fn watch_mode(&self) -> WatchMode {
        if self.watch_all {
            WatchMode::Multi
        } else {
            WatchMode::Single
        }
    }

    /// Logging setup; the shell owns stdout so the default stays quiet
    pub fn tracing_config(&self) -> TracingConfig {
        if self.verbose {
            return TracingConfig::verbose();
        }
        let level = if std::env::var_os("RUST_LOG").is_some() {
            None
        } else {
            Some(tracing::Level::WARN)
        };
        TracingConfig {
            level,
            format: TracingFormat::Compact,
            timestamps: false,
            ..TracingConfig::default()
        }
    }
}
