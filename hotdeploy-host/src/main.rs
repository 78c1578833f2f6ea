//! hotdeploy-host binary
//!
//! # Usage
//!
//! ```bash
//! # Serve the default managed root on 127.0.0.1:8998
//! hotdeploy-host
//!
//! # Require a token and remember it
//! hotdeploy-host --token s3cret --save
//! ```

use anyhow::Context;
use clap::Parser;
use hotdeploy::{init_subscriber_with_config, TracingConfig, TracingFormat};
use hotdeploy_host::{
    default_config_path, default_managed_root, DirectoryUnitManager, HostConfigStore, HostServer,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "hotdeploy-host", version, about = "Host service for live unit deployment")]
struct Args {
    /// Config file (defaults to $HOTDEPLOY_CONFIG or the per-user config dir)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Managed root holding one directory per unit
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Listen host, overriding the config file
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overriding the config file
    #[arg(long)]
    port: Option<u16>,

    /// Require this token from clients (enables authentication)
    #[arg(long, env = "HOTDEPLOY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Write the effective settings back to the config file
    #[arg(long)]
    save: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let format = if args.json_logs {
        TracingFormat::Json
    } else {
        TracingFormat::Compact
    };
    init_subscriber_with_config(TracingConfig {
        format,
        ..TracingConfig::default()
    });

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "Host failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let store = HostConfigStore::load(args.config.unwrap_or_else(default_config_path));

    let apply = |config: &mut hotdeploy_host::HostConfig| {
        if let Some(host) = &args.host {
            config.host = host.clone();
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(token) = &args.token {
            config.token = token.clone();
            config.enable_auth = !token.is_empty();
        }
    };

    let config = if args.save {
        let config = store
            .update(apply)
            .with_context(|| format!("Failed to save {}", store.path().display()))?;
        tracing::info!(path = %store.path().display(), "Config saved");
        config
    } else {
        let mut config = store.get();
        apply(&mut config);
        config
    };

    let root = args.root.unwrap_or_else(default_managed_root);
    let manager = DirectoryUnitManager::new(&root)
        .with_context(|| format!("Failed to open managed root {}", root.display()))?;
    let registered = manager
        .scan()
        .await
        .with_context(|| format!("Failed to scan {}", root.display()))?;
    tracing::info!(root = %root.display(), units = registered.len(), "Managed root ready");

    let server = HostServer::bind(config, Arc::new(manager)).await?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
