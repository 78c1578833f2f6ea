//! hotdeploy client binary
//!
//! # Usage
//!
//! ```bash
//! # Interactive shell against the local host
//! hotdeploy
//!
//! # Deploy once, exit non-zero on failure (for build-tool hooks)
//! hotdeploy --deploy ./build
//!
//! # Redeploy every unit under ./plugins whenever its sources change
//! hotdeploy 192.168.1.20:8998 --token s3cret --watch ./plugins --watch-all
//! ```

use anyhow::Context;
use clap::Parser;
use hotdeploy::init_subscriber_with_config;
use hotdeploy_cli::shell::{format_outcome, Shell};
use hotdeploy_cli::{deploy, Cli, ClientConfig, ConnectionError, ConnectionManager, Deployer};
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_subscriber_with_config(cli.tracing_config());

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(error = ?e, "Client failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = ClientConfig::discover(cli.config.as_deref())
        .context("Failed to load client config")?;
    let deployer = Deployer::new(config.secondary);
    let (connection, events) = ConnectionManager::new(&cli.address, cli.token.clone());

    if let Some(dir) = &cli.deploy {
        let outcome = deploy::deploy_connected(&connection, &deployer, cli.transfer, dir)
            .await
            .with_context(|| format!("Deploy of {} failed", dir.display()))?;
        println!("{}", format_outcome(&outcome));
        connection.close();
        return Ok(if outcome.activated {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    match connection.connect().await {
        Ok(_) => println!("Connected to {}", connection.url()),
        Err(ConnectionError::AuthRejected) => {
            eprintln!("Error: {}", ConnectionError::AuthRejected);
            return Ok(ExitCode::FAILURE);
        }
        // The shell reconnects on the next command
        Err(e) => eprintln!("Warning: {}", e),
    }

    let mut shell = Shell::new(Arc::new(connection), deployer, cli.transfer);
    if let Some(path) = &cli.watch {
        let message = shell
            .watch(path.clone(), cli.watch_mode())
            .await
            .with_context(|| format!("Failed to watch {}", path.display()))?;
        println!("{}", message);
    }

    match shell.run(events).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("Error: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
