//! Deploy orchestrator
//!
//! A deploy reads the unit identity from the build output's manifest, moves
//! the output into the host's managed root under a directory named after the
//! identity, ships any secondary artifact sets and finally activates the unit:
//! `reloadUnit` when the host already knows it, otherwise `loadDirectoryUnit`
//! followed by a best-effort `setUnitStatus` + `loadUnitById`.
//!
//! Nothing remote happens until the manifest has been read. Deploys of the
//! same identity within one process run one at a time.

use crate::api::HostApi;
use crate::config::SecondarySet;
use crate::connection::{ConnectionError, ConnectionManager};
use crate::secondary::{self, Destination, SecondaryReport};
use crate::transfer::{self, TransferError, TransferMode, TransferStrategy};
use hotdeploy::{CallError, Caller};
use hotdeploy_api::{UnitManifest, ACTIVATION_TIMEOUT, MANIFEST_FILE};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Cannot deploy {dir}: {reason}")]
    Precondition { dir: PathBuf, reason: String },

    #[error("Transfer of {identity} failed: {source}")]
    Transfer {
        identity: String,
        #[source]
        source: TransferError,
    },

    #[error("Activation of {identity} failed: {source}")]
    Activation {
        identity: String,
        #[source]
        source: CallError,
    },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl DeployError {
    fn precondition(dir: &Path, reason: impl Into<String>) -> Self {
        DeployError::Precondition {
            dir: dir.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// How the unit was made live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Host already knew the unit and reloaded it
    Reloaded,
    /// Host registered the unit from its directory
    Registered,
}

#[derive(Debug)]
pub struct DeployOutcome {
    pub identity: String,
    pub activated: bool,
    pub activation: Activation,
    pub strategy: TransferStrategy,
    pub files: usize,
    pub secondary: Vec<SecondaryReport>,
}

/// A build output whose identity has been read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployJob {
    pub source: PathBuf,
    pub identity: String,
}

impl DeployJob {
    /// Read the manifest in `source`; fails before any remote effect
    pub async fn prepare(source: impl Into<PathBuf>) -> Result<Self, DeployError> {
        let source = source.into();
        if !source.is_dir() {
            return Err(DeployError::precondition(&source, "not a directory"));
        }

        let manifest_path = source.join(MANIFEST_FILE);
        let bytes = tokio::fs::read(&manifest_path).await.map_err(|e| {
            DeployError::precondition(&source, format!("cannot read {}: {}", MANIFEST_FILE, e))
        })?;
        let manifest = UnitManifest::from_slice(&bytes)
            .map_err(|e| DeployError::precondition(&source, e.to_string()))?;

        Ok(Self {
            source,
            identity: manifest.name,
        })
    }
}

/// Where deploys land on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub strategy: TransferStrategy,
    /// Host's managed root, required for local copies
    pub managed_root: Option<PathBuf>,
}

/// Per-identity serialization of deploys
#[derive(Debug, Clone, Default)]
pub struct DeployLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DeployLocks {
    pub async fn acquire(&self, identity: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            locks.entry(identity.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Runs deploy jobs
#[derive(Debug, Clone, Default)]
pub struct Deployer {
    secondary: Vec<SecondarySet>,
    locks: DeployLocks,
}

impl Deployer {
    pub fn new(secondary: Vec<SecondarySet>) -> Self {
        Self {
            secondary,
            locks: DeployLocks::default(),
        }
    }

    /// Prepare and run a deploy of `source`
    pub async fn deploy(
        &self,
        caller: &dyn Caller,
        target: &DeployTarget,
        source: &Path,
    ) -> Result<DeployOutcome, DeployError> {
        let job = DeployJob::prepare(source).await?;
        self.run(caller, target, &job).await
    }

    /// Transfer and activate a prepared job
    pub async fn run(
        &self,
        caller: &dyn Caller,
        target: &DeployTarget,
        job: &DeployJob,
    ) -> Result<DeployOutcome, DeployError> {
        if let Some(root) = &target.managed_root {
            let dest = root.join(&job.identity);
            if transfer::paths_overlap(&job.source, &dest) {
                return Err(DeployError::precondition(
                    &job.source,
                    format!("build output overlaps its destination {}", dest.display()),
                ));
            }
        }

        let unit_dir = match (target.strategy, &target.managed_root) {
            (TransferStrategy::Local, Some(root)) => Some(root.join(&job.identity)),
            (TransferStrategy::Local, None) => {
                return Err(DeployError::precondition(
                    &job.source,
                    "host did not report its managed root; local copy impossible",
                ))
            }
            (TransferStrategy::Remote, _) => None,
        };

        let _guard = self.locks.acquire(&job.identity).await;
        tracing::info!(unit = %job.identity, strategy = %target.strategy, "Deploying");

        let api = HostApi::new(caller).with_timeout(ACTIVATION_TIMEOUT);
        let transfer_error = |source| DeployError::Transfer {
            identity: job.identity.clone(),
            source,
        };

        let files = match &unit_dir {
            Some(dir) => transfer::copy_local(&job.source, dir)
                .await
                .map_err(transfer_error)?,
            None => transfer::copy_remote(&api, &job.source, &job.identity)
                .await
                .map_err(transfer_error)?,
        };

        let destination = match &unit_dir {
            Some(dir) => Destination::Local(dir),
            None => Destination::Remote {
                api: &api,
                identity: &job.identity,
            },
        };
        let secondary = secondary::ship_all(&self.secondary, destination).await;

        let (activation, activated) = activate(&api, &job.identity).await?;
        tracing::info!(unit = %job.identity, ?activation, activated, files, "Deployed");

        Ok(DeployOutcome {
            identity: job.identity.clone(),
            activated,
            activation,
            strategy: target.strategy,
            files,
            secondary,
        })
    }
}

async fn activate(api: &HostApi<'_>, identity: &str) -> Result<(Activation, bool), DeployError> {
    let activation_error = |source| DeployError::Activation {
        identity: identity.to_string(),
        source,
    };

    if api.reload_unit(identity).await.map_err(activation_error)? {
        return Ok((Activation::Reloaded, true));
    }

    tracing::debug!(unit = %identity, "Unit not registered, loading from directory");
    let registered = api
        .load_directory_unit(identity)
        .await
        .map_err(activation_error)?;
    let mut activated = matches!(&registered, Value::Object(o) if o.get("loaded") == Some(&Value::Bool(true)));

    // Registration already succeeded; these only make sure the unit is live
    if let Err(e) = api.set_unit_status(identity, true).await {
        tracing::debug!(unit = %identity, error = %e, "Enable after registration failed");
    }
    match api.load_unit(identity).await {
        Ok(loaded) => activated |= loaded,
        Err(e) => tracing::debug!(unit = %identity, error = %e, "Load after registration failed"),
    }

    Ok((Activation::Registered, activated))
}

/// Resolve the transfer target for the connection's current session
pub fn target_for(connection: &ConnectionManager, mode: TransferMode) -> DeployTarget {
    DeployTarget {
        strategy: mode.resolve(connection.capabilities().remote_transfer),
        managed_root: connection
            .host_info()
            .map(|info| PathBuf::from(info.managed_root_path)),
    }
}

/// Deploy through a managed connection, reconnecting once if needed
pub async fn deploy_connected(
    connection: &ConnectionManager,
    deployer: &Deployer,
    mode: TransferMode,
    source: &Path,
) -> Result<DeployOutcome, DeployError> {
    let job = DeployJob::prepare(source).await?;
    let endpoint = connection.ensure_ready().await?;
    let target = target_for(connection, mode);
    deployer.run(&*endpoint, &target, &job).await
}
