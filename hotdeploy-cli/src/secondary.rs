//! Secondary artifact sets
//!
//! Each configured set is optionally rebuilt with a shell command and then
//! copied into a subdirectory of the deployed unit. Sets are independent: a
//! failure is recorded and the next set still runs.

use crate::api::HostApi;
use crate::config::SecondarySet;
use crate::transfer::{self, TransferError, TransferStrategy};
use std::path::{Component, Path};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum SecondaryError {
    #[error("Subdirectory '{0}' must be a relative path without '..'")]
    InvalidSubdir(String),

    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Build {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Source directory {0} does not exist")]
    MissingSource(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Outcome of one secondary set
#[derive(Debug)]
pub struct SecondaryReport {
    pub name: String,
    pub result: Result<usize, SecondaryError>,
}

/// Where a deploy writes its primary output
#[derive(Clone, Copy)]
pub enum Destination<'a> {
    /// Unit directory on a shared filesystem
    Local(&'a Path),
    /// Unit identity on the host, reached through remote calls
    Remote { api: &'a HostApi<'a>, identity: &'a str },
}

impl Destination<'_> {
    pub fn strategy(&self) -> TransferStrategy {
        match self {
            Destination::Local(_) => TransferStrategy::Local,
            Destination::Remote { .. } => TransferStrategy::Remote,
        }
    }
}

fn validate_subdir(subdir: &str) -> Result<(), SecondaryError> {
    let path = Path::new(subdir);
    let valid = !subdir.is_empty()
        && !subdir.contains('\\')
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        && path.components().any(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(SecondaryError::InvalidSubdir(subdir.to_string()))
    }
}

async fn run_build(set: &SecondarySet, command: &str) -> Result<(), SecondaryError> {
    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    if let Some(workdir) = &set.workdir {
        cmd.current_dir(workdir);
    }

    tracing::info!(set = %set.name, command, "Building secondary set");
    let output = cmd.output().await.map_err(|source| SecondaryError::Spawn {
        command: command.to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(SecondaryError::Build {
            command: command.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Build and ship one set
pub async fn ship(set: &SecondarySet, dest: Destination<'_>) -> Result<usize, SecondaryError> {
    validate_subdir(&set.subdir)?;

    if let Some(command) = set.command.as_deref().filter(|c| !c.trim().is_empty()) {
        run_build(set, command).await?;
    }

    if !set.source.is_dir() {
        return Err(SecondaryError::MissingSource(
            set.source.display().to_string(),
        ));
    }

    let copied = match dest {
        Destination::Local(unit_dir) => {
            transfer::copy_local(&set.source, &unit_dir.join(&set.subdir)).await?
        }
        Destination::Remote { api, identity } => {
            let prefix = format!("{}/{}", identity, set.subdir.trim_matches('/'));
            transfer::copy_remote(api, &set.source, &prefix).await?
        }
    };
    Ok(copied)
}

/// Ship every set, collecting one report per set
pub async fn ship_all(sets: &[SecondarySet], dest: Destination<'_>) -> Vec<SecondaryReport> {
    let mut reports = Vec::with_capacity(sets.len());
    for set in sets {
        let result = ship(set, dest).await;
        match &result {
            Ok(files) => tracing::info!(set = %set.name, files, "Secondary set shipped"),
            Err(e) => tracing::warn!(set = %set.name, error = %e, "Secondary set failed"),
        }
        reports.push(SecondaryReport {
            name: set.name.clone(),
            result,
        });
    }
    reports
}
