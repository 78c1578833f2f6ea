//! Moving build output into the host's managed root
//!
//! Two strategies: a plain filesystem copy when client and host share a disk,
//! and a `removeDir` + `writeFiles` call pair otherwise. Both replace the
//! destination wholesale.

use crate::api::HostApi;
use base64::Engine;
use hotdeploy::CallError;
use hotdeploy_api::FileEntry;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    #[error("Cannot copy {} into {}: one contains the other", from.display(), to.display())]
    Overlap { from: PathBuf, to: PathBuf },

    #[error(transparent)]
    Call(#[from] CallError),
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> TransferError {
    let path = path.to_path_buf();
    move |source| TransferError::Io {
        action,
        path,
        source,
    }
}

/// Transfer strategy requested on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TransferMode {
    /// Remote when the host supports it, local copy otherwise
    #[default]
    Auto,
    Local,
    Remote,
}

/// Strategy actually used for a deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    Local,
    Remote,
}

impl TransferMode {
    pub fn resolve(self, remote_supported: bool) -> TransferStrategy {
        match self {
            TransferMode::Local => TransferStrategy::Local,
            TransferMode::Remote => TransferStrategy::Remote,
            TransferMode::Auto if remote_supported => TransferStrategy::Remote,
            TransferMode::Auto => TransferStrategy::Local,
        }
    }
}

impl std::fmt::Display for TransferStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStrategy::Local => f.write_str("local"),
            TransferStrategy::Remote => f.write_str("remote"),
        }
    }
}

/// Absolute, symlink-free form of `path`, which need not exist yet
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    // Resolve the deepest existing ancestor and re-attach the rest
    let mut missing = Vec::new();
    let mut current = absolute.as_path();
    loop {
        if let Ok(resolved) = current.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(resolved, |acc: PathBuf, part| acc.join(part));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                current = parent;
            }
            _ => return absolute,
        }
    }
}

/// Whether `a` and `b` are the same directory or one lies inside the other
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    let (a, b) = (resolve_path(a), resolve_path(b));
    a.starts_with(&b) || b.starts_with(&a)
}

/// Every regular file under `dir`, as paths relative to it
pub async fn list_files(dir: &Path) -> Result<Vec<PathBuf>, TransferError> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        let current = dir.join(&relative);
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .map_err(io_error("read", &current))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("read", &current))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(io_error("inspect", &entry.path()))?;
            let child = relative.join(entry.file_name());
            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                files.push(child);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Forward-slash form of a relative path
pub fn to_wire_path(prefix: &str, relative: &Path) -> Result<String, TransferError> {
    let mut wire = prefix.trim_end_matches('/').to_string();
    for component in relative.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| TransferError::NonUtf8Path(relative.to_path_buf()))?;
        if !wire.is_empty() {
            wire.push('/');
        }
        wire.push_str(part);
    }
    Ok(wire)
}

/// Replace `dest` with a copy of `source`; returns the number of files copied
pub async fn copy_local(source: &Path, dest: &Path) -> Result<usize, TransferError> {
    // Removing `dest` first would otherwise delete the source too
    if paths_overlap(source, dest) {
        return Err(TransferError::Overlap {
            from: source.to_path_buf(),
            to: dest.to_path_buf(),
        });
    }

    match tokio::fs::remove_dir_all(dest).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error("remove", dest)(e)),
    }

    let files = list_files(source).await?;
    tokio::fs::create_dir_all(dest)
        .await
        .map_err(io_error("create", dest))?;

    for relative in &files {
        let from = source.join(relative);
        let to = dest.join(relative);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error("create", parent))?;
        }
        tokio::fs::copy(&from, &to)
            .await
            .map_err(io_error("copy", &from))?;
    }

    tracing::debug!(source = %source.display(), dest = %dest.display(), files = files.len(), "Copied locally");
    Ok(files.len())
}

/// Read `source` into wire entries placed under `prefix`
pub async fn collect_entries(source: &Path, prefix: &str) -> Result<Vec<FileEntry>, TransferError> {
    let engine = base64::engine::general_purpose::STANDARD;
    let mut entries = Vec::new();
    for relative in list_files(source).await? {
        let path = source.join(&relative);
        let bytes = tokio::fs::read(&path).await.map_err(io_error("read", &path))?;
        entries.push(FileEntry {
            path: to_wire_path(prefix, &relative)?,
            content: engine.encode(bytes),
        });
    }
    Ok(entries)
}

/// Replace `<root>/<prefix>` on the host with the contents of `source`
pub async fn copy_remote(
    api: &HostApi<'_>,
    source: &Path,
    prefix: &str,
) -> Result<usize, TransferError> {
    let entries = collect_entries(source, prefix).await?;
    let count = entries.len();

    api.remove_dir(prefix).await?;
    if count > 0 {
        api.write_files(entries).await?;
    }

    tracing::debug!(source = %source.display(), prefix, files = count, "Copied remotely");
    Ok(count)
}
