//! Client configuration
//!
//! Optional JSON file describing secondary artifact sets that are built and
//! shipped alongside every deploy:
//!
//! ```json
//! {
//!   "secondary": [
//!     { "name": "webui", "source": "webui/dist", "command": "npm run build", "subdir": "webui" }
//!   ]
//! }
//! ```
//!
//! Relative `source` paths are resolved against the config file's directory,
//! which is also where `command` runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File looked up in the working directory when no `--config` is given
pub const LOCAL_CONFIG_FILE: &str = "hotdeploy.json";

#[derive(Debug, Error)]
pub enum ClientConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One secondary artifact set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondarySet {
    pub name: String,
    /// Directory whose contents are shipped
    pub source: PathBuf,
    /// Shell command producing `source`, run before every copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Destination subdirectory inside the unit
    pub subdir: String,
    /// Where `command` runs
    #[serde(skip)]
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub secondary: Vec<SecondarySet>,
}

impl ClientConfig {
    /// Load and resolve a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClientConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ClientConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ClientConfig =
            serde_json::from_slice(&bytes).map_err(|source| ClientConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        for set in &mut config.secondary {
            if set.source.is_relative() {
                set.source = base.join(&set.source);
            }
            set.workdir = Some(base.clone());
        }

        tracing::debug!(path = %path.display(), sets = config.secondary.len(), "Client config loaded");
        Ok(config)
    }

    /// Explicit path, else `./hotdeploy.json`, else `<config dir>/hotdeploy/client.json`.
    ///
    /// Only an explicit path that cannot be read is an error.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ClientConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let candidates = [
            Some(PathBuf::from(LOCAL_CONFIG_FILE)),
            dirs::config_dir().map(|d| d.join("hotdeploy").join("client.json")),
        ];
        for candidate in candidates.into_iter().flatten() {
            if candidate.is_file() {
                return Self::load(candidate);
            }
        }
        Ok(Self::default())
    }
}
