//! Host configuration persistence
//!
//! A single JSON record loaded at startup. Missing or unparsable files fall
//! back to defaults; every update rewrites the whole file.

use hotdeploy_api::{DEFAULT_HOST, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "HOTDEPLOY_CONFIG";

/// Error type for config store operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Listen address and authentication settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    pub enable_auth: bool,
    pub token: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            enable_auth: false,
            token: String::new(),
        }
    }
}

impl HostConfig {
    /// `host:port` to bind
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether a client presenting `token` may connect
    pub fn accepts(&self, token: Option<&str>) -> bool {
        if !self.enable_auth {
            return true;
        }
        matches!(token, Some(t) if !self.token.is_empty() && t == self.token)
    }
}

/// File-backed store for [`HostConfig`]
pub struct HostConfigStore {
    path: PathBuf,
    config: RwLock<HostConfig>,
}

impl HostConfigStore {
    /// Load from `path`, using defaults when absent or unparsable
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        let config = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HostConfig>(&bytes) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Config unparsable, using defaults");
                    HostConfig::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                HostConfig::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Config unreadable, using defaults");
                HostConfig::default()
            }
        };

        Self {
            path,
            config: RwLock::new(config),
        }
    }

    /// Load from the path given by the environment, or the per-user default
    pub fn load_default() -> Self {
        Self::load(default_config_path())
    }

    /// Get the store file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current config snapshot
    pub fn get(&self) -> HostConfig {
        self.config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Apply `change` and rewrite the file in full
    pub fn update(&self, change: impl FnOnce(&mut HostConfig)) -> Result<HostConfig, ConfigError> {
        let updated = {
            let mut config = self
                .config
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            change(&mut config);
            config.clone()
        };
        self.save(&updated)?;
        Ok(updated)
    }

    fn save(&self, config: &HostConfig) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let file = File::create(&self.path).map_err(write_err)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, config)?;
        Ok(())
    }
}

impl std::fmt::Debug for HostConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfigStore")
            .field("path", &self.path)
            .finish()
    }
}

/// `$HOTDEPLOY_CONFIG`, else `<config dir>/hotdeploy/config.json`
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
    config_dir.join("hotdeploy").join("config.json")
}
