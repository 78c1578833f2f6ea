//! Unit descriptors and host summaries

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reading a unit manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Manifest has no `name` field")]
    MissingIdentity,

    #[error("Manifest name '{0}' cannot be used as a directory name")]
    InvalidIdentity(String),
}

/// Descriptor carried inside every deployable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitManifest {
    /// Unit identity; also the directory name under the managed root
    pub name: String,

    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Unit version (semver)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl UnitManifest {
    /// Parse and validate manifest bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ManifestError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Raw {
            #[serde(default)]
            name: Option<String>,
            #[serde(default)]
            display_name: Option<String>,
            #[serde(default)]
            version: Option<String>,
        }

        let raw: Raw = serde_json::from_slice(bytes).map_err(ManifestError::Parse)?;
        let name = raw
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or(ManifestError::MissingIdentity)?;

        if !is_valid_identity(&name) {
            return Err(ManifestError::InvalidIdentity(name));
        }

        Ok(Self {
            name,
            display_name: raw.display_name,
            version: raw.version,
        })
    }

    /// Display name, falling back to the identity
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Whether `name` is usable as a single directory component
pub fn is_valid_identity(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', ':'])
        && !name.chars().any(char::is_control)
}

/// Runtime status of a unit on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Unloaded,
    Loaded,
    Disabled,
    Error,
}

/// Serialized unit summary returned by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitSummary {
    pub id: String,
    /// Directory name under the managed root
    pub file_id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub enabled: bool,
    pub loaded: bool,
    pub runtime_status: RuntimeStatus,
}

/// Host operating parameters returned by `getDebugInfo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub version: String,
    pub total_units: usize,
    pub loaded_units: usize,
    pub managed_root_path: String,
    pub uptime_seconds: u64,
}

/// Payload of the greeting notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Greeting {
    pub version: String,
    pub total_units: usize,
    pub loaded_units: usize,
    pub self_id: String,
}

/// What happened to a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitAction {
    Registered,
    Enabled,
    Disabled,
    Loaded,
    Reloaded,
    Unregistered,
}

/// Payload of the `unitChanged` broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitEvent {
    pub id: String,
    pub action: UnitAction,
}
