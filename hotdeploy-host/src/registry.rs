//! Unit registry
//!
//! The host consults its plugin-management collaborator only through the
//! [`UnitManager`] trait. [`DirectoryUnitManager`] is the default
//! implementation: it tracks manifest-bearing directories under the managed
//! root and their enabled/loaded state.

use async_trait::async_trait;
use hotdeploy_api::{RuntimeStatus, UnitManifest, UnitSummary, MANIFEST_FILE};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors reported by a unit manager
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("Unit not found: {0}")]
    NotFound(String),

    #[error("Unit {0} is disabled")]
    Disabled(String),

    #[error("Unit {0} is already loaded")]
    AlreadyLoaded(String),

    #[error("Directory not found under managed root: {0}")]
    DirectoryNotFound(String),

    #[error("Invalid manifest in {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(String),
}

/// Operations the host needs from the plugin-management subsystem
#[async_trait]
pub trait UnitManager: Send + Sync + 'static {
    /// All registered units
    async fn units(&self) -> Vec<UnitSummary>;

    /// One unit by identity
    async fn unit(&self, id: &str) -> Option<UnitSummary>;

    /// Enable or disable a unit
    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, UnitError>;

    /// Load a registered, enabled unit
    async fn load(&self, id: &str) -> Result<bool, UnitError>;

    /// Forget a unit; `Ok(false)` if it was not registered
    async fn unregister(&self, id: &str) -> Result<bool, UnitError>;

    /// Reload a unit from disk; `Ok(false)` if it is not registered
    async fn reload(&self, id: &str) -> Result<bool, UnitError>;

    /// Register, enable and load the unit in `<root>/<name>`
    async fn load_directory(&self, name: &str) -> Result<UnitSummary, UnitError>;

    /// Managed root directory
    fn managed_root(&self) -> &Path;
}

struct UnitEntry {
    manifest: UnitManifest,
    dir_name: String,
    enabled: bool,
    loaded: bool,
    status: RuntimeStatus,
    generation: u64,
}

impl UnitEntry {
    fn summary(&self) -> UnitSummary {
        UnitSummary {
            id: self.manifest.name.clone(),
            file_id: self.dir_name.clone(),
            name: self.manifest.label().to_string(),
            version: self.manifest.version.clone(),
            enabled: self.enabled,
            loaded: self.loaded,
            runtime_status: self.status,
        }
    }
}

/// Directory-backed unit manager
#[derive(Clone)]
pub struct DirectoryUnitManager {
    root: Arc<PathBuf>,
    units: Arc<RwLock<HashMap<String, UnitEntry>>>,
}

impl DirectoryUnitManager {
    /// Create an empty manager over `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, UnitError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| UnitError::Io(format!("Failed to create {}: {}", root.display(), e)))?;
        Ok(Self {
            root: Arc::new(root),
            units: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Register (without loading) every manifest-bearing subdirectory.
    ///
    /// Returns the identities registered; directories with broken manifests
    /// are skipped with a warning.
    pub async fn scan(&self) -> Result<Vec<String>, UnitError> {
        let mut entries = tokio::fs::read_dir(self.root.as_path()).await.map_err(|e| {
            UnitError::Io(format!("Failed to read {}: {}", self.root.display(), e))
        })?;

        let mut registered = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() || !path.join(MANIFEST_FILE).exists() {
                continue;
            }
            let Some(dir_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            match read_manifest(&path).await {
                Ok(manifest) => {
                    let id = manifest.name.clone();
                    self.units.write().await.insert(
                        id.clone(),
                        UnitEntry {
                            manifest,
                            dir_name,
                            enabled: true,
                            loaded: false,
                            status: RuntimeStatus::Unloaded,
                            generation: 0,
                        },
                    );
                    tracing::info!(unit = %id, "Unit registered");
                    registered.push(id);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unit directory");
                }
            }
        }

        Ok(registered)
    }

    /// Number of reloads applied to a unit
    pub async fn generation(&self, id: &str) -> Option<u64> {
        self.units.read().await.get(id).map(|e| e.generation)
    }
}

async fn read_manifest(dir: &Path) -> Result<UnitManifest, UnitError> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| UnitError::Manifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    UnitManifest::from_slice(&bytes).map_err(|e| UnitError::Manifest {
        path,
        reason: e.to_string(),
    })
}

#[async_trait]
impl UnitManager for DirectoryUnitManager {
    async fn units(&self) -> Vec<UnitSummary> {
        let units = self.units.read().await;
        let mut summaries: Vec<UnitSummary> = units.values().map(UnitEntry::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    async fn unit(&self, id: &str) -> Option<UnitSummary> {
        self.units.read().await.get(id).map(UnitEntry::summary)
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, UnitError> {
        let mut units = self.units.write().await;
        let entry = units
            .get_mut(id)
            .ok_or_else(|| UnitError::NotFound(id.to_string()))?;

        entry.enabled = enabled;
        if !enabled {
            entry.loaded = false;
            entry.status = RuntimeStatus::Disabled;
        } else if entry.status == RuntimeStatus::Disabled {
            entry.status = RuntimeStatus::Unloaded;
        }
        tracing::info!(unit = %id, enabled, "Unit status changed");
        Ok(true)
    }

    async fn load(&self, id: &str) -> Result<bool, UnitError> {
        let mut units = self.units.write().await;
        let entry = units
            .get_mut(id)
            .ok_or_else(|| UnitError::NotFound(id.to_string()))?;

        if !entry.enabled {
            return Err(UnitError::Disabled(id.to_string()));
        }
        if entry.loaded {
            return Err(UnitError::AlreadyLoaded(id.to_string()));
        }
        entry.loaded = true;
        entry.status = RuntimeStatus::Loaded;
        tracing::info!(unit = %id, "Unit loaded");
        Ok(true)
    }

    async fn unregister(&self, id: &str) -> Result<bool, UnitError> {
        let removed = self.units.write().await.remove(id).is_some();
        if removed {
            tracing::info!(unit = %id, "Unit unregistered");
        }
        Ok(removed)
    }

    async fn reload(&self, id: &str) -> Result<bool, UnitError> {
        let dir_name = match self.units.read().await.get(id) {
            Some(entry) => entry.dir_name.clone(),
            None => return Ok(false),
        };

        let manifest = read_manifest(&self.root.join(&dir_name)).await;

        let mut units = self.units.write().await;
        // Unregistered while the manifest was being read
        let Some(entry) = units.get_mut(id) else {
            return Ok(false);
        };

        match manifest {
            Ok(manifest) => {
                entry.manifest = manifest;
                entry.generation += 1;
                if entry.enabled {
                    entry.loaded = true;
                    entry.status = RuntimeStatus::Loaded;
                }
                tracing::info!(unit = %id, generation = entry.generation, "Unit reloaded");
                Ok(true)
            }
            Err(e) => {
                entry.loaded = false;
                entry.status = RuntimeStatus::Error;
                Err(e)
            }
        }
    }

    async fn load_directory(&self, name: &str) -> Result<UnitSummary, UnitError> {
        if !hotdeploy_api::is_valid_identity(name) {
            return Err(UnitError::DirectoryNotFound(name.to_string()));
        }
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(UnitError::DirectoryNotFound(name.to_string()));
        }

        let manifest = read_manifest(&dir).await?;
        let id = manifest.name.clone();

        let mut units = self.units.write().await;
        let generation = units.get(&id).map(|e| e.generation + 1).unwrap_or(0);
        let entry = UnitEntry {
            manifest,
            dir_name: name.to_string(),
            enabled: true,
            loaded: true,
            status: RuntimeStatus::Loaded,
            generation,
        };
        let summary = entry.summary();
        units.insert(id.clone(), entry);

        tracing::info!(unit = %id, dir = %name, "Unit loaded from directory");
        Ok(summary)
    }

    fn managed_root(&self) -> &Path {
        &self.root
    }
}

impl std::fmt::Debug for DirectoryUnitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryUnitManager")
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_unit(root: &Path, dir: &str, manifest: &str) {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(MANIFEST_FILE), manifest).unwrap();
    }

    #[tokio::test]
    async fn test_load_directory_registers_and_loads() {
        let temp = TempDir::new().unwrap();
        write_unit(temp.path(), "sample", r#"{"name": "sample", "version": "1.0.0"}"#);

        let manager = DirectoryUnitManager::new(temp.path()).unwrap();
        assert!(manager.units().await.is_empty());

        let summary = manager.load_directory("sample").await.unwrap();
        assert_eq!(summary.id, "sample");
        assert!(summary.loaded);
        assert!(summary.enabled);
        assert_eq!(summary.runtime_status, RuntimeStatus::Loaded);

        let info = manager.unit("sample").await.unwrap();
        assert_eq!(info.version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn test_load_directory_missing() {
        let temp = TempDir::new().unwrap();
        let manager = DirectoryUnitManager::new(temp.path()).unwrap();
        assert!(matches!(
            manager.load_directory("ghost").await,
            Err(UnitError::DirectoryNotFound(_))
        ));
        assert!(matches!(
            manager.load_directory("../outside").await,
            Err(UnitError::DirectoryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_unknown_is_false() {
        let temp = TempDir::new().unwrap();
        let manager = DirectoryUnitManager::new(temp.path()).unwrap();
        assert!(!manager.reload("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_manifest() {
        let temp = TempDir::new().unwrap();
        write_unit(temp.path(), "sample", r#"{"name": "sample", "version": "1.0.0"}"#);
        let manager = DirectoryUnitManager::new(temp.path()).unwrap();
        manager.load_directory("sample").await.unwrap();

        write_unit(temp.path(), "sample", r#"{"name": "sample", "version": "1.1.0"}"#);
        assert!(manager.reload("sample").await.unwrap());

        let info = manager.unit("sample").await.unwrap();
        assert_eq!(info.version.as_deref(), Some("1.1.0"));
        assert_eq!(manager.generation("sample").await, Some(1));
    }

    #[tokio::test]
    async fn test_reload_with_broken_manifest_marks_error() {
        let temp = TempDir::new().unwrap();
        write_unit(temp.path(), "sample", r#"{"name": "sample"}"#);
        let manager = DirectoryUnitManager::new(temp.path()).unwrap();
        manager.load_directory("sample").await.unwrap();

        fs::remove_file(temp.path().join("sample").join(MANIFEST_FILE)).unwrap();
        assert!(manager.reload("sample").await.is_err());
        let info = manager.unit("sample").await.unwrap();
        assert_eq!(info.runtime_status, RuntimeStatus::Error);
        assert!(!info.loaded);
    }

    #[tokio::test]
    async fn test_enable_load_lifecycle() {
        let temp = TempDir::new().unwrap();
        write_unit(temp.path(), "sample", r#"{"name": "sample"}"#);
        let manager = DirectoryUnitManager::new(temp.path()).unwrap();
        manager.load_directory("sample").await.unwrap();

        assert!(matches!(
            manager.load("sample").await,
            Err(UnitError::AlreadyLoaded(_))
        ));

        manager.set_enabled("sample", false).await.unwrap();
        let info = manager.unit("sample").await.unwrap();
        assert!(!info.loaded);
        assert_eq!(info.runtime_status, RuntimeStatus::Disabled);
        assert!(matches!(
            manager.load("sample").await,
            Err(UnitError::Disabled(_))
        ));

        manager.set_enabled("sample", true).await.unwrap();
        assert!(manager.load("sample").await.unwrap());
        assert!(manager.unit("sample").await.unwrap().loaded);
    }

    #[tokio::test]
    async fn test_unregister() {
        let temp = TempDir::new().unwrap();
        write_unit(temp.path(), "sample", r#"{"name": "sample"}"#);
        let manager = DirectoryUnitManager::new(temp.path()).unwrap();
        manager.load_directory("sample").await.unwrap();

        assert!(manager.unregister("sample").await.unwrap());
        assert!(!manager.unregister("sample").await.unwrap());
        assert!(manager.unit("sample").await.is_none());
    }

    #[tokio::test]
    async fn test_scan_registers_without_loading() {
        let temp = TempDir::new().unwrap();
        write_unit(temp.path(), "alpha", r#"{"name": "alpha"}"#);
        write_unit(temp.path(), "beta", r#"{"name": "beta", "displayName": "Beta"}"#);
        write_unit(temp.path(), "broken", r#"{"version": "1"}"#);
        fs::create_dir_all(temp.path().join("no-manifest")).unwrap();

        let manager = DirectoryUnitManager::new(temp.path()).unwrap();
        let mut registered = manager.scan().await.unwrap();
        registered.sort();
        assert_eq!(registered, vec!["alpha", "beta"]);

        let units = manager.units().await;
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|u| !u.loaded));
        assert_eq!(units[1].name, "Beta");
    }
}
