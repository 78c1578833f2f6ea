//! Host dispatcher
//!
//! Routes decoded [`HostRequest`]s to the unit manager and the managed-root
//! file operations. Collaborator failures become error Responses; successful
//! mutations are announced to every client through the [`EventPublisher`].

use crate::connections::EventPublisher;
use crate::files::{FileOpError, ManagedFiles};
use crate::registry::{UnitError, UnitManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hotdeploy::RequestHandler;
use hotdeploy_api::{
    codes, DebugInfo, Greeting, HostRequest, RpcErrorObject, UnitAction, PONG, SELF_ID,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

impl From<UnitError> for RpcErrorObject {
    fn from(error: UnitError) -> Self {
        RpcErrorObject::new(codes::UNIT_ERROR, error.to_string())
    }
}

impl From<FileOpError> for RpcErrorObject {
    fn from(error: FileOpError) -> Self {
        let code = if error.is_invalid_argument() {
            codes::INVALID_PARAMS
        } else {
            codes::UNIT_ERROR
        };
        RpcErrorObject::new(code, error.to_string())
    }
}

/// Serves the host operation table for every connection
pub struct HostDispatcher {
    manager: Arc<dyn UnitManager>,
    files: ManagedFiles,
    publisher: EventPublisher,
    started_at: DateTime<Utc>,
}

impl HostDispatcher {
    pub fn new(manager: Arc<dyn UnitManager>, publisher: EventPublisher) -> Self {
        let files = ManagedFiles::new(manager.managed_root());
        Self {
            manager,
            files,
            publisher,
            started_at: Utc::now(),
        }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Payload of the greeting sent to each new connection
    pub async fn greeting(&self) -> Greeting {
        let units = self.manager.units().await;
        Greeting {
            version: hotdeploy::version_short().to_string(),
            total_units: units.len(),
            loaded_units: units.iter().filter(|u| u.loaded).count(),
            self_id: SELF_ID.to_string(),
        }
    }

    pub async fn debug_info(&self) -> DebugInfo {
        let units = self.manager.units().await;
        let uptime = Utc::now().signed_duration_since(self.started_at);
        DebugInfo {
            version: hotdeploy::version_short().to_string(),
            total_units: units.len(),
            loaded_units: units.iter().filter(|u| u.loaded).count(),
            managed_root_path: self.manager.managed_root().display().to_string(),
            uptime_seconds: u64::try_from(uptime.num_seconds()).unwrap_or(0),
        }
    }

    /// Execute one typed request
    pub async fn dispatch(&self, request: HostRequest) -> Result<Value, RpcErrorObject> {
        match request {
            HostRequest::Ping => Ok(Value::from(PONG)),
            HostRequest::GetDebugInfo => to_result(&self.debug_info().await),
            HostRequest::GetAllUnits => to_result(&self.manager.units().await),
            HostRequest::GetLoadedUnits => {
                let loaded: Vec<_> = self
                    .manager
                    .units()
                    .await
                    .into_iter()
                    .filter(|u| u.loaded)
                    .collect();
                to_result(&loaded)
            }
            HostRequest::GetUnitInfo { id } => to_result(&self.manager.unit(&id).await),
            HostRequest::SetUnitStatus { id, enabled } => {
                let changed = self.manager.set_enabled(&id, enabled).await?;
                if changed {
                    let action = if enabled {
                        UnitAction::Enabled
                    } else {
                        UnitAction::Disabled
                    };
                    self.publisher.unit_changed(&id, action).await;
                }
                Ok(Value::Bool(changed))
            }
            HostRequest::LoadUnitById { id } => {
                let loaded = self.manager.load(&id).await?;
                if loaded {
                    self.publisher.unit_changed(&id, UnitAction::Loaded).await;
                }
                Ok(Value::Bool(loaded))
            }
            HostRequest::UnregisterUnit { id } => {
                if id == SELF_ID {
                    return Err(RpcErrorObject::new(
                        codes::SELF_UNREGISTER_REFUSED,
                        format!("Refusing to unregister {}", SELF_ID),
                    ));
                }
                let removed = self.manager.unregister(&id).await?;
                if removed {
                    self.publisher
                        .unit_changed(&id, UnitAction::Unregistered)
                        .await;
                }
                Ok(Value::Bool(removed))
            }
            HostRequest::ReloadUnit { id } => {
                if id == SELF_ID {
                    return Err(RpcErrorObject::new(
                        codes::SELF_RELOAD_REFUSED,
                        format!("Refusing to reload {}", SELF_ID),
                    ));
                }
                let reloaded = self.manager.reload(&id).await?;
                if reloaded {
                    self.publisher.unit_changed(&id, UnitAction::Reloaded).await;
                }
                Ok(Value::Bool(reloaded))
            }
            HostRequest::LoadDirectoryUnit { name } => {
                let summary = self.manager.load_directory(&name).await?;
                self.publisher
                    .unit_changed(&summary.id, UnitAction::Loaded)
                    .await;
                to_result(&summary)
            }
            HostRequest::RemoveDir { path } => {
                let removed = self.files.remove_dir(&path).await?;
                Ok(Value::Bool(removed))
            }
            HostRequest::WriteFiles { files } => {
                let written = self.files.write_files(&files).await?;
                Ok(Value::from(written))
            }
        }
    }
}

fn to_result<T: Serialize>(value: &T) -> Result<Value, RpcErrorObject> {
    serde_json::to_value(value)
        .map_err(|e| RpcErrorObject::internal(format!("Failed to encode result: {}", e)))
}

#[async_trait]
impl RequestHandler for HostDispatcher {
    async fn handle(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcErrorObject> {
        let request = HostRequest::decode(method, params)?;
        tracing::debug!(method = %request.method(), "Dispatching request");

        let result = self.dispatch(request).await;
        if let Err(error) = &result {
            tracing::warn!(method = %method, code = error.code, error = %error.message, "Request failed");
        }
        result
    }
}

impl std::fmt::Debug for HostDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDispatcher")
            .field("root", &self.files.root())
            .field("started_at", &self.started_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionSet;
    use hotdeploy_api::{RuntimeStatus, UnitSummary};
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Manager that only counts how often it was consulted
    struct CountingManager {
        root: PathBuf,
        calls: AtomicUsize,
    }

    impl CountingManager {
        fn new() -> Self {
            Self {
                root: PathBuf::from("/nonexistent/units"),
                calls: AtomicUsize::new(0),
            }
        }

        fn hit(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl UnitManager for CountingManager {
        async fn units(&self) -> Vec<UnitSummary> {
            self.hit();
            Vec::new()
        }
        async fn unit(&self, _id: &str) -> Option<UnitSummary> {
            self.hit();
            None
        }
        async fn set_enabled(&self, id: &str, _enabled: bool) -> Result<bool, UnitError> {
            self.hit();
            Err(UnitError::NotFound(id.to_string()))
        }
        async fn load(&self, _id: &str) -> Result<bool, UnitError> {
            self.hit();
            Ok(true)
        }
        async fn unregister(&self, _id: &str) -> Result<bool, UnitError> {
            self.hit();
            Ok(true)
        }
        async fn reload(&self, _id: &str) -> Result<bool, UnitError> {
            self.hit();
            Ok(true)
        }
        async fn load_directory(&self, name: &str) -> Result<UnitSummary, UnitError> {
            self.hit();
            Ok(UnitSummary {
                id: name.to_string(),
                file_id: name.to_string(),
                name: name.to_string(),
                version: None,
                enabled: true,
                loaded: true,
                runtime_status: RuntimeStatus::Loaded,
            })
        }
        fn managed_root(&self) -> &Path {
            &self.root
        }
    }

    fn dispatcher() -> (HostDispatcher, Arc<CountingManager>) {
        let manager = Arc::new(CountingManager::new());
        let dispatcher = HostDispatcher::new(
            manager.clone(),
            EventPublisher::new(ConnectionSet::new()),
        );
        (dispatcher, manager)
    }

    #[tokio::test]
    async fn test_ping() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(dispatcher.handle("ping", vec![]).await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_self_protection_never_reaches_manager() {
        let (dispatcher, manager) = dispatcher();

        let err = dispatcher
            .handle("reloadUnit", vec![json!(SELF_ID)])
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::SELF_RELOAD_REFUSED);

        let err = dispatcher
            .handle("unregisterUnit", vec![json!(SELF_ID)])
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::SELF_UNREGISTER_REFUSED);

        assert_eq!(manager.calls.load(Ordering::SeqCst), 0);

        // Other identities go through
        assert_eq!(
            dispatcher.handle("reloadUnit", vec![json!("sample")]).await.unwrap(),
            json!(true)
        );
        assert_eq!(manager.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_params() {
        let (dispatcher, _) = dispatcher();

        let err = dispatcher.handle("dropTables", vec![]).await.unwrap_err();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);

        let err = dispatcher.handle("reloadUnit", vec![]).await.unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);

        let err = dispatcher
            .handle("setUnitStatus", vec![json!("sample"), json!("yes")])
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_collaborator_errors_become_unit_errors() {
        let (dispatcher, _) = dispatcher();
        let err = dispatcher
            .handle("setUnitStatus", vec![json!("ghost"), json!(true)])
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::UNIT_ERROR);
        assert!(err.message.contains("ghost"));
    }

    #[tokio::test]
    async fn test_unit_info_null_for_unknown() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(
            dispatcher.handle("getUnitInfo", vec![json!("ghost")]).await.unwrap(),
            Value::Null
        );
    }

    #[tokio::test]
    async fn test_debug_info_shape() {
        let (dispatcher, _) = dispatcher();
        let info = dispatcher.handle("getDebugInfo", vec![]).await.unwrap();
        assert_eq!(info["totalUnits"], 0);
        assert_eq!(info["loadedUnits"], 0);
        assert_eq!(info["managedRootPath"], "/nonexistent/units");
        assert!(info["uptimeSeconds"].is_u64());
    }

    #[tokio::test]
    async fn test_remove_dir_rejects_escape() {
        let (dispatcher, _) = dispatcher();
        let err = dispatcher
            .handle("removeDir", vec![json!("../etc")])
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_empty_write_files_probe_succeeds() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(
            dispatcher.handle("writeFiles", vec![json!([])]).await.unwrap(),
            json!(0)
        );
    }
}
