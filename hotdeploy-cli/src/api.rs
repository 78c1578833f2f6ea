//! Typed host operations
//!
//! Thin wrapper that turns [`HostRequest`]s into calls on any [`Caller`] and
//! decodes the results into their typed shapes.

use hotdeploy::{CallError, Caller};
use hotdeploy_api::{DebugInfo, FileEntry, HostRequest, UnitSummary, CALL_TIMEOUT};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// Host operations over one caller
#[derive(Clone, Copy)]
pub struct HostApi<'a> {
    caller: &'a dyn Caller,
    timeout: Duration,
}

impl<'a> HostApi<'a> {
    /// Interactive deadline
    pub fn new(caller: &'a dyn Caller) -> Self {
        Self {
            caller,
            timeout: CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn raw(&self, request: HostRequest) -> Result<Value, CallError> {
        let method = request.method();
        self.caller
            .call(method.as_str(), request.params(), self.timeout)
            .await
    }

    async fn typed<T: DeserializeOwned>(&self, request: HostRequest) -> Result<T, CallError> {
        let method = request.method();
        let value = self.raw(request).await?;
        serde_json::from_value(value).map_err(|e| CallError::Decode {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }

    /// Boolean result; a void (null) answer counts as success
    async fn flag(&self, request: HostRequest) -> Result<bool, CallError> {
        let method = request.method();
        match self.raw(request).await? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(true),
            other => Err(CallError::Decode {
                method: method.to_string(),
                reason: format!("expected boolean, got {}", other),
            }),
        }
    }

    pub async fn ping(&self) -> Result<String, CallError> {
        self.typed(HostRequest::Ping).await
    }

    pub async fn debug_info(&self) -> Result<DebugInfo, CallError> {
        self.typed(HostRequest::GetDebugInfo).await
    }

    pub async fn all_units(&self) -> Result<Vec<UnitSummary>, CallError> {
        self.typed(HostRequest::GetAllUnits).await
    }

    pub async fn loaded_units(&self) -> Result<Vec<UnitSummary>, CallError> {
        self.typed(HostRequest::GetLoadedUnits).await
    }

    pub async fn unit_info(&self, id: &str) -> Result<Option<UnitSummary>, CallError> {
        self.typed(HostRequest::GetUnitInfo { id: id.to_string() })
            .await
    }

    pub async fn set_unit_status(&self, id: &str, enabled: bool) -> Result<bool, CallError> {
        self.flag(HostRequest::SetUnitStatus {
            id: id.to_string(),
            enabled,
        })
        .await
    }

    pub async fn load_unit(&self, id: &str) -> Result<bool, CallError> {
        self.flag(HostRequest::LoadUnitById { id: id.to_string() })
            .await
    }

    pub async fn unregister_unit(&self, id: &str) -> Result<bool, CallError> {
        self.flag(HostRequest::UnregisterUnit { id: id.to_string() })
            .await
    }

    /// `Ok(false)` means the host does not know the unit
    pub async fn reload_unit(&self, id: &str) -> Result<bool, CallError> {
        self.flag(HostRequest::ReloadUnit { id: id.to_string() })
            .await
    }

    pub async fn load_directory_unit(&self, name: &str) -> Result<Value, CallError> {
        self.raw(HostRequest::LoadDirectoryUnit {
            name: name.to_string(),
        })
        .await
    }

    pub async fn remove_dir(&self, path: &str) -> Result<bool, CallError> {
        self.flag(HostRequest::RemoveDir {
            path: path.to_string(),
        })
        .await
    }

    pub async fn write_files(&self, files: Vec<FileEntry>) -> Result<Value, CallError> {
        self.raw(HostRequest::WriteFiles { files }).await
    }
}

impl std::fmt::Debug for HostApi<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostApi")
            .field("timeout", &self.timeout)
            .finish()
    }
}
