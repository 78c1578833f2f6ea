//! Host operation table
//!
//! Every method the host answers is a variant of [`HostMethod`]. Incoming
//! positional parameters are decoded into a typed [`HostRequest`]; anything
//! outside the table is answered with "method not found".

use crate::RpcErrorObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Closed set of operations exposed by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostMethod {
    Ping,
    GetDebugInfo,
    GetAllUnits,
    GetLoadedUnits,
    GetUnitInfo,
    SetUnitStatus,
    LoadUnitById,
    UnregisterUnit,
    ReloadUnit,
    LoadDirectoryUnit,
    RemoveDir,
    WriteFiles,
}

impl HostMethod {
    pub const ALL: [HostMethod; 12] = [
        HostMethod::Ping,
        HostMethod::GetDebugInfo,
        HostMethod::GetAllUnits,
        HostMethod::GetLoadedUnits,
        HostMethod::GetUnitInfo,
        HostMethod::SetUnitStatus,
        HostMethod::LoadUnitById,
        HostMethod::UnregisterUnit,
        HostMethod::ReloadUnit,
        HostMethod::LoadDirectoryUnit,
        HostMethod::RemoveDir,
        HostMethod::WriteFiles,
    ];

    /// Wire name of the method
    pub fn as_str(self) -> &'static str {
        match self {
            HostMethod::Ping => "ping",
            HostMethod::GetDebugInfo => "getDebugInfo",
            HostMethod::GetAllUnits => "getAllUnits",
            HostMethod::GetLoadedUnits => "getLoadedUnits",
            HostMethod::GetUnitInfo => "getUnitInfo",
            HostMethod::SetUnitStatus => "setUnitStatus",
            HostMethod::LoadUnitById => "loadUnitById",
            HostMethod::UnregisterUnit => "unregisterUnit",
            HostMethod::ReloadUnit => "reloadUnit",
            HostMethod::LoadDirectoryUnit => "loadDirectoryUnit",
            HostMethod::RemoveDir => "removeDir",
            HostMethod::WriteFiles => "writeFiles",
        }
    }
}

impl fmt::Display for HostMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostMethod {
    type Err = RpcErrorObject;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HostMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| RpcErrorObject::method_not_found(s))
    }
}

/// A file transported by `writeFiles`
///
/// `path` is relative to the managed root and always uses forward slashes.
/// `content` is the base64 encoding of the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

/// Typed form of a host call
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    Ping,
    GetDebugInfo,
    GetAllUnits,
    GetLoadedUnits,
    GetUnitInfo { id: String },
    SetUnitStatus { id: String, enabled: bool },
    LoadUnitById { id: String },
    UnregisterUnit { id: String },
    ReloadUnit { id: String },
    LoadDirectoryUnit { name: String },
    RemoveDir { path: String },
    WriteFiles { files: Vec<FileEntry> },
}

impl HostRequest {
    pub fn method(&self) -> HostMethod {
        match self {
            HostRequest::Ping => HostMethod::Ping,
            HostRequest::GetDebugInfo => HostMethod::GetDebugInfo,
            HostRequest::GetAllUnits => HostMethod::GetAllUnits,
            HostRequest::GetLoadedUnits => HostMethod::GetLoadedUnits,
            HostRequest::GetUnitInfo { .. } => HostMethod::GetUnitInfo,
            HostRequest::SetUnitStatus { .. } => HostMethod::SetUnitStatus,
            HostRequest::LoadUnitById { .. } => HostMethod::LoadUnitById,
            HostRequest::UnregisterUnit { .. } => HostMethod::UnregisterUnit,
            HostRequest::ReloadUnit { .. } => HostMethod::ReloadUnit,
            HostRequest::LoadDirectoryUnit { .. } => HostMethod::LoadDirectoryUnit,
            HostRequest::RemoveDir { .. } => HostMethod::RemoveDir,
            HostRequest::WriteFiles { .. } => HostMethod::WriteFiles,
        }
    }

    /// Decode a method name and positional parameters.
    ///
    /// Unknown methods yield `METHOD_NOT_FOUND`, shape mismatches yield
    /// `INVALID_PARAMS`. Extra trailing parameters are ignored.
    pub fn decode(method: &str, params: Vec<Value>) -> Result<Self, RpcErrorObject> {
        let method: HostMethod = method.parse()?;
        let mut params = Params::new(method, params);

        let request = match method {
            HostMethod::Ping => HostRequest::Ping,
            HostMethod::GetDebugInfo => HostRequest::GetDebugInfo,
            HostMethod::GetAllUnits => HostRequest::GetAllUnits,
            HostMethod::GetLoadedUnits => HostRequest::GetLoadedUnits,
            HostMethod::GetUnitInfo => HostRequest::GetUnitInfo {
                id: params.string("id")?,
            },
            HostMethod::SetUnitStatus => HostRequest::SetUnitStatus {
                id: params.string("id")?,
                enabled: params.boolean("enabled")?,
            },
            HostMethod::LoadUnitById => HostRequest::LoadUnitById {
                id: params.string("id")?,
            },
            HostMethod::UnregisterUnit => HostRequest::UnregisterUnit {
                id: params.string("id")?,
            },
            HostMethod::ReloadUnit => HostRequest::ReloadUnit {
                id: params.string("id")?,
            },
            HostMethod::LoadDirectoryUnit => HostRequest::LoadDirectoryUnit {
                name: params.string("name")?,
            },
            HostMethod::RemoveDir => HostRequest::RemoveDir {
                path: params.string("path")?,
            },
            HostMethod::WriteFiles => HostRequest::WriteFiles {
                files: params.typed("fileList")?,
            },
        };

        Ok(request)
    }

    /// Positional parameters for the wire
    pub fn params(&self) -> Vec<Value> {
        match self {
            HostRequest::Ping
            | HostRequest::GetDebugInfo
            | HostRequest::GetAllUnits
            | HostRequest::GetLoadedUnits => Vec::new(),
            HostRequest::GetUnitInfo { id }
            | HostRequest::LoadUnitById { id }
            | HostRequest::UnregisterUnit { id }
            | HostRequest::ReloadUnit { id } => vec![Value::from(id.as_str())],
            HostRequest::SetUnitStatus { id, enabled } => {
                vec![Value::from(id.as_str()), Value::Bool(*enabled)]
            }
            HostRequest::LoadDirectoryUnit { name } => vec![Value::from(name.as_str())],
            HostRequest::RemoveDir { path } => vec![Value::from(path.as_str())],
            HostRequest::WriteFiles { files } => {
                let files = files
                    .iter()
                    .map(|f| serde_json::json!({ "path": f.path, "content": f.content }))
                    .collect();
                vec![Value::Array(files)]
            }
        }
    }
}

/// Cursor over positional parameters
struct Params {
    method: HostMethod,
    values: std::vec::IntoIter<Value>,
}

impl Params {
    fn new(method: HostMethod, values: Vec<Value>) -> Self {
        Self {
            method,
            values: values.into_iter(),
        }
    }

    fn next(&mut self, name: &str) -> Result<Value, RpcErrorObject> {
        self.values.next().ok_or_else(|| {
            RpcErrorObject::invalid_params(self.method.as_str(), format!("missing `{}`", name))
        })
    }

    fn string(&mut self, name: &str) -> Result<String, RpcErrorObject> {
        match self.next(name)? {
            Value::String(s) if !s.is_empty() => Ok(s),
            Value::String(_) => Err(RpcErrorObject::invalid_params(
                self.method.as_str(),
                format!("`{}` must not be empty", name),
            )),
            other => Err(RpcErrorObject::invalid_params(
                self.method.as_str(),
                format!("`{}` must be a string, got {}", name, other),
            )),
        }
    }

    fn boolean(&mut self, name: &str) -> Result<bool, RpcErrorObject> {
        match self.next(name)? {
            Value::Bool(b) => Ok(b),
            other => Err(RpcErrorObject::invalid_params(
                self.method.as_str(),
                format!("`{}` must be a boolean, got {}", name, other),
            )),
        }
    }

    fn typed<T: serde::de::DeserializeOwned>(&mut self, name: &str) -> Result<T, RpcErrorObject> {
        let value = self.next(name)?;
        serde_json::from_value(value).map_err(|e| {
            RpcErrorObject::invalid_params(self.method.as_str(), format!("`{}`: {}", name, e))
        })
    }
}
