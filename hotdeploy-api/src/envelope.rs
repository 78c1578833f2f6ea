//! Wire envelopes
//!
//! Three shapes share one JSON object layout and are told apart by which
//! fields are present: a Request has `id` and `method`, a Response has `id`
//! but no `method` (with `result`, `error`, or neither for a void answer), a
//! Notification has `method` but no `id`.

use crate::{codes, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing call awaiting a Response with the same `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub protocol_version: u32,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// Answer to exactly one Request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub protocol_version: u32,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl Response {
    /// Successful answer
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed answer
    pub fn err(id: u64, error: RpcErrorObject) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into the settled outcome of the originating call.
    ///
    /// A Response with neither field settles as `null`.
    pub fn into_outcome(self) -> Result<Value, RpcErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// One-way message, no Response expected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub protocol_version: u32,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method: method.into(),
            params,
        }
    }
}

/// Error carried by a failed Response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(method: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            codes::INVALID_PARAMS,
            format!("Invalid params for {}: {}", method, reason),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }
}

/// Any of the three wire shapes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl From<Request> for Envelope {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Envelope {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Notification> for Envelope {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_omits_empty_params() {
        let value = serde_json::to_value(Envelope::from(Request::new(1, "ping", vec![]))).unwrap();
        assert_eq!(
            value,
            json!({"protocolVersion": 1, "id": 1, "method": "ping"})
        );
    }

    #[test]
    fn test_error_response_shape() {
        let response = Response::err(7, RpcErrorObject::method_not_found("nope"));
        let value = serde_json::to_value(Envelope::from(response)).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["error"]["code"], codes::METHOD_NOT_FOUND);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_null_result_settles_as_null() {
        let response = Response {
            protocol_version: PROTOCOL_VERSION,
            id: 3,
            result: None,
            error: None,
        };
        assert_eq!(response.into_outcome(), Ok(Value::Null));
    }
}
