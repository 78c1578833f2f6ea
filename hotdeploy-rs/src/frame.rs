//! Message framing
//!
//! Encodes envelopes into text frames and classifies incoming frames by
//! field presence. Decoding never panics; callers drop frames that fail.

use hotdeploy_api::{Envelope, Notification, Request, Response, PROTOCOL_VERSION};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why an incoming frame was discarded
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Unsupported protocol version {0}")]
    Version(u64),

    #[error("Unrecognized envelope shape: {0}")]
    Shape(String),
}

/// Serialize an envelope into a text frame
pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Classify a text frame into one of the three envelope shapes.
///
/// A missing `protocolVersion` is treated as the current version.
pub fn decode(text: &str) -> Result<Envelope, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(FrameError::Json)?;
    let Value::Object(mut object) = value else {
        return Err(FrameError::NotAnObject);
    };

    match object.get("protocolVersion") {
        None => {
            object.insert("protocolVersion".to_string(), Value::from(PROTOCOL_VERSION));
        }
        Some(Value::Number(n)) if n.as_u64() == Some(u64::from(PROTOCOL_VERSION)) => {}
        Some(Value::Number(n)) => return Err(FrameError::Version(n.as_u64().unwrap_or(0))),
        Some(other) => {
            return Err(FrameError::Shape(format!("protocolVersion is {}", other)));
        }
    }

    let has_id = object.contains_key("id");
    let has_method = object.contains_key("method");

    // A Response may omit both `result` and `error` when answering a void call
    match (has_id, has_method) {
        (true, true) => typed::<Request>(object).map(Envelope::Request),
        (true, false) => typed::<Response>(object).map(Envelope::Response),
        (false, true) => typed::<Notification>(object).map(Envelope::Notification),
        _ => Err(FrameError::Shape(
            "expected a request, response or notification".to_string(),
        )),
    }
}

fn typed<T: serde::de::DeserializeOwned>(object: Map<String, Value>) -> Result<T, FrameError> {
    serde_json::from_value(Value::Object(object)).map_err(|e| FrameError::Shape(e.to_string()))
}
