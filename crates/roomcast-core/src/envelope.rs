//! JSON envelopes exchanged with connections.
//!
//! ```text
//! inbound   {"eventName": "chat", "data": {...}, "requestToken": "17"}
//! outbound  {"eventName": "chat", "data": {...}}
//! response  {"eventName": "response-17", "result": {...}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Prefix of the event name carrying a request's response.
pub const RESPONSE_PREFIX: &str = "response-";

/// An event frame, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Logical event name
    pub event_name: String,
    /// Event payload; `null` when absent
    #[serde(default)]
    pub data: Value,
    /// Correlation token; present when the sender expects a response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_token: Option<Value>,
}

impl Envelope {
    /// Outbound event without a request token.
    pub fn event(event_name: impl Into<String>, data: Value) -> Self {
        Self { event_name: event_name.into(), data, request_token: None }
    }

    /// Decode an inbound frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Request token as text. Numbers are rendered in decimal; `null`, the
    /// empty string and other shapes count as no token.
    pub fn token(&self) -> Option<String> {
        match self.request_token.as_ref()? {
            Value::String(token) if token.is_empty() => None,
            Value::String(token) => Some(token.clone()),
            Value::Number(token) => Some(token.to_string()),
            _ => None,
        }
    }
}

/// Response to a request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    /// `response-<token>`
    pub event_name: String,
    /// Handler-provided result
    pub result: Value,
}

impl ResponseEnvelope {
    /// Response for the request carrying `token`.
    pub fn new(token: &str, result: Value) -> Self {
        Self { event_name: format!("{RESPONSE_PREFIX}{token}"), result }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
