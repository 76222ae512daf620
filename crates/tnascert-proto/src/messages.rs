//! JSON-RPC 2.0 message types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::JSONRPC_VERSION;

/// Errors raised while decoding frames received from the server
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Outgoing method call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        // The API expects a positional argument list
        let params = match params {
            Value::Null => Value::Array(Vec::new()),
            other => other,
        };
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error member of a JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    /// Human-readable description, preferring the server's `reason` detail
    pub fn describe(&self) -> String {
        let reason = self
            .data
            .as_ref()
            .and_then(|d| d.get("reason"))
            .and_then(Value::as_str);

        match reason {
            Some(reason) if !reason.is_empty() => {
                format!("{} (code {}): {}", self.message, self.code, reason.trim())
            }
            _ => format!("{} (code {})", self.message, self.code),
        }
    }
}

/// Reply to an [`RpcRequest`]
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    pub outcome: Result<Value, RpcErrorObject>,
}

/// Any frame received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Response(RpcResponse),
    Notification { method: String, params: Value },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

impl IncomingMessage {
    /// Decode a text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_str(text)?;

        match (raw.id, raw.method) {
            (Some(id), _) if !id.is_null() => {
                let id = id.as_u64().ok_or_else(|| {
                    ProtocolError::InvalidMessage(format!("unexpected response id: {}", id))
                })?;
                let outcome = match raw.error {
                    Some(error) => Err(error),
                    // a null result deserializes as None
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(IncomingMessage::Response(RpcResponse { id, outcome }))
            }
            (_, Some(method)) => Ok(IncomingMessage::Notification {
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            _ => Err(ProtocolError::InvalidMessage(
                "message has neither an id nor a method".to_string(),
            )),
        }
    }
}
