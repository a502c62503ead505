//! Tool-server wire types: JSON-RPC frames and tool schemas.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SwarmError;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";
pub const METHOD_PING: &str = "ping";

/// Client-assigned request identifier.
pub type RequestId = u64;

/// Schema for a tool exposed by a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Outbound request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Outbound notification frame (no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
        }
    }
}

/// Inbound response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Split into the result payload or the peer's error object.
    pub fn into_result(self) -> Result<Value, RpcErrorObject> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}: {}", self.code, self.message)
    }
}

/// Any frame a peer can send us.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(RpcResponse),
    /// Server-initiated request; the id is echoed back verbatim.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl InboundFrame {
    /// Classify a decoded JSON value.
    pub fn from_value(mut value: Value) -> Result<Self, SwarmError> {
        let Some(object) = value.as_object_mut() else {
            return Err(SwarmError::Transport(format!(
                "expected a JSON-RPC object, got {value}"
            )));
        };

        let method = object
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let id = object.remove("id");
        let params = object.remove("params");

        match (method, id) {
            (Some(method), Some(id)) if !id.is_null() => {
                Ok(Self::Request { id, method, params })
            }
            (Some(method), _) => Ok(Self::Notification { method, params }),
            (None, Some(id)) => {
                let id = parse_request_id(&id)?;
                let result = object.remove("result");
                let error = match object.remove("error") {
                    Some(Value::Null) | None => None,
                    Some(raw) => Some(serde_json::from_value::<RpcErrorObject>(raw).map_err(
                        |e| SwarmError::Transport(format!("malformed error object: {e}")),
                    )?),
                };
                if result.is_none() && error.is_none() {
                    return Err(SwarmError::Transport(format!(
                        "response {id} carries neither result nor error"
                    )));
                }
                Ok(Self::Response(RpcResponse {
                    jsonrpc: JSONRPC_VERSION.into(),
                    id,
                    result,
                    error,
                }))
            }
            (None, None) => Err(SwarmError::Transport(
                "frame has neither method nor id".into(),
            )),
        }
    }

    /// Decode one line/event of JSON text.
    pub fn parse(raw: &str) -> Result<Self, SwarmError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| SwarmError::Transport(format!("malformed frame: {e}")))?;
        Self::from_value(value)
    }
}

fn parse_request_id(id: &Value) -> Result<RequestId, SwarmError> {
    match id {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| SwarmError::Transport(format!("unexpected response id {id}")))
}
