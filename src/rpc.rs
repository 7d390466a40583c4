//! JSON-RPC 2.0 helpers — build and parse the wire frames used on the
//! hub ↔ plugin WebSocket.
//!
//! Notifications are requests without an `id`; responses carry exactly one
//! of `result` or `error`.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes the hub uses.
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

/// A JSON-RPC request, or a notification when `id` is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// Either side of the protocol, distinguished by the presence of `method`.
#[derive(Debug, Clone)]
pub enum RpcFrame {
    Request(RpcRequest),
    Response(RpcResponse),
}

/// Parse a raw frame into a request or a response.
pub fn parse(raw: &str) -> Result<RpcFrame, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    if value.get("method").is_some() {
        Ok(RpcFrame::Request(serde_json::from_value(value)?))
    } else {
        Ok(RpcFrame::Response(serde_json::from_value(value)?))
    }
}

/// Serialize a fire-and-forget notification (no `id`).
pub fn notification(method: &str, params: Value) -> String {
    frame_to_string(&RpcRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: method.to_string(),
        params,
        id: None,
    })
}

/// Serialize a request that expects a response.
pub fn request(method: &str, params: Value, request_id: &str) -> String {
    frame_to_string(&RpcRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: method.to_string(),
        params,
        id: Some(Value::String(request_id.to_string())),
    })
}

/// Serialize a successful response.
pub fn success(result: Value, id: Option<Value>) -> String {
    frame_to_string(&RpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        result: Some(result),
        error: None,
        id,
    })
}

/// Serialize an error response.
pub fn error(code: i64, message: &str, id: Option<Value>) -> String {
    frame_to_string(&RpcResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        result: None,
        error: Some(RpcError {
            code,
            message: message.to_string(),
            data: None,
        }),
        id,
    })
}

/// Fresh 32-hex-char request id.
pub fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Stable map key for a response `id`. The hub always issues string ids;
/// numeric ids from foreign peers fall back to their JSON rendering.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn frame_to_string<T: Serialize>(frame: &T) -> String {
    // Frames are built from plain strings and JSON values; serialization
    // cannot fail.
    serde_json::to_string(frame).unwrap_or_default()
}
