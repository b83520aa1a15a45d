//! JSON-RPC 2.0 envelope types shared by the router and the HTTP transport.
//!
//! The `id` of a request is echoed verbatim in the response, including an
//! explicit `null`; both absence and `null` deserialize to `Value::Null` and
//! serialize back as `null`, which is what JSON-RPC requires for responses.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Code for a request body that is not valid JSON; surfaced by the transport
/// layer before the router ever sees a method name.
pub const PARSE_ERROR_CODE: i32 = -32700;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Value,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Build an error envelope from a `BridgeError`, mapping the variant to
    /// its JSON-RPC code.
    pub fn from_error(id: Value, err: &BridgeError) -> Self {
        Self::error(id, err.to_rpc_error_code(), err.to_string())
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
