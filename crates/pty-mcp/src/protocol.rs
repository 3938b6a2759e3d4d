//! JSON-RPC 2.0 wire types for the MCP stdio transport.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision this server speaks.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub const SERVER_NAME: &str = "ttymux";

/// A JSON-RPC 2.0 request (has an `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC 2.0 notification (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// A `tools/call` result. Tool failures travel here with `is_error` set,
    /// not as JSON-RPC errors.
    pub fn tool_result(id: Value, text: &str, is_error: bool) -> Self {
        Self::success(
            id,
            json!({
                "content": [{ "type": "text", "text": text }],
                "isError": is_error,
            }),
        )
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// Standard JSON-RPC error codes.
pub mod error_codes {
    /// Parse error: invalid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Invalid request: not a valid JSON-RPC request.
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Server info returned from `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
}

impl InitializeResult {
    pub fn for_this_server() -> Self {
        Self {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Parameters of `tools/call`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// One line received from the client.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

/// Why a line could not be turned into an [`IncomingMessage`].
#[derive(Debug, thiserror::Error)]
pub enum IncomingError {
    /// Not JSON at all.
    #[error("Parse error: {0}")]
    Parse(#[source] serde_json::Error),

    /// JSON, but not a request or notification. `id` is echoed when present.
    #[error("Invalid request: {message}")]
    Invalid { id: Value, message: String },
}

impl IncomingError {
    pub fn into_response(self) -> JsonRpcResponse {
        match self {
            IncomingError::Parse(ref e) => {
                JsonRpcResponse::error(Value::Null, error_codes::PARSE_ERROR, format!("Parse error: {e}"))
            }
            IncomingError::Invalid { id, message } => JsonRpcResponse::error(
                id,
                error_codes::INVALID_REQUEST,
                format!("Invalid request: {message}"),
            ),
        }
    }
}

/// Parse a JSON line into a request or notification.
///
/// A message with a non-null `id` is a request; anything else is a notification.
pub fn parse_incoming(line: &str) -> Result<IncomingMessage, IncomingError> {
    let raw: Value = serde_json::from_str(line).map_err(IncomingError::Parse)?;

    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    if !raw.is_object() {
        return Err(IncomingError::Invalid {
            id,
            message: "expected a JSON object".into(),
        });
    }

    let invalid = |e: serde_json::Error, id: Value| IncomingError::Invalid {
        id,
        message: e.to_string(),
    };

    if id.is_null() {
        serde_json::from_value(raw)
            .map(IncomingMessage::Notification)
            .map_err(|e| invalid(e, Value::Null))
    } else {
        serde_json::from_value(raw)
            .map(IncomingMessage::Request)
            .map_err(|e| invalid(e, id))
    }
}
