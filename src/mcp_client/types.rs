//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method name of the handshake request.
pub const METHOD_INITIALIZE: &str = "initialize";

/// Notification sent once the `initialize` response has been received.
pub const METHOD_INITIALIZED: &str = "notifications/initialized";

/// Method name of a tool invocation.
pub const METHOD_TOOLS_CALL: &str = "tools/call";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }

    /// `tools/call` request for a named tool with opaque arguments.
    pub fn tool_call(id: u64, tool_name: &str, arguments: Value) -> Self {
        Self::new(
            id,
            METHOD_TOOLS_CALL,
            Some(serde_json::json!({
                "name": tool_name,
                "arguments": arguments,
            })),
        )
    }
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `id` is kept as a raw value: servers are free to echo it back as a number
/// or a string, and the router decides whether it correlates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub id: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The numeric request id this response answers, if it is one of ours.
    pub fn numeric_id(&self) -> Option<u64> {
        parse_request_id(&self.id)
    }
}

/// JSON-RPC 2.0 error object.
///
/// Only `message` is guaranteed; some servers omit `code`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Interpret a JSON-RPC id as one of our integer request ids.
pub fn parse_request_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Name and version reported in the `initialize` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// `initialize` request params.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub client_info: ClientInfo,
    pub capabilities: Value,
}

impl InitializeParams {
    pub fn new(protocol_version: &str, client_info: ClientInfo) -> Self {
        Self {
            protocol_version: protocol_version.to_string(),
            client_info,
            capabilities: Value::Object(serde_json::Map::new()),
        }
    }
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Result of a tool call with retry bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallOutcome {
    pub server: String,
    pub tool_name: String,
    pub result: Value,
    /// 1-based attempt that produced the result.
    pub attempts: u32,
    pub elapsed_ms: u64,
}

// ─── Standard JSON-RPC Error Codes ──────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_tool_call_request_shape() {
        let req = JsonRpcRequest::tool_call(3, "echo", serde_json::json!({"x": 1}));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "echo", "arguments": {"x": 1}},
            })
        );
    }

    #[test]
    fn test_notification_has_no_id() {
        let n = JsonRpcNotification::new(METHOD_INITIALIZED, None);
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
        );
    }

    #[test]
    fn test_initialize_params_camel_case() {
        let params = InitializeParams::new(
            "2024-11-05",
            ClientInfo {
                name: "learning-agent".into(),
                version: "0.1.0".into(),
            },
        );
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["protocolVersion"], "2024-11-05");
        assert_eq!(value["clientInfo"]["name"], "learning-agent");
        assert_eq!(value["capabilities"], serde_json::json!({}));
    }

    #[test]
    fn test_response_error_without_code() {
        let json = r#"{"jsonrpc": "2.0", "id": 7, "error": {"message": "bad args"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.numeric_id(), Some(7));
        let err = resp.error.unwrap();
        assert_eq!(err.code, 0);
        assert_eq!(err.message, "bad args");
    }

    #[test]
    fn test_response_error_with_code() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "result": null,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_parse_request_id_variants() {
        assert_eq!(parse_request_id(&serde_json::json!(42)), Some(42));
        assert_eq!(parse_request_id(&serde_json::json!("42")), Some(42));
        assert_eq!(parse_request_id(&serde_json::json!(-1)), None);
        assert_eq!(parse_request_id(&serde_json::json!("abc")), None);
        assert_eq!(parse_request_id(&Value::Null), None);
    }

    #[test]
    fn test_initialize_result_lenient() {
        let json = r#"{"protocolVersion": "2024-11-05", "serverInfo": {"name": "notion-mcp"}}"#;
        let init: InitializeResult = serde_json::from_str(json).unwrap();
        assert_eq!(init.protocol_version.as_deref(), Some("2024-11-05"));
        assert_eq!(init.server_info.unwrap().name.as_deref(), Some("notion-mcp"));
        assert!(init.capabilities.is_null());
    }
}
