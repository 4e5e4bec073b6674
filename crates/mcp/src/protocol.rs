//! JSON-RPC framing and the MCP method surface.
//!
//! Messages are JSON-RPC 2.0. Requests carry an id and expect a response;
//! notifications omit the id. The capability schemas below are the subset of
//! the MCP model the gateway speaks: tools, prompts and typed content blocks.

use serde::{Deserialize, Serialize};
use shared::error::CommonError;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// JSON-RPC request id, a string or a number on the wire.
pub type RequestId = serde_json::Value;

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: if params.is_null() { None } else { Some(params) },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<serde_json::Value, CommonError> {
        if let Some(error) = self.error {
            return Err(CommonError::protocol(format!(
                "upstream error {}: {}",
                error.code, error.message
            )));
        }
        self.result
            .ok_or_else(|| CommonError::protocol("response carries neither result nor error"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: if params.is_null() { None } else { Some(params) },
        }
    }
}

/// Any frame that can travel a transport. Variant order matters for the
/// untagged deserializer: a response has no `method`, a notification no `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Gateway-specific: a per-call timeout elapsed.
pub const TIMEOUT: i64 = -32001;
/// Gateway-specific: the upstream transport failed; it re-dials on the next
/// call, so the request is worth retrying.
pub const UPSTREAM_UNAVAILABLE: i64 = -32002;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TIMEOUT, message)
    }

    /// Transient upstream failure, flagged retriable for the caller.
    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self {
            code: UPSTREAM_UNAVAILABLE,
            message: message.into(),
            data: Some(serde_json::json!({"retriable": true})),
        }
    }
}

impl From<CommonError> for RpcError {
    fn from(error: CommonError) -> RpcError {
        match &error {
            CommonError::NotFound { msg, .. } => {
                RpcError::new(METHOD_NOT_FOUND, msg.clone())
            }
            CommonError::InvalidRequest { msg, .. } | CommonError::Protocol { msg, .. } => {
                RpcError::invalid_request(msg.clone())
            }
            CommonError::Validation { msg, .. } => RpcError::invalid_params(msg.clone()),
            CommonError::Timeout { msg, .. } => RpcError::timeout(msg.clone()),
            _ if error.is_transient() => RpcError::upstream_unavailable(error.to_string()),
            _ => RpcError::internal_error(error.to_string()),
        }
    }
}

// ============================================================================
// Capability schemas
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptArgSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgSchema>,
}

/// A typed MCP content block. Binary payloads travel base64-encoded with
/// their MIME type preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<Content>,
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: Content,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetPromptResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub messages: Vec<PromptMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolSchema>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPromptsResult {
    pub prompts: Vec<PromptSchema>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityFlags {
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<CapabilityFlags>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<CapabilityFlags>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
}

/// Initialize params this gateway presents when acting as an MCP client.
pub fn client_initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "mcpd",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_message_dispatch() {
        let request: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert!(matches!(request, JsonRpcMessage::Request(_)));

        let response: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(matches!(response, JsonRpcMessage::Response(_)));

        let notification: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(matches!(notification, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn error_response_never_carries_result() {
        let resp = JsonRpcResponse::error(serde_json::json!(7), RpcError::method_not_found("x"));
        assert!(resp.result.is_none());
        assert!(resp.into_result().is_err());
    }

    #[test]
    fn content_block_wire_shape() {
        let block = Content::Image {
            data: "aGk=".into(),
            mime_type: "image/png".into(),
        };
        let wire = serde_json::to_value(&block).unwrap();
        assert_eq!(wire["type"], "image");
        assert_eq!(wire["mimeType"], "image/png");

        let text = serde_json::to_value(Content::text("hello")).unwrap();
        assert_eq!(text["type"], "text");
    }

    #[test]
    fn call_result_error_flag_serialization() {
        let ok = serde_json::to_value(CallToolResult::text("fine")).unwrap();
        assert!(ok.get("isError").is_none());

        let failed = serde_json::to_value(CallToolResult::error("boom")).unwrap();
        assert_eq!(failed["isError"], true);
    }

    #[test]
    fn common_error_mapping() {
        let timeout: RpcError = CommonError::timeout("tool call timed out").into();
        assert_eq!(timeout.code, TIMEOUT);

        let transient: RpcError = CommonError::transport("pipe broken").into();
        assert_eq!(transient.code, UPSTREAM_UNAVAILABLE);
        assert_eq!(transient.data.unwrap()["retriable"], true);

        let missing: RpcError = CommonError::not_found("no such tool", "echo").into();
        assert_eq!(missing.code, METHOD_NOT_FOUND);
    }
}
