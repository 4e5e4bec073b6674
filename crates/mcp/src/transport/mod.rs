//! Client transports to proxied upstream MCP servers.
//!
//! All variants satisfy one contract; the typed capability calls are
//! implemented once on top of a raw request primitive. Startup is governed by
//! the configured policy: `onStart` transports are dialed eagerly during
//! snapshot install, `onDemand` transports dial inside the first call with a
//! single-flight guard.

mod sse;
mod stdio;
mod streamable;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::model::{McpServerConfig, McpServerType};
use shared::error::CommonError;

use crate::protocol::{
    CallToolResult, GetPromptResult, ListPromptsResult, ListToolsResult, PromptSchema, ToolSchema,
    methods,
};

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable::StreamableHttpTransport;

/// Default per-call timeout against an upstream server.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Correlation key for a JSON-RPC id (string or number).
pub(crate) fn id_key(id: &serde_json::Value) -> Option<String> {
    match id {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
pub trait TransportLike: Send + Sync {
    async fn start(&self) -> Result<(), CommonError>;

    async fn stop(&self) -> Result<(), CommonError>;

    fn running(&self) -> bool;

    /// One JSON-RPC request/response round trip. Implementations dial lazily
    /// when not yet started and re-dial after transient failures.
    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CommonError>;

    async fn fetch_tools(&self) -> Result<Vec<ToolSchema>, CommonError> {
        let result = self
            .request(methods::TOOLS_LIST, serde_json::json!({}))
            .await?;
        let parsed: ListToolsResult = serde_json::from_value(result)?;
        Ok(parsed.tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> Result<CallToolResult, CommonError> {
        let result = self
            .request(
                methods::TOOLS_CALL,
                serde_json::json!({"name": name, "arguments": args}),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn fetch_prompts(&self) -> Result<Vec<PromptSchema>, CommonError> {
        let result = self
            .request(methods::PROMPTS_LIST, serde_json::json!({}))
            .await?;
        let parsed: ListPromptsResult = serde_json::from_value(result)?;
        Ok(parsed.prompts)
    }

    async fn get_prompt(
        &self,
        name: &str,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> Result<GetPromptResult, CommonError> {
        let result = self
            .request(
                methods::PROMPTS_GET,
                serde_json::json!({"name": name, "arguments": args}),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}

pub type Transport = Arc<dyn TransportLike>;

/// Builds the transport variant matching the server configuration.
pub fn new_transport(
    config: &McpServerConfig,
    call_timeout: Duration,
) -> Result<Transport, CommonError> {
    match config.type_ {
        McpServerType::Stdio => {
            if config.command.is_empty() {
                return Err(CommonError::validation(format!(
                    "stdio server {} has no command",
                    config.name
                )));
            }
            Ok(Arc::new(StdioTransport::new(config.clone(), call_timeout)))
        }
        McpServerType::Sse => {
            if config.url.is_empty() {
                return Err(CommonError::validation(format!(
                    "sse server {} has no url",
                    config.name
                )));
            }
            Ok(Arc::new(SseTransport::new(config.clone(), call_timeout)))
        }
        McpServerType::StreamableHttp => {
            if config.url.is_empty() {
                return Err(CommonError::validation(format!(
                    "streamable-http server {} has no url",
                    config.name
                )));
            }
            Ok(Arc::new(StreamableHttpTransport::new(
                config.clone(),
                call_timeout,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_validates_required_fields() {
        let stdio_without_command = McpServerConfig {
            name: "ms1".into(),
            type_: McpServerType::Stdio,
            ..Default::default()
        };
        assert!(new_transport(&stdio_without_command, DEFAULT_CALL_TIMEOUT).is_err());

        let sse_without_url = McpServerConfig {
            name: "ms2".into(),
            type_: McpServerType::Sse,
            ..Default::default()
        };
        assert!(new_transport(&sse_without_url, DEFAULT_CALL_TIMEOUT).is_err());

        let valid = McpServerConfig {
            name: "ms3".into(),
            type_: McpServerType::Stdio,
            command: "/bin/echo-mcp".into(),
            ..Default::default()
        };
        let transport = new_transport(&valid, DEFAULT_CALL_TIMEOUT).unwrap();
        assert!(!transport.running());
    }
}
