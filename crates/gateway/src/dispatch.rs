//! JSON-RPC method dispatch against a runtime unit.
//!
//! One dispatcher instance serves every session and streamable request; the
//! unit (captured from a snapshot) decides whether a call goes through the
//! HTTP template pipeline or a proxied upstream transport.

use std::sync::Arc;
use std::time::Duration;

use config::model::PromptConfig;
use mcp::protocol::{
    CallToolResult, CapabilityFlags, Content, GetPromptResult, Implementation, InitializeResult,
    JsonRpcRequest, JsonRpcResponse, ListPromptsResult, ListToolsResult, PROTOCOL_VERSION,
    PromptMessage, RpcError, ServerCapabilities, methods,
};
use serde::Deserialize;
use shared::error::CommonError;
use tracing::{debug, warn};

use crate::capability::{CacheKey, CapabilityCache, CapabilityInfo};
use crate::state::{ProtoType, RuntimeUnit};
use crate::template::{HttpToolExecutor, RenderContext, RequestContext};

#[derive(Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: serde_json::Map<String, serde_json::Value>,
}

pub struct Dispatcher {
    executor: HttpToolExecutor,
    capabilities: Arc<CapabilityCache>,
}

impl Dispatcher {
    pub fn new(default_call_timeout: Duration, capabilities: Arc<CapabilityCache>) -> Self {
        Self {
            executor: HttpToolExecutor::new(default_call_timeout),
            capabilities,
        }
    }

    pub fn with_forward_headers(
        default_call_timeout: Duration,
        capabilities: Arc<CapabilityCache>,
        forward_headers: Vec<String>,
    ) -> Self {
        Self {
            executor: HttpToolExecutor::new(default_call_timeout)
                .with_forward_headers(forward_headers),
            capabilities,
        }
    }

    pub fn capabilities(&self) -> &Arc<CapabilityCache> {
        &self.capabilities
    }

    /// Handles one request end to end; errors become JSON-RPC error
    /// responses and never escape to the session.
    pub async fn dispatch_request(
        &self,
        unit: &RuntimeUnit,
        meta: &RequestContext,
        request: &JsonRpcRequest,
    ) -> JsonRpcResponse {
        let id = request.id.clone();
        match self.dispatch_inner(unit, meta, request).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                warn!(
                    method = %request.method,
                    prefix = %unit.router.prefix,
                    error = %e,
                    "request dispatch failed"
                );
                JsonRpcResponse::error(id, RpcError::from(e))
            }
        }
    }

    async fn dispatch_inner(
        &self,
        unit: &RuntimeUnit,
        meta: &RequestContext,
        request: &JsonRpcRequest,
    ) -> Result<serde_json::Value, CommonError> {
        debug!(method = %request.method, prefix = %unit.router.prefix, "dispatching");
        match request.method.as_str() {
            methods::INITIALIZE => Ok(serde_json::to_value(initialize_result())?),
            methods::PING => Ok(serde_json::json!({})),
            methods::TOOLS_LIST => self.tools_list(unit).await,
            methods::TOOLS_CALL => self.tools_call(unit, meta, request.params.clone()).await,
            methods::PROMPTS_LIST => self.prompts_list(unit).await,
            methods::PROMPTS_GET => self.prompts_get(unit, request.params.clone()).await,
            other => Err(CommonError::not_found(
                format!("method not found: {other}"),
                other.to_string(),
            )),
        }
    }

    async fn tools_list(&self, unit: &RuntimeUnit) -> Result<serde_json::Value, CommonError> {
        let tools = if unit.proto_type.is_proxy() {
            let key = CacheKey::tools(&unit.router.prefix, &unit.server_name);
            match self.capabilities.get(&key) {
                Some(CapabilityInfo::Tools(tools)) => tools,
                _ => {
                    let transport = unit
                        .transport
                        .as_ref()
                        .ok_or_else(|| CommonError::transport("proxy unit has no transport"))?;
                    let tools = transport.fetch_tools().await?;
                    self.capabilities.put(key, CapabilityInfo::Tools(tools.clone()));
                    tools
                }
            }
        } else {
            unit.tool_schemas.clone()
        };
        Ok(serde_json::to_value(ListToolsResult { tools })?)
    }

    async fn tools_call(
        &self,
        unit: &RuntimeUnit,
        meta: &RequestContext,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CommonError> {
        let params: CallParams = parse_params(params)?;

        let result: CallToolResult = if let Some(tool) = unit.tools.get(&params.name) {
            self.executor
                .execute(tool, unit.server.as_ref(), meta.clone(), params.arguments)
                .await?
        } else if unit.proto_type.is_proxy() {
            let transport = unit
                .transport
                .as_ref()
                .ok_or_else(|| CommonError::transport("proxy unit has no transport"))?;
            transport.call_tool(&params.name, params.arguments).await?
        } else {
            return Err(CommonError::not_found(
                format!("tool not found: {}", params.name),
                params.name,
            ));
        };

        Ok(serde_json::to_value(result)?)
    }

    async fn prompts_list(&self, unit: &RuntimeUnit) -> Result<serde_json::Value, CommonError> {
        let prompts = if unit.proto_type.is_proxy() {
            let key = CacheKey::prompts(&unit.router.prefix, &unit.server_name);
            match self.capabilities.get(&key) {
                Some(CapabilityInfo::Prompts(prompts)) => prompts,
                _ => {
                    let transport = unit
                        .transport
                        .as_ref()
                        .ok_or_else(|| CommonError::transport("proxy unit has no transport"))?;
                    let prompts = transport.fetch_prompts().await?;
                    self.capabilities
                        .put(key, CapabilityInfo::Prompts(prompts.clone()));
                    prompts
                }
            }
        } else {
            unit.prompt_schemas.clone()
        };
        Ok(serde_json::to_value(ListPromptsResult { prompts })?)
    }

    async fn prompts_get(
        &self,
        unit: &RuntimeUnit,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CommonError> {
        let params: CallParams = parse_params(params)?;

        let result = if let Some(prompt) = unit.prompts.get(&params.name) {
            self.render_prompt(prompt, params.arguments)?
        } else if unit.proto_type.is_proxy() {
            let transport = unit
                .transport
                .as_ref()
                .ok_or_else(|| CommonError::transport("proxy unit has no transport"))?;
            transport.get_prompt(&params.name, params.arguments).await?
        } else {
            return Err(CommonError::not_found(
                format!("prompt not found: {}", params.name),
                params.name,
            ));
        };

        Ok(serde_json::to_value(result)?)
    }

    /// Prompt messages render at get time, with the caller's arguments.
    fn render_prompt(
        &self,
        prompt: &PromptConfig,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<GetPromptResult, CommonError> {
        for required in prompt.arguments.iter().filter(|a| a.required) {
            if !arguments.contains_key(&required.name) {
                return Err(CommonError::validation(format!(
                    "missing required prompt argument: {}",
                    required.name
                )));
            }
        }

        let ctx = RenderContext {
            args: arguments,
            ..Default::default()
        };

        let mut messages = Vec::with_capacity(prompt.prompt_response.len());
        for message in &prompt.prompt_response {
            let text = self.executor.engine().render(&message.content.text, &ctx)?;
            messages.push(PromptMessage {
                role: message.role.clone(),
                content: Content::text(text),
            });
        }

        Ok(GetPromptResult {
            description: prompt.description.clone(),
            messages,
        })
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<serde_json::Value>,
) -> Result<T, CommonError> {
    let params = params.unwrap_or(serde_json::Value::Null);
    serde_json::from_value(params).map_err(|e| CommonError::InvalidRequest {
        msg: format!("invalid params: {e}"),
        source: Some(e.into()),
    })
}

pub fn initialize_result() -> InitializeResult {
    InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(CapabilityFlags {
                list_changed: Some(true),
            }),
            prompts: Some(CapabilityFlags {
                list_changed: Some(true),
            }),
        },
        server_info: Implementation {
            name: "mcpd".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use config::model::{
        PromptArgument, PromptResponseContent, PromptResponseMessage, RouterConfig,
    };
    use mcp::protocol::METHOD_NOT_FOUND;

    use super::*;

    fn http_unit() -> RuntimeUnit {
        let prompt = PromptConfig {
            name: "greet".into(),
            description: "greets someone".into(),
            arguments: vec![PromptArgument {
                name: "who".into(),
                required: true,
                ..Default::default()
            }],
            prompt_response: vec![PromptResponseMessage {
                role: "assistant".into(),
                content: PromptResponseContent {
                    type_: "text".into(),
                    text: "hello {{ Args.who }}".into(),
                },
            }],
            ..Default::default()
        };
        RuntimeUnit {
            router: RouterConfig {
                server: "s1".into(),
                prefix: "/h1".into(),
                ..Default::default()
            },
            server_name: "s1".into(),
            proto_type: ProtoType::Http,
            server: None,
            tools: HashMap::new(),
            tool_schemas: vec![mcp::protocol::ToolSchema {
                name: "echo".into(),
                description: "echoes".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            prompts: HashMap::from([("greet".to_string(), prompt)]),
            prompt_schemas: Vec::new(),
            transport: None,
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Duration::from_secs(5),
            Arc::new(CapabilityCache::default()),
        )
    }

    fn request(method: &str, params: serde_json::Value) -> JsonRpcRequest {
        JsonRpcRequest::new(serde_json::json!(1), method, params)
    }

    #[tokio::test]
    async fn initialize_reports_capabilities() {
        let response = dispatcher()
            .dispatch_request(
                &http_unit(),
                &RequestContext::default(),
                &request(methods::INITIALIZE, serde_json::json!({})),
            )
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "mcpd");
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_list_serves_precomputed_schemas() {
        let response = dispatcher()
            .dispatch_request(
                &http_unit(),
                &RequestContext::default(),
                &request(methods::TOOLS_LIST, serde_json::json!({})),
            )
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn unknown_method_maps_to_method_not_found() {
        let response = dispatcher()
            .dispatch_request(
                &http_unit(),
                &RequestContext::default(),
                &request("resources/list", serde_json::json!({})),
            )
            .await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_tool_on_http_unit_is_an_error() {
        let response = dispatcher()
            .dispatch_request(
                &http_unit(),
                &RequestContext::default(),
                &request(
                    methods::TOOLS_CALL,
                    serde_json::json!({"name": "missing", "arguments": {}}),
                ),
            )
            .await;
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn prompt_renders_at_get_time() {
        let response = dispatcher()
            .dispatch_request(
                &http_unit(),
                &RequestContext::default(),
                &request(
                    methods::PROMPTS_GET,
                    serde_json::json!({"name": "greet", "arguments": {"who": "ada"}}),
                ),
            )
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["messages"][0]["content"]["text"], "hello ada");
    }

    #[tokio::test]
    async fn proxy_tools_list_reads_through_the_capability_cache() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct FakeTransport {
            fetches: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl mcp::transport::TransportLike for FakeTransport {
            async fn start(&self) -> Result<(), shared::error::CommonError> {
                Ok(())
            }
            async fn stop(&self) -> Result<(), shared::error::CommonError> {
                Ok(())
            }
            fn running(&self) -> bool {
                true
            }
            async fn request(
                &self,
                method: &str,
                _params: serde_json::Value,
            ) -> Result<serde_json::Value, shared::error::CommonError> {
                assert_eq!(method, methods::TOOLS_LIST);
                self.fetches.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({
                    "tools": [{"name": "remote-tool", "inputSchema": {"type": "object"}}]
                }))
            }
        }

        let transport = Arc::new(FakeTransport {
            fetches: AtomicUsize::new(0),
        });
        let unit = RuntimeUnit {
            router: RouterConfig {
                server: "ms1".into(),
                prefix: "/p1".into(),
                ..Default::default()
            },
            server_name: "ms1".into(),
            proto_type: ProtoType::Stdio,
            server: None,
            tools: HashMap::new(),
            tool_schemas: Vec::new(),
            prompts: HashMap::new(),
            prompt_schemas: Vec::new(),
            transport: Some(transport.clone()),
        };

        let dispatcher = dispatcher();
        for _ in 0..3 {
            let response = dispatcher
                .dispatch_request(
                    &unit,
                    &RequestContext::default(),
                    &request(methods::TOOLS_LIST, serde_json::json!({})),
                )
                .await;
            assert_eq!(response.result.unwrap()["tools"][0]["name"], "remote-tool");
        }

        // One upstream fetch, then cache hits; the version counter moved once
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.capabilities().version(), 1);
    }

    #[tokio::test]
    async fn prompt_missing_required_argument() {
        let response = dispatcher()
            .dispatch_request(
                &http_unit(),
                &RequestContext::default(),
                &request(
                    methods::PROMPTS_GET,
                    serde_json::json!({"name": "greet", "arguments": {}}),
                ),
            )
            .await;
        assert!(response.error.is_some());
    }
}
