//! Compiled runtime state.
//!
//! A snapshot maps URL prefixes to runtime units and owns the upstream
//! transports. Snapshots are immutable once built; installation is one atomic
//! pointer store and readers capture the pointer once per request or session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use config::hash::mcp_server_hash;
use config::model::{
    McpConfig, McpServerType, PromptConfig, RouterConfig, ServerConfig, StartupPolicy, ToolConfig,
};
use mcp::protocol::{PromptArgSchema, PromptSchema, ToolSchema};
use mcp::transport::{Transport, new_transport};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoType {
    Http,
    Stdio,
    Sse,
    StreamableHttp,
}

impl From<McpServerType> for ProtoType {
    fn from(value: McpServerType) -> Self {
        match value {
            McpServerType::Stdio => ProtoType::Stdio,
            McpServerType::Sse => ProtoType::Sse,
            McpServerType::StreamableHttp => ProtoType::StreamableHttp,
        }
    }
}

impl ProtoType {
    pub fn is_proxy(&self) -> bool {
        !matches!(self, ProtoType::Http)
    }
}

/// Everything needed to serve one prefix.
pub struct RuntimeUnit {
    pub router: RouterConfig,
    pub server_name: String,
    pub proto_type: ProtoType,
    pub server: Option<ServerConfig>,
    pub tools: HashMap<String, ToolConfig>,
    pub tool_schemas: Vec<ToolSchema>,
    pub prompts: HashMap<String, PromptConfig>,
    pub prompt_schemas: Vec<PromptSchema>,
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StateMetrics {
    pub total_tools: usize,
    /// Names listed in `allowedTools` with no tool definition.
    pub missing_tools: usize,
}

pub struct RuntimeState {
    pub units: HashMap<String, Arc<RuntimeUnit>>,
    /// Upstream transports by server name with their config hash, shared into
    /// later snapshots while the hash holds.
    pub transports: HashMap<String, (String, Transport)>,
    pub metrics: StateMetrics,
    pub built_at: WrappedChronoDateTime,
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("units", &self.units.keys().collect::<Vec<_>>())
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("metrics", &self.metrics)
            .field("built_at", &self.built_at)
            .finish()
    }
}

impl RuntimeState {
    pub fn empty() -> Self {
        Self {
            units: HashMap::new(),
            transports: HashMap::new(),
            metrics: StateMetrics::default(),
            built_at: WrappedChronoDateTime::now(),
        }
    }

    pub fn unit(&self, prefix: &str) -> Option<Arc<RuntimeUnit>> {
        self.units.get(prefix).cloned()
    }
}

pub type StateRef = Arc<ArcSwap<RuntimeState>>;

pub fn new_state_ref() -> StateRef {
    Arc::new(ArcSwap::from_pointee(RuntimeState::empty()))
}

/// JSON schema derived from a tool's argument list, unless the tool carries
/// an explicit schema.
pub fn tool_input_schema(tool: &ToolConfig) -> serde_json::Value {
    if let Some(schema) = &tool.input_schema {
        return schema.clone();
    }

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for arg in &tool.args {
        let mut prop = serde_json::Map::new();
        prop.insert(
            "type".to_string(),
            serde_json::Value::String(if arg.type_.is_empty() {
                "string".to_string()
            } else {
                arg.type_.clone()
            }),
        );
        if !arg.description.is_empty() {
            prop.insert(
                "description".to_string(),
                serde_json::Value::String(arg.description.clone()),
            );
        }
        if let Some(items) = &arg.items {
            prop.insert("items".to_string(), items.clone());
        }
        properties.insert(arg.name.clone(), serde_json::Value::Object(prop));
        if arg.required {
            required.push(serde_json::Value::String(arg.name.clone()));
        }
    }

    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn prompt_schema(prompt: &PromptConfig) -> PromptSchema {
    PromptSchema {
        name: prompt.name.clone(),
        description: prompt.description.clone(),
        arguments: prompt
            .arguments
            .iter()
            .map(|arg| PromptArgSchema {
                name: arg.name.clone(),
                description: arg.description.clone(),
                required: arg.required,
            })
            .collect(),
    }
}

fn duplicate_check<'a>(
    names: impl Iterator<Item = &'a str>,
    what: &str,
) -> Result<(), CommonError> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(CommonError::validation(format!("duplicate {what}: {name}")));
        }
    }
    Ok(())
}

/// Compiles an effective config into a runtime snapshot, reusing transports
/// from the previous snapshot when the upstream definition is unchanged by
/// content hash. Validation failures leave the previous snapshot in place.
pub fn build_state(
    effective: &McpConfig,
    prev: Option<&RuntimeState>,
    call_timeout: Duration,
) -> Result<RuntimeState, CommonError> {
    duplicate_check(
        effective
            .servers
            .iter()
            .map(|s| s.name.as_str())
            .chain(effective.mcp_servers.iter().map(|m| m.name.as_str())),
        "server name",
    )?;
    duplicate_check(effective.tools.iter().map(|t| t.name.as_str()), "tool name")?;

    // Upstream transports: reuse by (name, content hash), rebuild otherwise
    let mut transports: HashMap<String, (String, Transport)> = HashMap::new();
    let mut started_eagerly = Vec::new();
    for server in &effective.mcp_servers {
        let hash = mcp_server_hash(server);
        let reused = prev
            .and_then(|p| p.transports.get(&server.name))
            .filter(|(old_hash, _)| *old_hash == hash)
            .map(|(_, transport)| transport.clone());

        let transport = match reused {
            Some(transport) => {
                debug!(server = %server.name, "reusing upstream transport");
                transport
            }
            None => {
                let transport = new_transport(server, call_timeout)?;
                if server.policy == StartupPolicy::OnStart {
                    started_eagerly.push((server.name.clone(), transport.clone()));
                }
                transport
            }
        };
        transports.insert(server.name.clone(), (hash, transport));
    }

    let mut metrics = StateMetrics::default();
    let mut units: HashMap<String, Arc<RuntimeUnit>> = HashMap::new();

    for router in &effective.routers {
        if units.contains_key(&router.prefix) {
            return Err(CommonError::validation(format!(
                "duplicate router prefix: {}",
                router.prefix
            )));
        }

        let unit = if let Some(server) = effective.servers.iter().find(|s| s.name == router.server)
        {
            let mut tools = HashMap::new();
            let mut tool_schemas = Vec::new();
            for allowed in &server.allowed_tools {
                match effective.tools.iter().find(|t| &t.name == allowed) {
                    Some(tool) => {
                        metrics.total_tools += 1;
                        tool_schemas.push(ToolSchema {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            input_schema: tool_input_schema(tool),
                        });
                        tools.insert(tool.name.clone(), tool.clone());
                    }
                    None => {
                        warn!(server = %server.name, tool = %allowed, "allowed tool has no definition");
                        metrics.missing_tools += 1;
                    }
                }
            }

            let prompts: HashMap<String, PromptConfig> = effective
                .prompts
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect();
            let prompt_schemas = effective.prompts.iter().map(prompt_schema).collect();

            RuntimeUnit {
                router: router.clone(),
                server_name: server.name.clone(),
                proto_type: ProtoType::Http,
                server: Some(server.clone()),
                tools,
                tool_schemas,
                prompts,
                prompt_schemas,
                transport: None,
            }
        } else if let Some(upstream) = effective
            .mcp_servers
            .iter()
            .find(|m| m.name == router.server)
        {
            let Some((_, transport)) = transports.get(&upstream.name) else {
                return Err(CommonError::validation(format!(
                    "no transport for upstream server {}",
                    upstream.name
                )));
            };
            RuntimeUnit {
                router: router.clone(),
                server_name: upstream.name.clone(),
                proto_type: upstream.type_.into(),
                server: None,
                tools: HashMap::new(),
                tool_schemas: Vec::new(),
                prompts: HashMap::new(),
                prompt_schemas: Vec::new(),
                transport: Some(transport.clone()),
            }
        } else {
            return Err(CommonError::validation(format!(
                "router {} references unknown server {}",
                router.prefix, router.server
            )));
        };

        units.insert(router.prefix.clone(), Arc::new(unit));
    }

    // Eager dial for onStart policies; failures stay retriable and never
    // block the snapshot
    for (name, transport) in started_eagerly {
        tokio::spawn(async move {
            if let Err(e) = transport.start().await {
                warn!(server = %name, error = %e, "eager transport start failed, will retry on demand");
            }
        });
    }

    info!(
        prefixes = units.len(),
        total_tools = metrics.total_tools,
        missing_tools = metrics.missing_tools,
        "runtime state built"
    );

    Ok(RuntimeState {
        units,
        transports,
        metrics,
        built_at: WrappedChronoDateTime::now(),
    })
}

/// Stops transports from `prev` that did not carry over into `next`. Runs
/// detached after the new snapshot is installed.
pub fn stop_removed_transports(prev: &RuntimeState, next: &RuntimeState) {
    for (name, (_, old_transport)) in &prev.transports {
        let carried_over = next
            .transports
            .get(name)
            .is_some_and(|(_, new_transport)| Arc::ptr_eq(old_transport, new_transport));
        if !carried_over {
            let name = name.clone();
            let transport = old_transport.clone();
            tokio::spawn(async move {
                debug!(server = %name, "stopping replaced upstream transport");
                if let Err(e) = transport.stop().await {
                    warn!(server = %name, error = %e, "stopping replaced transport failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use config::model::{ArgConfig, ArgPosition, McpServerConfig};

    use super::*;

    fn http_config() -> McpConfig {
        McpConfig {
            name: "gw".into(),
            routers: vec![RouterConfig {
                server: "s1".into(),
                prefix: "/h1".into(),
                ..Default::default()
            }],
            servers: vec![ServerConfig {
                name: "s1".into(),
                allowed_tools: vec!["echo".into(), "ghost".into()],
                ..Default::default()
            }],
            tools: vec![ToolConfig {
                name: "echo".into(),
                method: "GET".into(),
                endpoint: "http://backend/echo".into(),
                args: vec![ArgConfig {
                    name: "msg".into(),
                    position: ArgPosition::Query,
                    required: true,
                    type_: "string".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn proxy_config(command: &str) -> McpConfig {
        McpConfig {
            name: "gw".into(),
            routers: vec![RouterConfig {
                server: "ms1".into(),
                prefix: "/p1".into(),
                ..Default::default()
            }],
            mcp_servers: vec![McpServerConfig {
                name: "ms1".into(),
                type_: McpServerType::Stdio,
                command: command.into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn builds_http_unit_with_schemas_and_metrics() {
        let state = build_state(&http_config(), None, Duration::from_secs(5)).unwrap();
        let unit = state.unit("/h1").expect("unit for /h1");
        assert_eq!(unit.proto_type, ProtoType::Http);
        assert_eq!(unit.tool_schemas.len(), 1);
        assert_eq!(unit.tool_schemas[0].name, "echo");
        assert_eq!(
            unit.tool_schemas[0].input_schema["required"],
            serde_json::json!(["msg"])
        );
        assert_eq!(state.metrics.total_tools, 1);
        assert_eq!(state.metrics.missing_tools, 1);
    }

    #[tokio::test]
    async fn rejects_duplicate_prefixes() {
        let mut cfg = http_config();
        cfg.routers.push(cfg.routers[0].clone());
        let err = build_state(&cfg, None, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, CommonError::Validation { .. }));
    }

    #[tokio::test]
    async fn rejects_unknown_server_reference() {
        let mut cfg = http_config();
        cfg.routers[0].server = "nope".into();
        let err = build_state(&cfg, None, Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("invalid"));
    }

    #[tokio::test]
    async fn rejects_duplicate_tool_and_server_names() {
        let mut cfg = http_config();
        cfg.tools.push(cfg.tools[0].clone());
        assert!(build_state(&cfg, None, Duration::from_secs(5)).is_err());

        let mut cfg = http_config();
        cfg.servers.push(cfg.servers[0].clone());
        assert!(build_state(&cfg, None, Duration::from_secs(5)).is_err());
    }

    #[tokio::test]
    async fn transport_reused_when_hash_unchanged() {
        let cfg = proxy_config("/bin/echo-mcp");
        let first = build_state(&cfg, None, Duration::from_secs(5)).unwrap();
        let second = build_state(&cfg, Some(&first), Duration::from_secs(5)).unwrap();

        let (_, t1) = &first.transports["ms1"];
        let (_, t2) = &second.transports["ms1"];
        assert!(Arc::ptr_eq(t1, t2));
    }

    #[tokio::test]
    async fn transport_rebuilt_when_config_changes() {
        let first = build_state(&proxy_config("/bin/echo-mcp"), None, Duration::from_secs(5))
            .unwrap();
        let changed = proxy_config("/bin/other-mcp");
        let second =
            build_state(&changed, Some(&first), Duration::from_secs(5)).unwrap();

        let (_, t1) = &first.transports["ms1"];
        let (_, t2) = &second.transports["ms1"];
        assert!(!Arc::ptr_eq(t1, t2));
    }

    #[test]
    fn explicit_input_schema_wins() {
        let tool = ToolConfig {
            name: "echo".into(),
            input_schema: Some(serde_json::json!({"type": "object", "properties": {}})),
            args: vec![ArgConfig {
                name: "ignored".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let schema = tool_input_schema(&tool);
        assert!(schema["properties"].as_object().unwrap().is_empty());
    }
}
