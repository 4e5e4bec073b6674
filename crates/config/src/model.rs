//! Configuration data model for the gateway.
//!
//! A single [`McpConfig`] document bundles routers, servers, tools, prompts
//! and proxied upstream MCP servers for one `(tenant, name)` identity. The
//! store persists these documents and their version history; the merger folds
//! many of them into one effective configuration for the state builder.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use shared::primitives::WrappedChronoDateTime;

/// A complete configuration document owned by one `(tenant, name)` identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct McpConfig {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tenant: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routers: Vec<RouterConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<PromptConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<WrappedChronoDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<WrappedChronoDateTime>,
    /// Non-empty marks this document as a tombstone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<WrappedChronoDateTime>,
}

impl McpConfig {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Composite identity used as a store key.
    pub fn key(&self) -> (String, String) {
        (self.tenant.clone(), self.name.clone())
    }
}

/// Binds a URL prefix to a named server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub server: String,
    pub prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct CorsConfig {
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub allow_credentials: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    pub mode: AuthMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Oauth2,
}

/// A logical server exposing a subset of the configured HTTP tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    /// Per-server key/value map. Values are templates, rendered once per
    /// request before any backend sees them.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

/// An HTTP-dispatched tool rendered from templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolConfig {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub method: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgConfig>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_body: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response_body: String,
    /// Optional full JSON schema overriding the one derived from `args`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    /// Per-call timeout in seconds; the gateway default applies when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ArgConfig {
    pub name: String,
    pub position: ArgPosition,
    pub required: bool,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub default: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ArgPosition {
    Header,
    #[default]
    Query,
    Path,
    Body,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptConfig {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
    /// Ordered response messages; text entries may be templates.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prompt_response: Vec<PromptResponseMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptArgument {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptResponseMessage {
    pub role: String,
    pub content: PromptResponseContent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptResponseContent {
    #[serde(rename = "type")]
    pub type_: String,
    pub text: String,
}

/// A proxied upstream MCP server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: McpServerType,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub policy: StartupPolicy,
    pub preinstalled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum McpServerType {
    #[default]
    #[serde(rename = "stdio")]
    Stdio,
    #[serde(rename = "sse")]
    Sse,
    #[serde(rename = "streamable-http")]
    StreamableHttp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StartupPolicy {
    #[serde(rename = "onStart")]
    OnStart,
    #[default]
    #[serde(rename = "onDemand")]
    OnDemand,
}

/// What kind of write produced a version record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ActionType {
    Create,
    Update,
    Delete,
    Revert,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "Create",
            ActionType::Update => "Update",
            ActionType::Delete => "Delete",
            ActionType::Revert => "Revert",
        }
    }
}

impl std::str::FromStr for ActionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Create" => Ok(ActionType::Create),
            "Update" => Ok(ActionType::Update),
            "Delete" => Ok(ActionType::Delete),
            "Revert" => Ok(ActionType::Revert),
            other => Err(anyhow::anyhow!("unknown action type: {other}")),
        }
    }
}

/// Immutable historical record of one configuration document.
///
/// Monotonic `version` per `(tenant, name)`; at most one record is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct McpConfigVersion {
    pub tenant: String,
    pub name: String,
    pub version: i64,
    pub created_by: String,
    pub created_at: WrappedChronoDateTime,
    pub action_type: ActionType,
    #[serde(default)]
    pub routers: Vec<RouterConfig>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub prompts: Vec<PromptConfig>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    pub hash: String,
    pub is_active: bool,
}

impl McpConfigVersion {
    /// Snapshot a config into a version record.
    pub fn from_config(
        cfg: &McpConfig,
        version: i64,
        created_by: &str,
        action_type: ActionType,
    ) -> Self {
        Self {
            tenant: cfg.tenant.clone(),
            name: cfg.name.clone(),
            version,
            created_by: created_by.to_string(),
            created_at: WrappedChronoDateTime::now(),
            action_type,
            routers: cfg.routers.clone(),
            servers: cfg.servers.clone(),
            tools: cfg.tools.clone(),
            prompts: cfg.prompts.clone(),
            mcp_servers: cfg.mcp_servers.clone(),
            hash: crate::hash::content_hash_parts(
                &cfg.routers,
                &cfg.servers,
                &cfg.tools,
                &cfg.prompts,
                &cfg.mcp_servers,
            ),
            is_active: false,
        }
    }

    /// Reconstruct the config document this version captured.
    ///
    /// `Delete` versions carry `deleted_at = created_at` so consumers can
    /// replay tombstones.
    pub fn to_config(&self) -> McpConfig {
        McpConfig {
            name: self.name.clone(),
            tenant: self.tenant.clone(),
            routers: self.routers.clone(),
            servers: self.servers.clone(),
            tools: self.tools.clone(),
            prompts: self.prompts.clone(),
            mcp_servers: self.mcp_servers.clone(),
            created_at: Some(self.created_at),
            updated_at: Some(self.created_at),
            deleted_at: match self.action_type {
                ActionType::Delete => Some(self.created_at),
                _ => None,
            },
        }
    }
}
