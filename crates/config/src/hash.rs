//! Content hashing for update dedup and transport reuse.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::{
    McpConfig, McpServerConfig, PromptConfig, RouterConfig, ServerConfig, ToolConfig,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashedDocument<'a> {
    routers: &'a [RouterConfig],
    servers: &'a [ServerConfig],
    tools: &'a [ToolConfig],
    prompts: &'a [PromptConfig],
    mcp_servers: &'a [McpServerConfig],
}

fn sha256_hex<T: Serialize>(value: &T) -> String {
    // serde_json emits struct fields in declaration order, which makes the
    // serialization stable for identical content.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Hash of the dispatchable sections of a config document. Timestamps and
/// identity are excluded so reload-idempotent writes dedup.
pub fn content_hash(cfg: &McpConfig) -> String {
    content_hash_parts(
        &cfg.routers,
        &cfg.servers,
        &cfg.tools,
        &cfg.prompts,
        &cfg.mcp_servers,
    )
}

pub fn content_hash_parts(
    routers: &[RouterConfig],
    servers: &[ServerConfig],
    tools: &[ToolConfig],
    prompts: &[PromptConfig],
    mcp_servers: &[McpServerConfig],
) -> String {
    sha256_hex(&HashedDocument {
        routers,
        servers,
        tools,
        prompts,
        mcp_servers,
    })
}

/// Hash of one upstream server definition, headers and env included. Drives
/// transport reuse across snapshots.
pub fn mcp_server_hash(server: &McpServerConfig) -> String {
    sha256_hex(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::McpServerType;

    fn sample() -> McpConfig {
        McpConfig {
            name: "gw".into(),
            tenant: "default".into(),
            routers: vec![RouterConfig {
                server: "s1".into(),
                prefix: "/h1".into(),
                ..Default::default()
            }],
            servers: vec![ServerConfig {
                name: "s1".into(),
                allowed_tools: vec!["echo".into()],
                ..Default::default()
            }],
            tools: vec![ToolConfig {
                name: "echo".into(),
                method: "GET".into(),
                endpoint: "http://backend/echo".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn identical_content_identical_hash() {
        assert_eq!(content_hash(&sample()), content_hash(&sample()));
    }

    #[test]
    fn timestamps_do_not_affect_the_hash() {
        let mut a = sample();
        a.updated_at = Some(shared::primitives::WrappedChronoDateTime::now());
        assert_eq!(content_hash(&a), content_hash(&sample()));
    }

    #[test]
    fn single_character_edit_changes_the_hash() {
        let mut b = sample();
        b.tools[0].description = "x".into();
        assert_ne!(content_hash(&sample()), content_hash(&b));
    }

    #[test]
    fn server_hash_covers_headers_and_env() {
        let base = McpServerConfig {
            name: "ms1".into(),
            type_: McpServerType::Stdio,
            command: "/bin/echo-mcp".into(),
            ..Default::default()
        };
        let mut with_env = base.clone();
        with_env.env.insert("TOKEN".into(), "t".into());
        assert_ne!(mcp_server_hash(&base), mcp_server_hash(&with_env));
    }
}
