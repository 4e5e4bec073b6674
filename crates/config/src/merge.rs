//! Folds many per-tenant config documents into one effective configuration.

use tracing::trace;

use crate::model::McpConfig;

/// Merges documents in caller order. Entries are keyed by router prefix or by
/// name; later entries win. A tombstoned document withdraws every entry it
/// contributes instead of inserting it. Uniqueness across the result is the
/// state builder's invariant, not the merger's.
pub fn merge_configs(configs: &[McpConfig]) -> McpConfig {
    let mut effective = McpConfig::default();

    for cfg in configs {
        let withdraw = cfg.is_deleted();
        trace!(
            tenant = %cfg.tenant,
            name = %cfg.name,
            withdraw,
            "merging config document"
        );

        merge_section(&mut effective.routers, &cfg.routers, withdraw, |r| {
            r.prefix.clone()
        });
        merge_section(&mut effective.servers, &cfg.servers, withdraw, |s| {
            s.name.clone()
        });
        merge_section(&mut effective.tools, &cfg.tools, withdraw, |t| {
            t.name.clone()
        });
        merge_section(&mut effective.prompts, &cfg.prompts, withdraw, |p| {
            p.name.clone()
        });
        merge_section(&mut effective.mcp_servers, &cfg.mcp_servers, withdraw, |m| {
            m.name.clone()
        });
    }

    effective
}

fn merge_section<T: Clone, K: Eq>(
    running: &mut Vec<T>,
    incoming: &[T],
    withdraw: bool,
    key: impl Fn(&T) -> K,
) {
    for item in incoming {
        let item_key = key(item);
        if withdraw {
            running.retain(|existing| key(existing) != item_key);
        } else if let Some(existing) = running.iter_mut().find(|e| key(e) == item_key) {
            *existing = item.clone();
        } else {
            running.push(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use shared::primitives::WrappedChronoDateTime;

    use super::*;
    use crate::model::{RouterConfig, ServerConfig, ToolConfig};

    fn doc(name: &str, prefix: &str, tool: &str) -> McpConfig {
        McpConfig {
            name: name.into(),
            routers: vec![RouterConfig {
                server: name.into(),
                prefix: prefix.into(),
                ..Default::default()
            }],
            servers: vec![ServerConfig {
                name: name.into(),
                ..Default::default()
            }],
            tools: vec![ToolConfig {
                name: tool.into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn union_across_documents() {
        let merged = merge_configs(&[doc("a", "/a", "t-a"), doc("b", "/b", "t-b")]);
        assert_eq!(merged.routers.len(), 2);
        assert_eq!(merged.servers.len(), 2);
        assert_eq!(merged.tools.len(), 2);
    }

    #[test]
    fn later_entries_win() {
        let mut first = doc("a", "/a", "t");
        first.tools[0].description = "old".into();
        let mut second = doc("b", "/b", "t");
        second.tools[0].description = "new".into();

        let merged = merge_configs(&[first, second]);
        assert_eq!(merged.tools.len(), 1);
        assert_eq!(merged.tools[0].description, "new");
    }

    #[test]
    fn tombstone_withdraws_contribution() {
        let live = doc("a", "/a", "t-a");
        let mut dead = doc("b", "/a", "t-a");
        dead.deleted_at = Some(WrappedChronoDateTime::now());

        let merged = merge_configs(&[live, dead]);
        assert!(merged.routers.is_empty());
        assert!(merged.tools.is_empty());
    }

    #[test]
    fn tombstone_only_touches_its_own_keys() {
        let live = doc("a", "/a", "t-a");
        let mut dead = doc("b", "/b", "t-b");
        dead.deleted_at = Some(WrappedChronoDateTime::now());

        let merged = merge_configs(&[live, dead]);
        assert_eq!(merged.routers.len(), 1);
        assert_eq!(merged.routers[0].prefix, "/a");
    }
}
