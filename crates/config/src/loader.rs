//! YAML loading with environment-variable expansion.

use std::path::Path;

use shared::{env::expand_env, error::CommonError};
use tracing::debug;

use crate::model::McpConfig;

/// Parses one configuration document. `${VAR}` / `${VAR:default}` references
/// are expanded before the YAML parser sees the text.
pub fn parse_config(raw: &str) -> Result<McpConfig, CommonError> {
    let expanded = expand_env(raw);
    let cfg: McpConfig = serde_yaml::from_str(&expanded)?;
    if cfg.name.is_empty() {
        return Err(CommonError::validation("config document has no name"));
    }
    Ok(cfg)
}

pub async fn load_config_file(path: &Path) -> Result<McpConfig, CommonError> {
    let raw = tokio::fs::read_to_string(path).await?;
    parse_config(&raw)
}

/// Loads every `*.yaml` / `*.yml` in a directory, sorted by file name so the
/// merge order is deterministic.
pub async fn load_config_dir(dir: &Path) -> Result<Vec<McpConfig>, CommonError> {
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => paths.push(path),
            _ => {}
        }
    }
    paths.sort();

    let mut configs = Vec::with_capacity(paths.len());
    for path in paths {
        debug!(path = %path.display(), "loading config document");
        configs.push(load_config_file(&path).await?);
    }
    Ok(configs)
}
