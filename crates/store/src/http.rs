//! Read-through HTTP driver. Configuration is owned by a remote endpoint; all
//! mutating methods are accepted and discarded so callers can stay
//! driver-agnostic. Version queries return nothing.

use std::time::Duration;

use async_trait::async_trait;
use config::model::{McpConfig, McpConfigVersion};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tracing::{debug, warn};

use crate::ConfigStoreLike;

#[derive(Debug, Clone)]
pub struct HttpStoreSettings {
    pub url: String,
    /// JSON pointer selecting a sub-document of the response body, e.g.
    /// `/data/configs`. Empty means the whole body.
    pub json_path: String,
    pub timeout: Duration,
}

impl Default for HttpStoreSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            json_path: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct HttpStore {
    settings: HttpStoreSettings,
    client: reqwest::Client,
}

impl HttpStore {
    pub fn new(settings: HttpStoreSettings) -> Result<Self, CommonError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { settings, client })
    }

    async fn fetch(&self) -> Result<Vec<McpConfig>, CommonError> {
        let response = self.client.get(&self.settings.url).send().await?;
        if !response.status().is_success() {
            return Err(CommonError::repository(format!(
                "remote config endpoint returned {}",
                response.status()
            )));
        }
        let body = response.text().await?;
        parse_remote_body(&body, &self.settings.json_path)
    }
}

/// Parses a remote body as JSON first, YAML second, optionally descending
/// through a JSON pointer. Accepts a single document or an array of them.
pub fn parse_remote_body(body: &str, json_path: &str) -> Result<Vec<McpConfig>, CommonError> {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => serde_yaml::from_str::<serde_json::Value>(body)?,
    };

    let selected = if json_path.is_empty() {
        &value
    } else {
        value.pointer(json_path).ok_or_else(|| {
            CommonError::repository(format!("json path {json_path} not found in remote body"))
        })?
    };

    match selected {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| serde_json::from_value(item.clone()).map_err(CommonError::from))
            .collect(),
        other => Ok(vec![serde_json::from_value(other.clone())?]),
    }
}

#[async_trait]
impl ConfigStoreLike for HttpStore {
    async fn create(&self, cfg: &McpConfig) -> Result<(), CommonError> {
        warn!(name = %cfg.name, "http store is read-only, dropping create");
        Ok(())
    }

    async fn get(
        &self,
        tenant: &str,
        name: &str,
        include_deleted: bool,
    ) -> Result<McpConfig, CommonError> {
        self.fetch()
            .await?
            .into_iter()
            .find(|cfg| {
                cfg.tenant == tenant && cfg.name == name && (include_deleted || !cfg.is_deleted())
            })
            .ok_or_else(|| {
                CommonError::not_found(
                    format!("config {tenant}/{name} not found"),
                    format!("{tenant}/{name}"),
                )
            })
    }

    async fn list(&self, include_deleted: bool) -> Result<Vec<McpConfig>, CommonError> {
        let configs = self.fetch().await?;
        debug!(count = configs.len(), "fetched remote configs");
        Ok(configs
            .into_iter()
            .filter(|cfg| include_deleted || !cfg.is_deleted())
            .collect())
    }

    async fn update(&self, cfg: &McpConfig) -> Result<(), CommonError> {
        warn!(name = %cfg.name, "http store is read-only, dropping update");
        Ok(())
    }

    async fn delete(&self, tenant: &str, name: &str) -> Result<(), CommonError> {
        warn!(tenant, name, "http store is read-only, dropping delete");
        Ok(())
    }

    async fn get_version(
        &self,
        tenant: &str,
        name: &str,
        version: i64,
    ) -> Result<McpConfigVersion, CommonError> {
        Err(CommonError::not_found(
            format!("http store keeps no versions ({tenant}/{name}@{version})"),
            format!("{tenant}/{name}@{version}"),
        ))
    }

    async fn list_versions(
        &self,
        _tenant: &str,
        _name: &str,
    ) -> Result<Vec<McpConfigVersion>, CommonError> {
        Ok(Vec::new())
    }

    async fn delete_version(
        &self,
        _tenant: &str,
        _name: &str,
        _version: i64,
    ) -> Result<(), CommonError> {
        Ok(())
    }

    async fn set_active_version(
        &self,
        _tenant: &str,
        _name: &str,
        _version: i64,
    ) -> Result<(), CommonError> {
        Ok(())
    }

    async fn list_updated(
        &self,
        _since: WrappedChronoDateTime,
    ) -> Result<Vec<McpConfig>, CommonError> {
        // No version history: every remote document counts as updated.
        self.list(false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_array() {
        let body = r#"[{"name": "a"}, {"name": "b"}]"#;
        let configs = parse_remote_body(body, "").unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].name, "b");
    }

    #[test]
    fn parses_single_yaml_document() {
        let body = "name: gw\ntenant: default\n";
        let configs = parse_remote_body(body, "").unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].tenant, "default");
    }

    #[test]
    fn descends_json_pointer() {
        let body = r#"{"data": {"configs": [{"name": "inner"}]}}"#;
        let configs = parse_remote_body(body, "/data/configs").unwrap();
        assert_eq!(configs[0].name, "inner");
    }

    #[test]
    fn missing_pointer_is_an_error() {
        let body = r#"{"data": {}}"#;
        assert!(parse_remote_body(body, "/data/configs").is_err());
    }
}
