//! Process-level settings for one gateway instance, loaded from an
//! env-expanded YAML file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notifier::composite::CompositeNotifier;
use notifier::http::HttpNotifier;
use notifier::redis::RedisNotifier;
use notifier::signal::SignalNotifier;
use notifier::{Notifier, NotifierRole};
use serde::Deserialize;
use shared::{env::expand_env, error::CommonError};
use store::disk::DiskStore;
use store::http::{HttpStore, HttpStoreSettings};
use store::sqlite::SqliteStore;
use store::{ConfigStore, StoreOptions};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub listen: String,
    pub pid_file: Option<PathBuf>,
    /// Directory of config documents seeded into the store at startup.
    pub config_dir: Option<PathBuf>,
    pub store: StoreSettings,
    pub notifier: NotifierSettings,
    pub capability_cache: CapabilityCacheSettings,
    pub call_timeout_secs: u64,
    pub build_timeout_secs: u64,
    /// Inbound header names copied verbatim onto outgoing HTTP tool requests.
    pub forward_headers: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5235".to_string(),
            pid_file: None,
            config_dir: None,
            store: StoreSettings::default(),
            notifier: NotifierSettings::default(),
            capability_cache: CapabilityCacheSettings::default(),
            call_timeout_secs: 30,
            build_timeout_secs: 30,
            forward_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    #[serde(rename = "type")]
    pub type_: StoreType,
    /// sqlite database file.
    pub path: PathBuf,
    /// disk store root directory.
    pub dir: PathBuf,
    /// http store endpoint.
    pub url: String,
    /// Optional JSON pointer into the http store response.
    pub json_path: String,
    pub revision_history_limit: Option<usize>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            type_: StoreType::Sqlite,
            path: PathBuf::from("mcpd.db"),
            dir: PathBuf::from("configs-data"),
            url: String::new(),
            json_path: String::new(),
            revision_history_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Sqlite,
    Disk,
    Http,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifierSettings {
    pub role: RoleSetting,
    #[serde(rename = "type")]
    pub type_: NotifierType,
    pub signal: SignalSettings,
    pub api: ApiNotifierSettings,
    pub redis: RedisSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleSetting {
    Sender,
    #[default]
    Receiver,
    Both,
}

impl From<RoleSetting> for NotifierRole {
    fn from(value: RoleSetting) -> Self {
        match value {
            RoleSetting::Sender => NotifierRole::Sender,
            RoleSetting::Receiver => NotifierRole::Receiver,
            RoleSetting::Both => NotifierRole::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierType {
    #[default]
    Signal,
    Api,
    Redis,
    Composite,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalSettings {
    /// Falls back to the gateway's own pid file.
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiNotifierSettings {
    pub listen: String,
    pub target_url: String,
}

impl Default for ApiNotifierSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5243".to_string(),
            target_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisSettings {
    pub url: String,
    pub stream: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            stream: "mcpd:reload".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapabilityCacheSettings {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CapabilityCacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 1000,
        }
    }
}

impl Settings {
    pub async fn load(path: &Path) -> Result<Self, CommonError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, CommonError> {
        let expanded = expand_env(raw);
        Ok(serde_yaml::from_str(&expanded)?)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn gateway_options(&self) -> gateway::GatewayOptions {
        gateway::GatewayOptions {
            call_timeout: self.call_timeout(),
            build_timeout: self.build_timeout(),
            capability_ttl: Duration::from_secs(self.capability_cache.ttl_secs),
            capability_max_entries: self.capability_cache.max_entries,
            forward_headers: self.forward_headers.clone(),
        }
    }

    pub async fn build_store(&self) -> Result<ConfigStore, CommonError> {
        let options = StoreOptions {
            revision_history_limit: self.store.revision_history_limit,
        };
        let store: ConfigStore = match self.store.type_ {
            StoreType::Sqlite => Arc::new(
                SqliteStore::open(&self.store.path.to_string_lossy(), options).await?,
            ),
            StoreType::Disk => Arc::new(DiskStore::open(self.store.dir.clone(), options).await?),
            StoreType::Http => {
                if self.store.url.is_empty() {
                    return Err(CommonError::validation("http store requires a url"));
                }
                Arc::new(HttpStore::new(HttpStoreSettings {
                    url: self.store.url.clone(),
                    json_path: self.store.json_path.clone(),
                    ..Default::default()
                })?)
            }
        };
        Ok(store)
    }

    /// Builds the notifier for the given role (the `reload` subcommand wants
    /// the sender side of the same settings the server consumes).
    pub fn build_notifier(&self, role: NotifierRole) -> Result<Notifier, CommonError> {
        self.build_notifier_of(self.notifier.type_, role)
    }

    fn build_notifier_of(
        &self,
        type_: NotifierType,
        role: NotifierRole,
    ) -> Result<Notifier, CommonError> {
        let notifier: Notifier = match type_ {
            NotifierType::Signal => {
                let pid_file = self
                    .notifier
                    .signal
                    .pid_file
                    .clone()
                    .or_else(|| self.pid_file.clone())
                    .ok_or_else(|| {
                        CommonError::validation("signal notifier requires a pid file")
                    })?;
                Arc::new(SignalNotifier::new(role, pid_file))
            }
            NotifierType::Api => {
                let listen: Option<SocketAddr> = if role.can_receive() {
                    Some(self.notifier.api.listen.parse()?)
                } else {
                    None
                };
                Arc::new(HttpNotifier::new(
                    role,
                    listen,
                    self.notifier.api.target_url.clone(),
                ))
            }
            NotifierType::Redis => Arc::new(RedisNotifier::new(
                role,
                &self.notifier.redis.url,
                self.notifier.redis.stream.clone(),
            )?),
            NotifierType::Composite => {
                let children = vec![
                    self.build_notifier_of(NotifierType::Signal, role)?,
                    self.build_notifier_of(NotifierType::Api, role)?,
                ];
                Arc::new(CompositeNotifier::new(children))
            }
        };
        Ok(notifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_on_empty_document() {
        let settings = Settings::parse("{}").unwrap();
        assert_eq!(settings.listen, "0.0.0.0:5235");
        assert_eq!(settings.store.type_, StoreType::Sqlite);
        assert_eq!(settings.notifier.type_, NotifierType::Signal);
        assert_eq!(settings.call_timeout_secs, 30);
    }

    #[test]
    fn parses_full_document_with_env_expansion() {
        // Safety: test-only env mutation
        unsafe { std::env::set_var("MCPD_TEST_STREAM", "gw:reload") };
        let raw = r#"
listen: 127.0.0.1:9000
pidFile: /tmp/mcpd.pid
configDir: ./configs
store:
  type: disk
  dir: ./data
  revisionHistoryLimit: 5
notifier:
  role: both
  type: redis
  redis:
    url: redis://cache:6379/
    stream: ${MCPD_TEST_STREAM}
capabilityCache:
  ttlSecs: 60
  maxEntries: 10
"#;
        let settings = Settings::parse(raw).unwrap();
        assert_eq!(settings.listen, "127.0.0.1:9000");
        assert_eq!(settings.store.type_, StoreType::Disk);
        assert_eq!(settings.store.revision_history_limit, Some(5));
        assert_eq!(settings.notifier.role, RoleSetting::Both);
        assert_eq!(settings.notifier.redis.stream, "gw:reload");
        assert_eq!(settings.capability_cache.ttl_secs, 60);
    }

    #[test]
    fn signal_notifier_needs_a_pid_file() {
        let settings = Settings::parse("{}").unwrap();
        assert!(settings.build_notifier(NotifierRole::Sender).is_err());

        let mut with_pid = Settings::parse("{}").unwrap();
        with_pid.pid_file = Some(PathBuf::from("/tmp/mcpd.pid"));
        assert!(with_pid.build_notifier(NotifierRole::Sender).is_ok());
    }
}
