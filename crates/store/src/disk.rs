//! Disk driver: one YAML document per config, version records under a
//! `versions/` sibling tree, an `ACTIVE` marker file per config. Mutations are
//! serialized by an instance-level lock.
//!
//! Layout:
//!
//! ```text
//! root/
//!   {tenant}__{name}.yaml
//!   versions/
//!     {tenant}__{name}/
//!       1.yaml
//!       2.yaml
//!       ACTIVE
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use config::model::{ActionType, McpConfig, McpConfigVersion};
use config::content_hash;
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::{ConfigStoreLike, StoreOptions, SYSTEM_AUTHOR};

pub struct DiskStore {
    root: PathBuf,
    options: StoreOptions,
    write_lock: Mutex<()>,
}

fn file_key(tenant: &str, name: &str) -> String {
    if tenant.is_empty() {
        name.to_string()
    } else {
        format!("{tenant}__{name}")
    }
}

impl DiskStore {
    pub async fn open(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, CommonError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("versions")).await?;
        debug!(root = %root.display(), "opened disk config store");
        Ok(Self {
            root,
            options,
            write_lock: Mutex::new(()),
        })
    }

    fn config_path(&self, tenant: &str, name: &str) -> PathBuf {
        self.root.join(format!("{}.yaml", file_key(tenant, name)))
    }

    fn versions_dir(&self, tenant: &str, name: &str) -> PathBuf {
        self.root.join("versions").join(file_key(tenant, name))
    }

    async fn read_config(&self, path: &Path) -> Result<Option<McpConfig>, CommonError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(serde_yaml::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_config(&self, cfg: &McpConfig) -> Result<(), CommonError> {
        let path = self.config_path(&cfg.tenant, &cfg.name);
        tokio::fs::write(&path, serde_yaml::to_string(cfg)?).await?;
        Ok(())
    }

    async fn read_version_file(&self, path: &Path) -> Result<McpConfigVersion, CommonError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    async fn write_version(&self, version: &McpConfigVersion) -> Result<(), CommonError> {
        let dir = self.versions_dir(&version.tenant, &version.name);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.yaml", version.version));
        tokio::fs::write(&path, serde_yaml::to_string(version)?).await?;
        Ok(())
    }

    async fn active_version_of(&self, tenant: &str, name: &str) -> Result<Option<i64>, CommonError> {
        let path = self.versions_dir(tenant, name).join("ACTIVE");
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(raw.trim().parse::<i64>().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_active_marker(&self, tenant: &str, name: &str, version: i64) -> Result<(), CommonError> {
        let dir = self.versions_dir(tenant, name);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("ACTIVE"), format!("{version}\n")).await?;
        Ok(())
    }

    async fn clear_active_marker(&self, tenant: &str, name: &str) -> Result<(), CommonError> {
        let path = self.versions_dir(tenant, name).join("ACTIVE");
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All version records for one config, ascending by version number.
    async fn versions_of(&self, tenant: &str, name: &str) -> Result<Vec<McpConfigVersion>, CommonError> {
        let dir = self.versions_dir(tenant, name);
        let mut versions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                versions.push(self.read_version_file(&path).await?);
            }
        }
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    async fn next_version(&self, tenant: &str, name: &str) -> Result<i64, CommonError> {
        let versions = self.versions_of(tenant, name).await?;
        Ok(versions.last().map(|v| v.version).unwrap_or(0) + 1)
    }

    async fn prune_versions(&self, tenant: &str, name: &str, limit: usize, active: i64) -> Result<(), CommonError> {
        let versions = self.versions_of(tenant, name).await?;
        if versions.len() <= limit {
            return Ok(());
        }
        let cutoff = versions.len() - limit;
        for version in &versions[..cutoff] {
            if version.version == active {
                continue;
            }
            let path = self
                .versions_dir(tenant, name)
                .join(format!("{}.yaml", version.version));
            tokio::fs::remove_file(&path).await?;
            trace!(tenant, name, version = version.version, "pruned version file");
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStoreLike for DiskStore {
    async fn create(&self, cfg: &McpConfig) -> Result<(), CommonError> {
        let _guard = self.write_lock.lock().await;

        let path = self.config_path(&cfg.tenant, &cfg.name);
        if let Some(existing) = self.read_config(&path).await? {
            if !existing.is_deleted() {
                return Err(CommonError::duplicate(format!(
                    "config {}/{} already exists",
                    cfg.tenant, cfg.name
                )));
            }
        }

        let now = WrappedChronoDateTime::now();
        let mut stored = cfg.clone();
        stored.created_at = Some(cfg.created_at.unwrap_or(now));
        stored.updated_at = Some(now);
        stored.deleted_at = None;
        self.write_config(&stored).await?;

        let next = self.next_version(&cfg.tenant, &cfg.name).await?;
        let version = McpConfigVersion::from_config(cfg, next, SYSTEM_AUTHOR, ActionType::Create);
        self.write_version(&version).await?;
        self.set_active_marker(&cfg.tenant, &cfg.name, next).await?;
        Ok(())
    }

    async fn get(
        &self,
        tenant: &str,
        name: &str,
        include_deleted: bool,
    ) -> Result<McpConfig, CommonError> {
        let path = self.config_path(tenant, name);
        match self.read_config(&path).await? {
            Some(cfg) if include_deleted || !cfg.is_deleted() => Ok(cfg),
            _ => Err(CommonError::not_found(
                format!("config {tenant}/{name} not found"),
                format!("{tenant}/{name}"),
            )),
        }
    }

    async fn list(&self, include_deleted: bool) -> Result<Vec<McpConfig>, CommonError> {
        let mut configs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            if let Some(cfg) = self.read_config(&path).await? {
                if include_deleted || !cfg.is_deleted() {
                    configs.push(cfg);
                }
            }
        }
        configs.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(configs)
    }

    async fn update(&self, cfg: &McpConfig) -> Result<(), CommonError> {
        let _guard = self.write_lock.lock().await;

        let path = self.config_path(&cfg.tenant, &cfg.name);
        let existing = match self.read_config(&path).await? {
            Some(existing) if !existing.is_deleted() => existing,
            _ => {
                return Err(CommonError::not_found(
                    format!("config {}/{} not found", cfg.tenant, cfg.name),
                    format!("{}/{}", cfg.tenant, cfg.name),
                ));
            }
        };

        let now = WrappedChronoDateTime::now();
        let mut stored = cfg.clone();
        stored.created_at = existing.created_at;
        stored.updated_at = Some(now);
        stored.deleted_at = None;
        self.write_config(&stored).await?;

        let hash = content_hash(cfg);
        let versions = self.versions_of(&cfg.tenant, &cfg.name).await?;
        if versions.last().map(|v| v.hash.as_str()) == Some(hash.as_str()) {
            trace!(tenant = %cfg.tenant, name = %cfg.name, "update deduplicated by hash");
            return Ok(());
        }

        let next = versions.last().map(|v| v.version).unwrap_or(0) + 1;
        let version = McpConfigVersion::from_config(cfg, next, SYSTEM_AUTHOR, ActionType::Update);
        self.write_version(&version).await?;
        self.set_active_marker(&cfg.tenant, &cfg.name, next).await?;

        if let Some(limit) = self.options.revision_history_limit {
            self.prune_versions(&cfg.tenant, &cfg.name, limit, next).await?;
        }
        Ok(())
    }

    async fn delete(&self, tenant: &str, name: &str) -> Result<(), CommonError> {
        let _guard = self.write_lock.lock().await;

        let path = self.config_path(tenant, name);
        let mut existing = match self.read_config(&path).await? {
            Some(existing) if !existing.is_deleted() => existing,
            _ => {
                return Err(CommonError::not_found(
                    format!("config {tenant}/{name} not found"),
                    format!("{tenant}/{name}"),
                ));
            }
        };

        let next = self.next_version(tenant, name).await?;
        let version =
            McpConfigVersion::from_config(&existing, next, SYSTEM_AUTHOR, ActionType::Delete);
        self.write_version(&version).await?;

        existing.deleted_at = Some(WrappedChronoDateTime::now());
        self.write_config(&existing).await?;
        self.clear_active_marker(tenant, name).await?;
        Ok(())
    }

    async fn get_version(
        &self,
        tenant: &str,
        name: &str,
        version: i64,
    ) -> Result<McpConfigVersion, CommonError> {
        let path = self
            .versions_dir(tenant, name)
            .join(format!("{version}.yaml"));
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let mut record: McpConfigVersion = serde_yaml::from_str(&raw)?;
                record.is_active =
                    self.active_version_of(tenant, name).await? == Some(record.version);
                Ok(record)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CommonError::not_found(
                format!("version {version} of {tenant}/{name} not found"),
                format!("{tenant}/{name}@{version}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_versions(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Vec<McpConfigVersion>, CommonError> {
        let active = self.active_version_of(tenant, name).await?;
        let mut versions = self.versions_of(tenant, name).await?;
        for version in &mut versions {
            version.is_active = active == Some(version.version);
        }
        versions.reverse();
        Ok(versions)
    }

    async fn delete_version(
        &self,
        tenant: &str,
        name: &str,
        version: i64,
    ) -> Result<(), CommonError> {
        let _guard = self.write_lock.lock().await;

        if self.active_version_of(tenant, name).await? == Some(version) {
            return Err(CommonError::invalid_request(format!(
                "version {version} of {tenant}/{name} is active and cannot be deleted"
            )));
        }
        let path = self
            .versions_dir(tenant, name)
            .join(format!("{version}.yaml"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CommonError::not_found(
                format!("version {version} of {tenant}/{name} not found"),
                format!("{tenant}/{name}@{version}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_active_version(
        &self,
        tenant: &str,
        name: &str,
        version: i64,
    ) -> Result<(), CommonError> {
        let target = self.get_version(tenant, name, version).await?;
        let restored = target.to_config();

        let _guard = self.write_lock.lock().await;

        let next = self.next_version(tenant, name).await?;
        let revert =
            McpConfigVersion::from_config(&restored, next, SYSTEM_AUTHOR, ActionType::Revert);
        self.write_version(&revert).await?;

        let mut stored = restored;
        stored.updated_at = Some(WrappedChronoDateTime::now());
        stored.deleted_at = None;
        self.write_config(&stored).await?;
        self.set_active_marker(tenant, name, next).await?;
        Ok(())
    }

    async fn list_updated(
        &self,
        since: WrappedChronoDateTime,
    ) -> Result<Vec<McpConfig>, CommonError> {
        let versions_root = self.root.join("versions");
        let mut updated: Vec<McpConfigVersion> = Vec::new();

        let mut dirs = tokio::fs::read_dir(&versions_root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.path().is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                    continue;
                }
                let record = self.read_version_file(&path).await?;
                if record.created_at > since {
                    updated.push(record);
                }
            }
        }

        updated.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(updated.into_iter().map(|v| v.to_config()).collect())
    }
}

#[cfg(test)]
mod tests {
    use config::model::ToolConfig;

    use super::*;

    fn sample(name: &str) -> McpConfig {
        McpConfig {
            name: name.into(),
            tenant: "default".into(),
            tools: vec![ToolConfig {
                name: "echo".into(),
                method: "GET".into(),
                endpoint: "http://backend/echo".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    async fn store(dir: &tempfile::TempDir) -> DiskStore {
        DiskStore::open(dir.path(), StoreOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_writes_document_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.create(&sample("gw")).await.unwrap();

        assert!(dir.path().join("default__gw.yaml").is_file());
        assert!(dir.path().join("versions/default__gw/1.yaml").is_file());

        let cfg = store.get("default", "gw", false).await.unwrap();
        assert_eq!(cfg.tools[0].name, "echo");
    }

    #[tokio::test]
    async fn update_dedups_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.create(&sample("gw")).await.unwrap();
        store.update(&sample("gw")).await.unwrap();
        store.update(&sample("gw")).await.unwrap();
        assert_eq!(store.list_versions("default", "gw").await.unwrap().len(), 1);

        let mut changed = sample("gw");
        changed.tools[0].description = "changed".into();
        store.update(&changed).await.unwrap();
        assert_eq!(store.list_versions("default", "gw").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_then_get_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.create(&sample("gw")).await.unwrap();
        store.delete("default", "gw").await.unwrap();

        assert!(store.get("default", "gw", false).await.is_err());
        assert!(store.get("default", "gw", true).await.unwrap().is_deleted());
        assert!(store.list(false).await.unwrap().is_empty());
        assert_eq!(store.list(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn revert_restores_old_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.create(&sample("gw")).await.unwrap();
        let mut changed = sample("gw");
        changed.tools[0].description = "v2".into();
        store.update(&changed).await.unwrap();

        store.set_active_version("default", "gw", 1).await.unwrap();
        let cfg = store.get("default", "gw", false).await.unwrap();
        assert_eq!(cfg.tools[0].description, "");

        let versions = store.list_versions("default", "gw").await.unwrap();
        assert_eq!(versions[0].action_type, ActionType::Revert);
        assert!(versions[0].is_active);
    }

    #[tokio::test]
    async fn list_updated_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let epoch = WrappedChronoDateTime::try_from("2000-01-01 00:00:00.000").unwrap();

        store.create(&sample("a")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.create(&sample("b")).await.unwrap();

        let updated = store.list_updated(epoch).await.unwrap();
        assert_eq!(updated.len(), 2);
        assert_eq!(updated[0].name, "b");
    }
}
