//! Relational driver backed by libsql. Sub-arrays are stored as JSON-encoded
//! blob columns; every mutating operation runs inside a transaction.

use async_trait::async_trait;
use config::content_hash;
use config::model::{ActionType, McpConfig, McpConfigVersion};
use libsql::params;
use shared::{
    error::CommonError,
    primitives::{WrappedChronoDateTime, WrappedJsonValue},
};
use tracing::{debug, trace};

use crate::{ConfigStoreLike, StoreOptions, SYSTEM_AUTHOR};

fn json_column<T: serde::Serialize>(value: &T) -> Result<libsql::Value, CommonError> {
    Ok(WrappedJsonValue::new(serde_json::to_value(value)?).into())
}

fn from_json_column<T: serde::de::DeserializeOwned>(
    row: &libsql::Row,
    idx: i32,
) -> Result<T, CommonError> {
    let value = WrappedJsonValue::from_sql_value(row.get_value(idx)?)?;
    Ok(serde_json::from_value(value.into_inner())?)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mcp_configs (
    tenant      TEXT NOT NULL,
    name        TEXT NOT NULL,
    routers     TEXT NOT NULL DEFAULT '[]',
    servers     TEXT NOT NULL DEFAULT '[]',
    tools       TEXT NOT NULL DEFAULT '[]',
    prompts     TEXT NOT NULL DEFAULT '[]',
    mcp_servers TEXT NOT NULL DEFAULT '[]',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    deleted_at  TEXT,
    PRIMARY KEY (tenant, name)
);

CREATE TABLE IF NOT EXISTS mcp_config_versions (
    tenant      TEXT NOT NULL,
    name        TEXT NOT NULL,
    version     INTEGER NOT NULL,
    created_by  TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,
    action_type TEXT NOT NULL,
    routers     TEXT NOT NULL DEFAULT '[]',
    servers     TEXT NOT NULL DEFAULT '[]',
    tools       TEXT NOT NULL DEFAULT '[]',
    prompts     TEXT NOT NULL DEFAULT '[]',
    mcp_servers TEXT NOT NULL DEFAULT '[]',
    hash        TEXT NOT NULL,
    PRIMARY KEY (tenant, name, version)
);

CREATE INDEX IF NOT EXISTS idx_versions_created_at
    ON mcp_config_versions (created_at);

CREATE TABLE IF NOT EXISTS active_versions (
    tenant     TEXT NOT NULL,
    name       TEXT NOT NULL,
    version    INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    PRIMARY KEY (tenant, name)
);
"#;

pub struct SqliteStore {
    // The database handle owns the connection's backing storage.
    _db: libsql::Database,
    conn: libsql::Connection,
    options: StoreOptions,
}

impl SqliteStore {
    pub async fn open(path: &str, options: StoreOptions) -> Result<Self, CommonError> {
        let db = libsql::Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        conn.execute_batch(SCHEMA).await?;
        debug!(path, "opened sqlite config store");
        Ok(Self {
            _db: db,
            conn,
            options,
        })
    }

    pub async fn open_in_memory(options: StoreOptions) -> Result<Self, CommonError> {
        Self::open(":memory:", options).await
    }

    async fn next_version(
        conn: &libsql::Connection,
        tenant: &str,
        name: &str,
    ) -> Result<i64, CommonError> {
        let mut rows = conn
            .query(
                "SELECT COALESCE(MAX(version), 0) FROM mcp_config_versions \
                 WHERE tenant = ?1 AND name = ?2",
                params![tenant, name],
            )
            .await?;
        let max = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(max + 1)
    }

    async fn insert_version(
        conn: &libsql::Connection,
        version: &McpConfigVersion,
    ) -> Result<(), CommonError> {
        conn.execute(
            "INSERT INTO mcp_config_versions \
             (tenant, name, version, created_by, created_at, action_type, \
              routers, servers, tools, prompts, mcp_servers, hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                version.tenant.as_str(),
                version.name.as_str(),
                version.version,
                version.created_by.as_str(),
                libsql::Value::from(version.created_at),
                version.action_type.as_str(),
                json_column(&version.routers)?,
                json_column(&version.servers)?,
                json_column(&version.tools)?,
                json_column(&version.prompts)?,
                json_column(&version.mcp_servers)?,
                version.hash.as_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn upsert_active(
        conn: &libsql::Connection,
        tenant: &str,
        name: &str,
        version: i64,
    ) -> Result<(), CommonError> {
        conn.execute(
            "INSERT INTO active_versions (tenant, name, version, updated_at, deleted_at) \
             VALUES (?1, ?2, ?3, ?4, NULL) \
             ON CONFLICT (tenant, name) DO UPDATE \
             SET version = excluded.version, updated_at = excluded.updated_at, deleted_at = NULL",
            params![
                tenant,
                name,
                version,
                libsql::Value::from(WrappedChronoDateTime::now())
            ],
        )
        .await?;
        Ok(())
    }

    async fn active_version_of(
        conn: &libsql::Connection,
        tenant: &str,
        name: &str,
    ) -> Result<Option<i64>, CommonError> {
        let mut rows = conn
            .query(
                "SELECT version FROM active_versions \
                 WHERE tenant = ?1 AND name = ?2 AND deleted_at IS NULL",
                params![tenant, name],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }

    async fn write_primary(
        conn: &libsql::Connection,
        cfg: &McpConfig,
        created_at: WrappedChronoDateTime,
    ) -> Result<(), CommonError> {
        conn.execute(
            "INSERT INTO mcp_configs \
             (tenant, name, routers, servers, tools, prompts, mcp_servers, \
              created_at, updated_at, deleted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL) \
             ON CONFLICT (tenant, name) DO UPDATE SET \
             routers = excluded.routers, servers = excluded.servers, \
             tools = excluded.tools, prompts = excluded.prompts, \
             mcp_servers = excluded.mcp_servers, \
             updated_at = excluded.updated_at, deleted_at = NULL",
            params![
                cfg.tenant.as_str(),
                cfg.name.as_str(),
                json_column(&cfg.routers)?,
                json_column(&cfg.servers)?,
                json_column(&cfg.tools)?,
                json_column(&cfg.prompts)?,
                json_column(&cfg.mcp_servers)?,
                libsql::Value::from(created_at),
                libsql::Value::from(WrappedChronoDateTime::now()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn prune_versions(
        conn: &libsql::Connection,
        tenant: &str,
        name: &str,
        limit: usize,
        active: i64,
    ) -> Result<(), CommonError> {
        let pruned = conn
            .execute(
                "DELETE FROM mcp_config_versions \
                 WHERE tenant = ?1 AND name = ?2 AND version != ?3 \
                 AND version NOT IN ( \
                     SELECT version FROM mcp_config_versions \
                     WHERE tenant = ?1 AND name = ?2 \
                     ORDER BY version DESC LIMIT ?4)",
                params![tenant, name, active, limit as i64],
            )
            .await?;
        if pruned > 0 {
            trace!(tenant, name, pruned, "pruned version history");
        }
        Ok(())
    }
}

fn decode_config_row(row: &libsql::Row) -> Result<McpConfig, CommonError> {
    let deleted_at = match row.get_value(9)? {
        libsql::Value::Text(s) => Some(WrappedChronoDateTime::try_from(s.as_str())?),
        _ => None,
    };
    Ok(McpConfig {
        tenant: row.get::<String>(0)?,
        name: row.get::<String>(1)?,
        routers: from_json_column(row, 2)?,
        servers: from_json_column(row, 3)?,
        tools: from_json_column(row, 4)?,
        prompts: from_json_column(row, 5)?,
        mcp_servers: from_json_column(row, 6)?,
        created_at: Some(WrappedChronoDateTime::try_from(row.get::<String>(7)?)?),
        updated_at: Some(WrappedChronoDateTime::try_from(row.get::<String>(8)?)?),
        deleted_at,
    })
}

fn decode_version_row(row: &libsql::Row, active: Option<i64>) -> Result<McpConfigVersion, CommonError> {
    let version = row.get::<i64>(2)?;
    Ok(McpConfigVersion {
        tenant: row.get::<String>(0)?,
        name: row.get::<String>(1)?,
        version,
        created_by: row.get::<String>(3)?,
        created_at: WrappedChronoDateTime::try_from(row.get::<String>(4)?)?,
        action_type: row.get::<String>(5)?.parse()?,
        routers: from_json_column(row, 6)?,
        servers: from_json_column(row, 7)?,
        tools: from_json_column(row, 8)?,
        prompts: from_json_column(row, 9)?,
        mcp_servers: from_json_column(row, 10)?,
        hash: row.get::<String>(11)?,
        is_active: active == Some(version),
    })
}

const CONFIG_COLUMNS: &str =
    "tenant, name, routers, servers, tools, prompts, mcp_servers, created_at, updated_at, deleted_at";
const VERSION_COLUMNS: &str =
    "tenant, name, version, created_by, created_at, action_type, routers, servers, tools, prompts, mcp_servers, hash";

#[async_trait]
impl ConfigStoreLike for SqliteStore {
    async fn create(&self, cfg: &McpConfig) -> Result<(), CommonError> {
        let tx = self.conn.transaction().await?;

        let mut rows = tx
            .query(
                "SELECT deleted_at FROM mcp_configs WHERE tenant = ?1 AND name = ?2",
                params![cfg.tenant.as_str(), cfg.name.as_str()],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            let tombstoned = matches!(row.get_value(0)?, libsql::Value::Text(_));
            if !tombstoned {
                return Err(CommonError::duplicate(format!(
                    "config {}/{} already exists",
                    cfg.tenant, cfg.name
                )));
            }
        }

        let now = WrappedChronoDateTime::now();
        Self::write_primary(&tx, cfg, cfg.created_at.unwrap_or(now)).await?;

        let next = Self::next_version(&tx, &cfg.tenant, &cfg.name).await?;
        let version = McpConfigVersion::from_config(cfg, next, SYSTEM_AUTHOR, ActionType::Create);
        Self::insert_version(&tx, &version).await?;
        Self::upsert_active(&tx, &cfg.tenant, &cfg.name, next).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(
        &self,
        tenant: &str,
        name: &str,
        include_deleted: bool,
    ) -> Result<McpConfig, CommonError> {
        let filter = if include_deleted {
            ""
        } else {
            " AND deleted_at IS NULL"
        };
        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM mcp_configs WHERE tenant = ?1 AND name = ?2{filter}"
        );
        let mut rows = self.conn.query(&sql, params![tenant, name]).await?;
        match rows.next().await? {
            Some(row) => decode_config_row(&row),
            None => Err(CommonError::not_found(
                format!("config {tenant}/{name} not found"),
                format!("{tenant}/{name}"),
            )),
        }
    }

    async fn list(&self, include_deleted: bool) -> Result<Vec<McpConfig>, CommonError> {
        let filter = if include_deleted {
            ""
        } else {
            " WHERE deleted_at IS NULL"
        };
        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM mcp_configs{filter} ORDER BY tenant, name"
        );
        let mut rows = self.conn.query(&sql, ()).await?;
        let mut configs = Vec::new();
        while let Some(row) = rows.next().await? {
            configs.push(decode_config_row(&row)?);
        }
        Ok(configs)
    }

    async fn update(&self, cfg: &McpConfig) -> Result<(), CommonError> {
        let tx = self.conn.transaction().await?;

        let mut rows = tx
            .query(
                "SELECT created_at FROM mcp_configs \
                 WHERE tenant = ?1 AND name = ?2 AND deleted_at IS NULL",
                params![cfg.tenant.as_str(), cfg.name.as_str()],
            )
            .await?;
        let created_at = match rows.next().await? {
            Some(row) => WrappedChronoDateTime::try_from(row.get::<String>(0)?)?,
            None => {
                return Err(CommonError::not_found(
                    format!("config {}/{} not found", cfg.tenant, cfg.name),
                    format!("{}/{}", cfg.tenant, cfg.name),
                ));
            }
        };

        let hash = content_hash(cfg);
        let mut rows = tx
            .query(
                "SELECT hash FROM mcp_config_versions \
                 WHERE tenant = ?1 AND name = ?2 ORDER BY version DESC LIMIT 1",
                params![cfg.tenant.as_str(), cfg.name.as_str()],
            )
            .await?;
        let latest_hash = match rows.next().await? {
            Some(row) => Some(row.get::<String>(0)?),
            None => None,
        };

        // Identical content: no version churn, only the primary row advances.
        Self::write_primary(&tx, cfg, created_at).await?;
        if latest_hash.as_deref() == Some(hash.as_str()) {
            trace!(tenant = %cfg.tenant, name = %cfg.name, "update deduplicated by hash");
            tx.commit().await?;
            return Ok(());
        }

        let next = Self::next_version(&tx, &cfg.tenant, &cfg.name).await?;
        let version = McpConfigVersion::from_config(cfg, next, SYSTEM_AUTHOR, ActionType::Update);
        Self::insert_version(&tx, &version).await?;
        Self::upsert_active(&tx, &cfg.tenant, &cfg.name, next).await?;

        if let Some(limit) = self.options.revision_history_limit {
            Self::prune_versions(&tx, &cfg.tenant, &cfg.name, limit, next).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, tenant: &str, name: &str) -> Result<(), CommonError> {
        let tx = self.conn.transaction().await?;

        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM mcp_configs \
             WHERE tenant = ?1 AND name = ?2 AND deleted_at IS NULL"
        );
        let mut rows = tx.query(&sql, params![tenant, name]).await?;
        let cfg = match rows.next().await? {
            Some(row) => decode_config_row(&row)?,
            None => {
                return Err(CommonError::not_found(
                    format!("config {tenant}/{name} not found"),
                    format!("{tenant}/{name}"),
                ));
            }
        };

        let next = Self::next_version(&tx, tenant, name).await?;
        let version = McpConfigVersion::from_config(&cfg, next, SYSTEM_AUTHOR, ActionType::Delete);
        Self::insert_version(&tx, &version).await?;

        let now = libsql::Value::from(WrappedChronoDateTime::now());
        tx.execute(
            "UPDATE mcp_configs SET deleted_at = ?3 WHERE tenant = ?1 AND name = ?2",
            params![tenant, name, now.clone()],
        )
        .await?;
        tx.execute(
            "UPDATE active_versions SET deleted_at = ?3 WHERE tenant = ?1 AND name = ?2",
            params![tenant, name, now],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_version(
        &self,
        tenant: &str,
        name: &str,
        version: i64,
    ) -> Result<McpConfigVersion, CommonError> {
        let active = Self::active_version_of(&self.conn, tenant, name).await?;
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM mcp_config_versions \
             WHERE tenant = ?1 AND name = ?2 AND version = ?3"
        );
        let mut rows = self.conn.query(&sql, params![tenant, name, version]).await?;
        match rows.next().await? {
            Some(row) => decode_version_row(&row, active),
            None => Err(CommonError::not_found(
                format!("version {version} of {tenant}/{name} not found"),
                format!("{tenant}/{name}@{version}"),
            )),
        }
    }

    async fn list_versions(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Vec<McpConfigVersion>, CommonError> {
        let active = Self::active_version_of(&self.conn, tenant, name).await?;
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM mcp_config_versions \
             WHERE tenant = ?1 AND name = ?2 ORDER BY version DESC"
        );
        let mut rows = self.conn.query(&sql, params![tenant, name]).await?;
        let mut versions = Vec::new();
        while let Some(row) = rows.next().await? {
            versions.push(decode_version_row(&row, active)?);
        }
        Ok(versions)
    }

    async fn delete_version(
        &self,
        tenant: &str,
        name: &str,
        version: i64,
    ) -> Result<(), CommonError> {
        if Self::active_version_of(&self.conn, tenant, name).await? == Some(version) {
            return Err(CommonError::invalid_request(format!(
                "version {version} of {tenant}/{name} is active and cannot be deleted"
            )));
        }
        let affected = self
            .conn
            .execute(
                "DELETE FROM mcp_config_versions \
                 WHERE tenant = ?1 AND name = ?2 AND version = ?3",
                params![tenant, name, version],
            )
            .await?;
        if affected == 0 {
            return Err(CommonError::not_found(
                format!("version {version} of {tenant}/{name} not found"),
                format!("{tenant}/{name}@{version}"),
            ));
        }
        Ok(())
    }

    async fn set_active_version(
        &self,
        tenant: &str,
        name: &str,
        version: i64,
    ) -> Result<(), CommonError> {
        let target = self.get_version(tenant, name, version).await?;
        let restored = target.to_config();

        let tx = self.conn.transaction().await?;

        let next = Self::next_version(&tx, tenant, name).await?;
        let revert =
            McpConfigVersion::from_config(&restored, next, SYSTEM_AUTHOR, ActionType::Revert);
        Self::insert_version(&tx, &revert).await?;
        Self::write_primary(&tx, &restored, restored.created_at.unwrap_or_else(WrappedChronoDateTime::now))
            .await?;
        Self::upsert_active(&tx, tenant, name, next).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_updated(
        &self,
        since: WrappedChronoDateTime,
    ) -> Result<Vec<McpConfig>, CommonError> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM mcp_config_versions \
             WHERE created_at > ?1 ORDER BY created_at DESC"
        );
        let mut rows = self
            .conn
            .query(&sql, params![libsql::Value::from(since)])
            .await?;
        let mut configs = Vec::new();
        while let Some(row) = rows.next().await? {
            let version = decode_version_row(&row, None)?;
            configs.push(version.to_config());
        }
        Ok(configs)
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

    async fn store() -> SqliteStore {
        SqliteStore::open_in_memory(StoreOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = store().await;
        store.create(&sample("gw")).await.unwrap();

        let cfg = store.get("default", "gw", false).await.unwrap();
        assert_eq!(cfg.tools.len(), 1);

        let versions = store.list_versions("default", "gw").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].action_type, ActionType::Create);
        assert!(versions[0].is_active);
    }

    #[tokio::test]
    async fn create_duplicate_conflicts() {
        let store = store().await;
        store.create(&sample("gw")).await.unwrap();
        let err = store.create(&sample("gw")).await.unwrap_err();
        assert!(matches!(err, CommonError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn update_is_hash_deduplicated() {
        let store = store().await;
        store.create(&sample("gw")).await.unwrap();

        // Identical content twice: no version churn
        store.update(&sample("gw")).await.unwrap();
        store.update(&sample("gw")).await.unwrap();
        assert_eq!(store.list_versions("default", "gw").await.unwrap().len(), 1);

        // One character changed: one new version
        let mut changed = sample("gw");
        changed.tools[0].description = "echoes the message".into();
        store.update(&changed).await.unwrap();
        let versions = store.list_versions("default", "gw").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].action_type, ActionType::Update);
    }

    #[tokio::test]
    async fn delete_tombstones_and_hides() {
        let store = store().await;
        store.create(&sample("gw")).await.unwrap();
        store.delete("default", "gw").await.unwrap();

        assert!(matches!(
            store.get("default", "gw", false).await.unwrap_err(),
            CommonError::NotFound { .. }
        ));
        let tombstone = store.get("default", "gw", true).await.unwrap();
        assert!(tombstone.is_deleted());

        let versions = store.list_versions("default", "gw").await.unwrap();
        assert_eq!(versions[0].action_type, ActionType::Delete);
    }

    #[tokio::test]
    async fn create_untombstones() {
        let store = store().await;
        store.create(&sample("gw")).await.unwrap();
        store.delete("default", "gw").await.unwrap();

        let mut revived = sample("gw");
        revived.tools[0].description = "second life".into();
        store.create(&revived).await.unwrap();

        let cfg = store.get("default", "gw", false).await.unwrap();
        assert_eq!(cfg.tools[0].description, "second life");
        // Create / Delete / Create
        assert_eq!(store.list_versions("default", "gw").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn revert_appends_and_restores() {
        let store = store().await;
        store.create(&sample("gw")).await.unwrap();
        let mut changed = sample("gw");
        changed.tools[0].description = "v2".into();
        store.update(&changed).await.unwrap();

        store.set_active_version("default", "gw", 1).await.unwrap();

        let cfg = store.get("default", "gw", false).await.unwrap();
        assert_eq!(cfg.tools[0].description, "");

        let versions = store.list_versions("default", "gw").await.unwrap();
        assert_eq!(versions.len(), 3);
        assert_eq!(versions[0].action_type, ActionType::Revert);
        assert!(versions[0].is_active);
        // Restored content hashes back to version 1's
        assert_eq!(versions[0].hash, versions[2].hash);
    }

    #[tokio::test]
    async fn active_version_cannot_be_deleted() {
        let store = store().await;
        store.create(&sample("gw")).await.unwrap();
        let err = store.delete_version("default", "gw", 1).await.unwrap_err();
        assert!(matches!(err, CommonError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn retention_prunes_old_versions() {
        let store = SqliteStore::open_in_memory(StoreOptions {
            revision_history_limit: Some(2),
        })
        .await
        .unwrap();
        store.create(&sample("gw")).await.unwrap();
        for i in 0..4 {
            let mut changed = sample("gw");
            changed.tools[0].description = format!("rev {i}");
            store.update(&changed).await.unwrap();
        }
        let versions = store.list_versions("default", "gw").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0].is_active);
    }

    #[tokio::test]
    async fn list_updated_replays_tombstones() {
        let store = store().await;
        let epoch = WrappedChronoDateTime::try_from("2000-01-01 00:00:00.000").unwrap();

        store.create(&sample("gw")).await.unwrap();
        store.delete("default", "gw").await.unwrap();

        let updated = store.list_updated(epoch).await.unwrap();
        assert_eq!(updated.len(), 2);
        // Newest first: the tombstone replay
        assert!(updated[0].is_deleted());
        assert!(!updated[1].is_deleted());

        let nothing = store.list_updated(WrappedChronoDateTime::now()).await.unwrap();
        assert!(nothing.is_empty());
    }
}
