//! Versioned configuration store.
//!
//! Three drivers share one contract: a relational driver (libsql), a disk
//! driver (one YAML document per config with a `versions/` sibling tree) and a
//! read-through HTTP driver whose mutating methods are no-ops.

pub mod disk;
pub mod http;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use config::model::{McpConfig, McpConfigVersion};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};

/// Author recorded on version records produced by internal writes.
pub const SYSTEM_AUTHOR: &str = "system";

#[async_trait]
pub trait ConfigStoreLike: Send + Sync {
    /// Inserts a new config. Re-creating a tombstoned `(tenant, name)`
    /// un-tombstones it and overwrites the content in one transaction; a live
    /// duplicate is an error. Both paths append a `Create` version.
    async fn create(&self, cfg: &McpConfig) -> Result<(), CommonError>;

    async fn get(
        &self,
        tenant: &str,
        name: &str,
        include_deleted: bool,
    ) -> Result<McpConfig, CommonError>;

    async fn list(&self, include_deleted: bool) -> Result<Vec<McpConfig>, CommonError>;

    /// Content-hash deduplicated: when the latest version carries the same
    /// hash no new version is appended (the primary row's `updated_at` still
    /// advances).
    async fn update(&self, cfg: &McpConfig) -> Result<(), CommonError>;

    /// Appends a `Delete` version, then soft-tombstones the primary and
    /// active-version rows.
    async fn delete(&self, tenant: &str, name: &str) -> Result<(), CommonError>;

    async fn get_version(
        &self,
        tenant: &str,
        name: &str,
        version: i64,
    ) -> Result<McpConfigVersion, CommonError>;

    /// Versions for one config, newest first.
    async fn list_versions(
        &self,
        tenant: &str,
        name: &str,
    ) -> Result<Vec<McpConfigVersion>, CommonError>;

    /// Fails when the targeted version is the active one.
    async fn delete_version(
        &self,
        tenant: &str,
        name: &str,
        version: i64,
    ) -> Result<(), CommonError>;

    /// Appends a `Revert` version whose content equals version `v`'s, replaces
    /// the primary content and advances the active version.
    async fn set_active_version(
        &self,
        tenant: &str,
        name: &str,
        version: i64,
    ) -> Result<(), CommonError>;

    /// Configs reconstructed from every version created strictly after
    /// `since`, newest first. `Delete` versions carry
    /// `deleted_at = created_at` so consumers can replay tombstones.
    async fn list_updated(
        &self,
        since: WrappedChronoDateTime,
    ) -> Result<Vec<McpConfig>, CommonError>;
}

pub type ConfigStore = Arc<dyn ConfigStoreLike>;

/// Shared driver options.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// When set, versions beyond this count (never the active one) are pruned
    /// after each successful update.
    pub revision_history_limit: Option<usize>,
}
