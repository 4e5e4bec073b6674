//! Read-through cache for upstream capability listings.
//!
//! Keyed by (scope, server, kind); entries expire by TTL and the map is
//! bounded with LRU eviction. A process-wide version counter increments on
//! every write so external consumers can detect change. A background sweeper
//! drops expired entries and reports cache health.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use mcp::protocol::{PromptSchema, ToolSchema};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    /// Namespace for the server name, usually the router prefix.
    pub scope: String,
    pub server: String,
    pub kind: &'static str,
}

impl CacheKey {
    pub fn tools(scope: &str, server: &str) -> Self {
        Self {
            scope: scope.to_string(),
            server: server.to_string(),
            kind: "tools",
        }
    }

    pub fn prompts(scope: &str, server: &str) -> Self {
        Self {
            scope: scope.to_string(),
            server: server.to_string(),
            kind: "prompts",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityInfo {
    Tools(Vec<ToolSchema>),
    Prompts(Vec<PromptSchema>),
}

struct Entry {
    info: CapabilityInfo,
    expires_at: Instant,
    version: u64,
    access_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHealth {
    Healthy,
    /// At or beyond 80% of capacity.
    Warning,
    /// Full.
    Critical,
}

pub struct CapabilityCache {
    entries: Mutex<LruCache<CacheKey, Entry>>,
    ttl: Duration,
    capacity: usize,
    version: AtomicU64,
}

impl CapabilityCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let capacity = max_entries.max(1);
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
            capacity,
            version: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CapabilityInfo> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.access_count += 1;
                Some(entry.info.clone())
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: CacheKey, info: CapabilityInfo) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entries = self.entries.lock();
        entries.put(
            key,
            Entry {
                info,
                expires_at: Instant::now() + self.ttl,
                version,
                access_count: 0,
            },
        );
    }

    /// Current value of the write counter.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Version recorded on one entry, if present and fresh.
    pub fn entry_version(&self, key: &CacheKey) -> Option<u64> {
        let mut entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.version)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn health(&self) -> CacheHealth {
        let len = self.len();
        if len >= self.capacity {
            CacheHealth::Critical
        } else if len * 5 >= self.capacity * 4 {
            CacheHealth::Warning
        } else {
            CacheHealth::Healthy
        }
    }

    /// Removes expired entries, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let dropped = cache.sweep();
                        match cache.health() {
                            CacheHealth::Healthy => {
                                debug!(dropped, entries = cache.len(), "capability cache sweep");
                            }
                            CacheHealth::Warning => {
                                warn!(entries = cache.len(), "capability cache nearing capacity");
                            }
                            CacheHealth::Critical => {
                                warn!(entries = cache.len(), "capability cache full, evicting by lru");
                            }
                        }
                    }
                }
            }
            info!("capability cache sweeper stopped");
        })
    }
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools_info(name: &str) -> CapabilityInfo {
        CapabilityInfo::Tools(vec![ToolSchema {
            name: name.into(),
            ..Default::default()
        }])
    }

    #[test]
    fn put_get_and_version_counter() {
        let cache = CapabilityCache::new(Duration::from_secs(60), 10);
        assert_eq!(cache.version(), 0);

        let key = CacheKey::tools("/h1", "s1");
        cache.put(key.clone(), tools_info("echo"));
        assert_eq!(cache.version(), 1);
        assert_eq!(cache.entry_version(&key), Some(1));
        assert!(matches!(cache.get(&key), Some(CapabilityInfo::Tools(t)) if t[0].name == "echo"));

        cache.put(key.clone(), tools_info("echo2"));
        assert_eq!(cache.version(), 2);
        assert_eq!(cache.entry_version(&key), Some(2));
    }

    #[test]
    fn ttl_expiry() {
        let cache = CapabilityCache::new(Duration::from_millis(0), 10);
        let key = CacheKey::tools("/h1", "s1");
        cache.put(key.clone(), tools_info("echo"));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = CapabilityCache::new(Duration::from_secs(60), 2);
        let a = CacheKey::tools("/a", "s");
        let b = CacheKey::tools("/b", "s");
        let c = CacheKey::tools("/c", "s");

        cache.put(a.clone(), tools_info("a"));
        cache.put(b.clone(), tools_info("b"));
        // Touch `a` so `b` is the eviction candidate
        assert!(cache.get(&a).is_some());
        cache.put(c.clone(), tools_info("c"));

        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
    }

    #[test]
    fn health_thresholds() {
        let cache = CapabilityCache::new(Duration::from_secs(60), 5);
        assert_eq!(cache.health(), CacheHealth::Healthy);
        for i in 0..4 {
            cache.put(CacheKey::tools(&format!("/{i}"), "s"), tools_info("t"));
        }
        assert_eq!(cache.health(), CacheHealth::Warning);
        cache.put(CacheKey::tools("/last", "s"), tools_info("t"));
        assert_eq!(cache.health(), CacheHealth::Critical);
    }

    #[test]
    fn sweep_drops_only_expired() {
        let cache = CapabilityCache::new(Duration::from_secs(60), 10);
        cache.put(CacheKey::tools("/fresh", "s"), tools_info("t"));
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.len(), 1);
    }
}
