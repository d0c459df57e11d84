//! Query result cache.
//!
//! Entries map a (tenant, question, schema fingerprint) key onto a
//! previously validated and successfully executed query. Every mutation on
//! the request path is best-effort: a cache failure degrades to "no cache"
//! and never fails the response.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Cache entry lifetime: 7 days.
pub const CACHE_TTL_SECONDS: u64 = 604_800;

/// Persisted cache entry. Field names are part of the observable contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub tenant: String,
    pub question: String,
    pub tables: Vec<String>,
    pub sql: String,
    pub explanation: String,
    pub schema_fingerprint: String,
    /// Epoch seconds.
    pub created_at: i64,
    /// Epoch seconds. An entry past this point is absent even if still stored.
    pub expires_at: i64,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at < now
    }
}

/// Summary returned by the cache stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_cached_queries: usize,
    pub total_cache_hits: u64,
    pub most_popular_queries: Vec<PopularQuery>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PopularQuery {
    pub question: String,
    pub hits: u64,
    pub created_at: i64,
}

/// Key/value store for generated queries with TTL expiry and per-tenant
/// enumeration. Implementations must tolerate concurrent writers for the
/// same key: inputs are deterministic, so last-writer-wins is safe.
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Look up an entry, treating anything past its expiry as absent even
    /// when physical removal has not happened yet.
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Upsert an entry. Overwrites silently.
    async fn put(&self, entry: CacheEntry);

    /// Best-effort hit counter bump; lost updates under races are fine.
    async fn increment_hit_count(&self, key: &str);

    /// Entries for a tenant, most recent first.
    async fn list_by_tenant(&self, tenant: &str, limit: usize) -> Vec<CacheEntry>;

    /// Remove one entry by key.
    async fn invalidate(&self, key: &str);

    /// Remove all entries for a tenant, returning how many were dropped.
    async fn delete_by_tenant(&self, tenant: &str) -> usize;
}

/// In-process cache store. The underlying map is shared across request
/// workers; expiry is enforced on read rather than by a sweeper.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;

        // Double-check TTL; store-level sweeping is not instantaneous.
        if entry.is_expired(Utc::now().timestamp()) {
            info!("Cache entry expired for key: {}...", &key[..key.len().min(16)]);
            return None;
        }

        debug!("Cache hit for key: {}...", &key[..key.len().min(16)]);
        Some(entry.clone())
    }

    async fn put(&self, entry: CacheEntry) {
        let mut entries = self.entries.write().await;
        debug!(
            "Caching entry for key: {}... (expires_at: {})",
            &entry.cache_key[..entry.cache_key.len().min(16)],
            entry.expires_at
        );
        entries.insert(entry.cache_key.clone(), entry);
    }

    async fn increment_hit_count(&self, key: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.hit_count += 1;
        }
    }

    async fn list_by_tenant(&self, tenant: &str, limit: usize) -> Vec<CacheEntry> {
        let entries = self.entries.read().await;
        let now = Utc::now().timestamp();

        let mut matched: Vec<CacheEntry> = entries
            .values()
            .filter(|e| e.tenant == tenant && !e.is_expired(now))
            .cloned()
            .collect();

        // Most recent first
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(limit);
        matched
    }

    async fn invalidate(&self, key: &str) {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            info!("Deleted cache entry: {}...", &key[..key.len().min(16)]);
        }
    }

    async fn delete_by_tenant(&self, tenant: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.tenant != tenant);
        let deleted = before - entries.len();
        info!("Cleared {} cache entries for tenant {}", deleted, tenant);
        deleted
    }
}

/// Aggregate stats for a tenant from its most recent entries.
pub fn summarize(entries: &[CacheEntry]) -> CacheStats {
    let total_entries = entries.len();
    let total_hits: u64 = entries.iter().map(|e| e.hit_count).sum();

    let mut by_hits: Vec<&CacheEntry> = entries.iter().collect();
    by_hits.sort_by(|a, b| b.hit_count.cmp(&a.hit_count));

    CacheStats {
        total_cached_queries: total_entries,
        total_cache_hits: total_hits,
        most_popular_queries: by_hits
            .into_iter()
            .take(5)
            .map(|e| PopularQuery {
                question: e.question.clone(),
                hits: e.hit_count,
                created_at: e.created_at,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, tenant: &str, created_at: i64, expires_at: i64, hits: u64) -> CacheEntry {
        CacheEntry {
            cache_key: key.to_string(),
            tenant: tenant.to_string(),
            question: format!("question for {}", key),
            tables: vec!["sales".to_string()],
            sql: "SELECT * FROM sales".to_string(),
            explanation: "all sales rows".to_string(),
            schema_fingerprint: "fp".to_string(),
            created_at,
            expires_at,
            hit_count: hits,
        }
    }

    #[tokio::test]
    async fn get_returns_live_entry() {
        let cache = MemoryCache::new();
        let now = Utc::now().timestamp();
        cache.put(entry("k1", "t1", now, now + 60, 0)).await;

        let found = cache.get("k1").await;
        assert!(found.is_some());
        assert_eq!(found.map(|e| e.sql), Some("SELECT * FROM sales".to_string()));
    }

    #[tokio::test]
    async fn expired_entry_is_absent_even_if_stored() {
        let cache = MemoryCache::new();
        let now = Utc::now().timestamp();
        cache.put(entry("k1", "t1", now - 120, now - 60, 3)).await;

        assert!(cache.get("k1").await.is_none());
        // Still physically present; only the read path filters it.
        assert_eq!(cache.entries.read().await.len(), 1);
    }

    #[tokio::test]
    async fn put_overwrites_same_key() {
        let cache = MemoryCache::new();
        let now = Utc::now().timestamp();
        cache.put(entry("k1", "t1", now, now + 60, 0)).await;

        let mut newer = entry("k1", "t1", now, now + 60, 0);
        newer.sql = "SELECT id FROM sales".to_string();
        cache.put(newer).await;

        assert_eq!(
            cache.get("k1").await.map(|e| e.sql),
            Some("SELECT id FROM sales".to_string())
        );
        assert_eq!(cache.entries.read().await.len(), 1);
    }

    #[tokio::test]
    async fn hit_count_increments_and_missing_key_is_ignored() {
        let cache = MemoryCache::new();
        let now = Utc::now().timestamp();
        cache.put(entry("k1", "t1", now, now + 60, 0)).await;

        cache.increment_hit_count("k1").await;
        cache.increment_hit_count("k1").await;
        cache.increment_hit_count("nope").await;

        assert_eq!(cache.get("k1").await.map(|e| e.hit_count), Some(2));
    }

    #[tokio::test]
    async fn list_by_tenant_is_most_recent_first_and_scoped() {
        let cache = MemoryCache::new();
        let now = Utc::now().timestamp();
        cache.put(entry("old", "t1", now - 100, now + 600, 1)).await;
        cache.put(entry("new", "t1", now, now + 600, 2)).await;
        cache.put(entry("other", "t2", now, now + 600, 9)).await;

        let listed = cache.list_by_tenant("t1", 10).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].cache_key, "new");
        assert_eq!(listed[1].cache_key, "old");
    }

    #[tokio::test]
    async fn invalidate_removes_a_single_key() {
        let cache = MemoryCache::new();
        let now = Utc::now().timestamp();
        cache.put(entry("a", "t1", now, now + 600, 0)).await;
        cache.put(entry("b", "t1", now, now + 600, 0)).await;

        cache.invalidate("a").await;
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());
        // Invalidating an absent key is a no-op
        cache.invalidate("a").await;
    }

    #[tokio::test]
    async fn delete_by_tenant_reports_count() {
        let cache = MemoryCache::new();
        let now = Utc::now().timestamp();
        cache.put(entry("a", "t1", now, now + 600, 0)).await;
        cache.put(entry("b", "t1", now, now + 600, 0)).await;
        cache.put(entry("c", "t2", now, now + 600, 0)).await;

        assert_eq!(cache.delete_by_tenant("t1").await, 2);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("c").await.is_some());
    }

    #[test]
    fn entry_layout_is_part_of_the_contract() {
        let now = 1_700_000_000;
        let value = serde_json::to_value(entry("k1", "t1", now, now + 60, 2))
            .expect("serializable");
        let object = value.as_object().expect("object");

        for field in [
            "cache_key",
            "tenant",
            "question",
            "tables",
            "sql",
            "explanation",
            "schema_fingerprint",
            "created_at",
            "expires_at",
            "hit_count",
        ] {
            assert!(object.contains_key(field), "missing field {}", field);
        }
        assert_eq!(object.len(), 10);
        assert_eq!(CACHE_TTL_SECONDS, 604_800);
    }

    #[test]
    fn summarize_takes_top_five_by_hits() {
        let now = Utc::now().timestamp();
        let entries: Vec<CacheEntry> = (0..7)
            .map(|i| entry(&format!("k{}", i), "t1", now, now + 600, i as u64))
            .collect();

        let stats = summarize(&entries);
        assert_eq!(stats.total_cached_queries, 7);
        assert_eq!(stats.total_cache_hits, 21);
        assert_eq!(stats.most_popular_queries.len(), 5);
        assert_eq!(stats.most_popular_queries[0].hits, 6);
        assert_eq!(stats.most_popular_queries[4].hits, 2);
    }
}
