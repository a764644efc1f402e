use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct CachedValue {
    value: serde_json::Value,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Process-local TTL cache for presence records, sidebar snapshots and
/// unread counters. Strictly an accelerator: every read path has a
/// database fallback, and a disabled store turns all operations into
/// no-ops without changing observable behavior.
#[derive(Clone)]
pub struct CacheStore {
    inner: Option<Cache<String, CachedValue>>,
}

impl CacheStore {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { inner: Some(cache) }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let cache = self.inner.as_ref()?;
        cache.get(key).await.map(|entry| entry.value)
    }

    pub async fn set_with_ttl(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        if let Some(cache) = &self.inner {
            cache
                .insert(key.to_string(), CachedValue { value, ttl })
                .await;
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Some(cache) = &self.inner {
            cache.invalidate(key).await;
        }
    }

    /// Snapshot of all live keys starting with `prefix`. Used by the
    /// presence store to enumerate online users.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let Some(cache) = &self.inner else {
            return Vec::new();
        };
        cache.run_pending_tasks().await;
        cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.as_ref().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let cache = CacheStore::new(64);
        cache
            .set_with_ttl("k", json!({"a": 1}), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("k").await, Some(json!({"a": 1})));
        cache.delete("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn entries_expire_per_entry() {
        let cache = CacheStore::new(64);
        cache
            .set_with_ttl("short", json!(1), Duration::from_millis(20))
            .await;
        cache
            .set_with_ttl("long", json!(2), Duration::from_secs(60))
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("short").await, None);
        assert_eq!(cache.get("long").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn disabled_store_is_a_no_op() {
        let cache = CacheStore::disabled();
        cache
            .set_with_ttl("k", json!(1), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("k").await, None);
        assert!(cache.keys_with_prefix("k").await.is_empty());
    }

    #[tokio::test]
    async fn prefix_scan_only_matches_prefix() {
        let cache = CacheStore::new(64);
        cache
            .set_with_ttl("presence:1", json!(true), Duration::from_secs(60))
            .await;
        cache
            .set_with_ttl("presence:2", json!(true), Duration::from_secs(60))
            .await;
        cache
            .set_with_ttl("sidebar:1", json!([]), Duration::from_secs(60))
            .await;
        let mut keys = cache.keys_with_prefix("presence:").await;
        keys.sort();
        assert_eq!(keys, vec!["presence:1", "presence:2"]);
    }
}
