use crate::cache::CacheStore;
use chrono::Utc;
use palaver_models::presence::PresenceRecord;
use std::time::Duration;

fn presence_key(user_id: i64) -> String {
    format!("presence:{user_id}")
}

/// TTL-bound presence facts. A record existing means "this user looked
/// online within the last TTL window"; absence means offline. Presence is
/// advisory throughout the engine: it shapes delivery timing and sidebar
/// decoration but never authorization.
#[derive(Clone)]
pub struct PresenceStore {
    cache: CacheStore,
    ttl: Duration,
}

impl PresenceStore {
    pub fn new(cache: CacheStore, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub async fn mark_online(&self, user_id: i64, device: Option<String>) {
        let record = PresenceRecord {
            user_id,
            device,
            marked_at: Utc::now(),
        };
        if let Ok(value) = serde_json::to_value(&record) {
            self.cache
                .set_with_ttl(&presence_key(user_id), value, self.ttl)
                .await;
        }
    }

    pub async fn mark_offline(&self, user_id: i64) {
        self.cache.delete(&presence_key(user_id)).await;
    }

    /// Re-arm the TTL for a user who just showed activity (heartbeat).
    /// An expired record is recreated, so a connected user never stays
    /// offline longer than one heartbeat interval.
    pub async fn refresh(&self, user_id: i64) {
        match self.cache.get(&presence_key(user_id)).await {
            Some(mut value) => {
                if let Some(marked_at) = value.get_mut("marked_at") {
                    *marked_at = serde_json::json!(Utc::now());
                }
                self.cache
                    .set_with_ttl(&presence_key(user_id), value, self.ttl)
                    .await;
            }
            None => self.mark_online(user_id, None).await,
        }
    }

    pub async fn is_online(&self, user_id: i64) -> bool {
        self.cache.get(&presence_key(user_id)).await.is_some()
    }

    pub async fn all_online_ids(&self) -> Vec<i64> {
        self.cache
            .keys_with_prefix("presence:")
            .await
            .into_iter()
            .filter_map(|key| key.strip_prefix("presence:")?.parse().ok())
            .collect()
    }

    /// Drop records whose timestamp has fallen outside the TTL window.
    /// The cache expires entries on its own; the sweep catches records
    /// that survived a TTL misconfiguration or clock jump. Returns the
    /// number of records removed.
    pub async fn sweep(&self) -> usize {
        let mut removed = 0;
        for key in self.cache.keys_with_prefix("presence:").await {
            let Some(value) = self.cache.get(&key).await else {
                continue;
            };
            let stale = serde_json::from_value::<PresenceRecord>(value)
                .map(|record| {
                    Utc::now().signed_duration_since(record.marked_at).num_milliseconds()
                        > self.ttl.as_millis() as i64
                })
                .unwrap_or(true);
            if stale {
                self.cache.delete(&key).await;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "presence sweep removed stale records");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl: Duration) -> PresenceStore {
        PresenceStore::new(CacheStore::new(64), ttl)
    }

    #[tokio::test]
    async fn mark_online_then_offline() {
        let presence = store(Duration::from_secs(60));
        presence.mark_online(1, Some("web".into())).await;
        assert!(presence.is_online(1).await);
        presence.mark_offline(1).await;
        assert!(!presence.is_online(1).await);
    }

    #[tokio::test]
    async fn records_expire_after_ttl() {
        let presence = store(Duration::from_millis(20));
        presence.mark_online(2, None).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!presence.is_online(2).await);
    }

    #[tokio::test]
    async fn refresh_recreates_an_expired_record() {
        // One missed heartbeat can let the record lapse; the next
        // heartbeat must bring the still-connected user back online.
        let presence = store(Duration::from_millis(20));
        presence.mark_online(4, None).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!presence.is_online(4).await);

        presence.refresh(4).await;
        assert!(presence.is_online(4).await);
    }

    #[tokio::test]
    async fn refresh_restamps_the_record_for_the_sweep() {
        let presence = store(Duration::from_millis(50));
        presence.mark_online(5, None).await;

        // Heartbeat arrives mid-window; the sweep must not treat the
        // record as stale based on its original timestamp.
        tokio::time::sleep(Duration::from_millis(30)).await;
        presence.refresh(5).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(presence.sweep().await, 0);
        assert!(presence.is_online(5).await);
    }

    #[tokio::test]
    async fn all_online_ids_lists_marked_users() {
        let presence = store(Duration::from_secs(60));
        presence.mark_online(1, None).await;
        presence.mark_online(2, None).await;
        let mut ids = presence.all_online_ids().await;
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn sweep_removes_stale_records() {
        // Write with a generous cache TTL but sweep against a tiny logical
        // TTL, simulating a record that outlived its intended window.
        let cache = CacheStore::new(64);
        let writer = PresenceStore::new(cache.clone(), Duration::from_secs(60));
        writer.mark_online(3, None).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let sweeper = PresenceStore::new(cache, Duration::from_millis(10));
        assert_eq!(sweeper.sweep().await, 1);
        assert!(!sweeper.is_online(3).await);
    }
}
