pub mod auth;
pub mod cache;
pub mod conversation;
pub mod delivery;
pub mod error;
pub mod events;
pub mod message;
pub mod pending;
pub mod presence;
pub mod registry;
pub mod sidebar;
pub mod succession;
pub mod visibility;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use palaver_db::DbPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Coalesces explicit mark-conversation-read triggers: repeated calls from
/// the same (user, conversation) pair inside the window are no-ops, so
/// bursty UI events don't trigger redundant recomputation storms.
pub struct MarkReadCoalescer {
    limiter: DefaultKeyedRateLimiter<(i64, i64)>,
}

impl MarkReadCoalescer {
    pub fn new(window: Duration) -> Self {
        let window = window.max(Duration::from_millis(1));
        Self {
            limiter: RateLimiter::keyed(Quota::with_period(window).expect("nonzero window")),
        }
    }

    /// True when the trigger should run; false when it falls inside the
    /// coalescing window of an earlier trigger.
    pub fn allow(&self, user_id: i64, conversation_id: i64) -> bool {
        self.limiter.check_key(&(user_id, conversation_id)).is_ok()
    }

    /// Drop stale per-key state so the map doesn't grow without bound.
    pub fn prune(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub jwt_expiry_seconds: u64,
    /// Worker id baked into generated snowflakes.
    pub worker_id: u16,
    /// Caches are pure accelerators; with this off the whole engine runs
    /// against the database only.
    pub cache_enabled: bool,
    pub cache_max_entries: u64,
    pub presence_ttl_secs: u64,
    pub presence_sweep_interval_secs: u64,
    pub sidebar_ttl_secs: u64,
    pub unread_ttl_secs: u64,
    pub pending_queue_capacity: usize,
    pub mark_read_window_secs: u64,
    pub max_messages_per_minute: u32,
    pub max_typing_events_per_minute: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "palaver-dev-secret".to_string(),
            jwt_expiry_seconds: 3600,
            worker_id: 1,
            cache_enabled: true,
            cache_max_entries: 20_000,
            presence_ttl_secs: 60,
            presence_sweep_interval_secs: 30,
            sidebar_ttl_secs: 300,
            unread_ttl_secs: 300,
            pending_queue_capacity: 10,
            mark_read_window_secs: 2,
            max_messages_per_minute: 240,
            max_typing_events_per_minute: 120,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub event_bus: events::EventBus,
    pub config: AppConfig,
    /// Authoritative map of live connections, rooms and active views.
    pub registry: Arc<registry::ConnectionRegistry>,
    /// Best-effort TTL key/value store backing presence and sidebar caches.
    pub cache: cache::CacheStore,
    /// TTL-bound "who is online" facts, advisory only.
    pub presence: presence::PresenceStore,
    /// Bounded per-user queues of reappearance events for offline targets.
    pub pending: Arc<pending::PendingNotifications>,
    pub read_coalescer: Arc<MarkReadCoalescer>,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig) -> Self {
        let cache = if config.cache_enabled {
            cache::CacheStore::new(config.cache_max_entries)
        } else {
            cache::CacheStore::disabled()
        };
        let presence = presence::PresenceStore::new(
            cache.clone(),
            Duration::from_secs(config.presence_ttl_secs),
        );
        let pending = Arc::new(pending::PendingNotifications::new(
            config.pending_queue_capacity,
        ));
        let read_coalescer = Arc::new(MarkReadCoalescer::new(Duration::from_secs(
            config.mark_read_window_secs.max(1),
        )));

        Self {
            db,
            event_bus: events::EventBus::default(),
            config,
            registry: Arc::new(registry::ConnectionRegistry::new()),
            cache,
            presence,
            pending,
            read_coalescer,
            shutdown: Arc::new(Notify::new()),
        }
    }
}
