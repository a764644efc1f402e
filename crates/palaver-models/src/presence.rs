use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TTL-bound liveness marker stored in the cache backend.
/// Advisory only: consumers must tolerate brief false positives and
/// negatives inside the TTL window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub marked_at: DateTime<Utc>,
}
