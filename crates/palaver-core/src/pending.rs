use dashmap::DashMap;
use std::collections::VecDeque;

/// Queued event waiting for a user's next connection.
#[derive(Clone, Debug)]
pub struct QueuedEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Per-user queues of notifications that could not be delivered live,
/// chiefly conversation reappearances for offline users. Each queue is
/// bounded; when full the oldest entry is dropped, since the sidebar
/// snapshot sent at connect time covers anything lost.
pub struct PendingNotifications {
    queues: DashMap<i64, VecDeque<QueuedEvent>>,
    capacity: usize,
}

impl PendingNotifications {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, user_id: i64, event_type: &str, payload: serde_json::Value) {
        let mut queue = self.queues.entry(user_id).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(QueuedEvent {
            event_type: event_type.to_string(),
            payload,
        });
    }

    /// Take everything queued for a user, oldest first.
    pub fn drain(&self, user_id: i64) -> Vec<QueuedEvent> {
        self.queues
            .remove(&user_id)
            .map(|(_, queue)| queue.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn queued_count(&self, user_id: i64) -> usize {
        self.queues.get(&user_id).map(|q| q.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drain_returns_in_order_and_empties() {
        let pending = PendingNotifications::new(10);
        pending.push(1, "a", json!(1));
        pending.push(1, "b", json!(2));
        let events = pending.drain(1);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "a");
        assert_eq!(events[1].event_type, "b");
        assert!(pending.drain(1).is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let pending = PendingNotifications::new(3);
        for i in 0..5 {
            pending.push(1, "evt", json!(i));
        }
        let events = pending.drain(1);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].payload, json!(2));
        assert_eq!(events[2].payload, json!(4));
    }
}
