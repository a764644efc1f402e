use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
}

/// In-memory map of live gateway connections. One connection per user: a
/// second connect for the same user displaces the first. Also tracks which
/// conversation rooms a user joined and which conversation they are
/// actively viewing, both of which feed delivery decisions.
#[derive(Default)]
pub struct ConnectionRegistry {
    /// user id -> live connection
    sessions: DashMap<i64, ConnectionHandle>,
    /// connection id -> user id (reverse lookup for cleanup)
    connections: DashMap<Uuid, i64>,
    /// user id -> conversation currently in the foreground, if any
    active: DashMap<i64, i64>,
    /// conversation id -> users joined to its room
    rooms: DashMap<i64, HashSet<i64>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user. Returns the connection it
    /// displaced, if the user was already connected.
    pub fn register(&self, user_id: i64, connection_id: Uuid) -> Option<ConnectionHandle> {
        self.connections.insert(connection_id, user_id);
        self.sessions.insert(
            user_id,
            ConnectionHandle {
                connection_id,
                connected_at: Utc::now(),
            },
        )
    }

    /// Remove a connection. Returns the user id only when this connection
    /// was still the user's live one; a displaced connection cleaning up
    /// after itself gets None and must not emit offline side effects.
    /// Safe to call more than once for the same connection.
    pub fn unregister(&self, connection_id: Uuid) -> Option<i64> {
        let (_, user_id) = self.connections.remove(&connection_id)?;
        let is_live = self
            .sessions
            .get(&user_id)
            .map(|h| h.connection_id == connection_id)
            .unwrap_or(false);
        if !is_live {
            return None;
        }
        self.sessions.remove(&user_id);
        self.active.remove(&user_id);
        for mut room in self.rooms.iter_mut() {
            room.value_mut().remove(&user_id);
        }
        Some(user_id)
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.sessions.contains_key(&user_id)
    }

    pub fn online_user_ids(&self) -> Vec<i64> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    pub fn join_room(&self, user_id: i64, conversation_id: i64) {
        self.rooms
            .entry(conversation_id)
            .or_default()
            .insert(user_id);
    }

    pub fn leave_room(&self, user_id: i64, conversation_id: i64) {
        if let Some(mut room) = self.rooms.get_mut(&conversation_id) {
            room.remove(&user_id);
        }
    }

    pub fn room_members(&self, conversation_id: i64) -> Vec<i64> {
        self.rooms
            .get(&conversation_id)
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Record which conversation the user has in the foreground. `None`
    /// clears it (user navigated away or blurred the window).
    pub fn set_active_conversation(&self, user_id: i64, conversation_id: Option<i64>) {
        match conversation_id {
            Some(id) => {
                self.active.insert(user_id, id);
            }
            None => {
                self.active.remove(&user_id);
            }
        }
    }

    pub fn active_conversation(&self, user_id: i64) -> Option<i64> {
        self.active.get(&user_id).map(|e| *e.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_displaces_previous_connection() {
        let registry = ConnectionRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(registry.register(7, first).is_none());
        let displaced = registry.register(7, second).expect("displaced");
        assert_eq!(displaced.connection_id, first);

        // The displaced connection's cleanup must not mark the user offline.
        assert!(registry.unregister(first).is_none());
        assert!(registry.is_online(7));

        assert_eq!(registry.unregister(second), Some(7));
        assert!(!registry.is_online(7));
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();
        registry.register(3, conn);
        assert_eq!(registry.unregister(conn), Some(3));
        assert_eq!(registry.unregister(conn), None);
    }

    #[test]
    fn unregister_clears_rooms_and_active_view() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();
        registry.register(5, conn);
        registry.join_room(5, 100);
        registry.set_active_conversation(5, Some(100));

        registry.unregister(conn);
        assert!(registry.room_members(100).is_empty());
        assert_eq!(registry.active_conversation(5), None);
    }

    #[test]
    fn active_conversation_can_be_cleared() {
        let registry = ConnectionRegistry::new();
        registry.register(9, Uuid::new_v4());
        registry.set_active_conversation(9, Some(42));
        assert_eq!(registry.active_conversation(9), Some(42));
        registry.set_active_conversation(9, None);
        assert_eq!(registry.active_conversation(9), None);
    }
}
