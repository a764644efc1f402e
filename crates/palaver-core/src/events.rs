use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Conversation room this event belongs to, if applicable.
    pub conversation_id: Option<i64>,
    /// When set, only deliver this event to the specified user IDs.
    pub target_user_ids: Option<Vec<i64>>,
    /// Never deliver to this user (e.g. the typing user's own echo).
    pub exclude_user_id: Option<i64>,
}

/// Broadcast-based event bus for real-time dispatch. Each gateway session
/// subscribes and filters events against its own room/user scope.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ServerEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to every connected session.
    pub fn broadcast(&self, event_type: &str, payload: serde_json::Value) {
        self.publish(ServerEvent {
            event_type: event_type.to_string(),
            payload,
            conversation_id: None,
            target_user_ids: None,
            exclude_user_id: None,
        });
    }

    /// Publish a targeted event delivered only to the specified users.
    pub fn dispatch_to_users(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        target_user_ids: Vec<i64>,
    ) {
        self.publish(ServerEvent {
            event_type: event_type.to_string(),
            payload,
            conversation_id: None,
            target_user_ids: Some(target_user_ids),
            exclude_user_id: None,
        });
    }

    pub fn dispatch_to_user(&self, event_type: &str, payload: serde_json::Value, user_id: i64) {
        self.dispatch_to_users(event_type, payload, vec![user_id]);
    }

    /// Publish to everyone who joined the conversation's room.
    pub fn dispatch_to_room(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        conversation_id: i64,
        exclude_user_id: Option<i64>,
    ) {
        self.publish(ServerEvent {
            event_type: event_type.to_string(),
            payload,
            conversation_id: Some(conversation_id),
            target_user_ids: None,
            exclude_user_id,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
