use palaver_core::events::ServerEvent;
use std::collections::HashSet;
use uuid::Uuid;

pub struct Session {
    pub user_id: i64,
    pub connection_id: Uuid,
    pub session_id: String,
    /// Conversation rooms this session joined for room-scoped events.
    pub joined_conversations: HashSet<i64>,
    pub sequence: u64,
}

impl Session {
    pub fn new(user_id: i64, connection_id: Uuid) -> Self {
        Self {
            user_id,
            connection_id,
            session_id: Uuid::new_v4().to_string(),
            joined_conversations: HashSet::new(),
            sequence: 0,
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub fn should_receive_event(&self, event: &ServerEvent) -> bool {
        if event.exclude_user_id == Some(self.user_id) {
            return false;
        }
        // Events targeting specific users are delivered to them only.
        if let Some(targets) = &event.target_user_ids {
            return targets.contains(&self.user_id);
        }
        match event.conversation_id {
            None => true,
            Some(cid) => self.joined_conversations.contains(&cid),
        }
    }
}
