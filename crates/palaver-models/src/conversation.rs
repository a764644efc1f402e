use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
    Broadcast,
}

impl ConversationKind {
    pub fn from_i16(raw: i16) -> Option<Self> {
        match raw {
            0 => Some(Self::Direct),
            1 => Some(Self::Group),
            2 => Some(Self::Broadcast),
            _ => None,
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            Self::Direct => 0,
            Self::Group => 1,
            Self::Broadcast => 2,
        }
    }

    pub fn requires_admin(self) -> bool {
        matches!(self, Self::Group | Self::Broadcast)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Member,
    Moderator,
    Admin,
}

impl ParticipantRole {
    pub fn from_i16(raw: i16) -> Self {
        match raw {
            2 => Self::Admin,
            1 => Self::Moderator,
            _ => Self::Member,
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            Self::Member => 0,
            Self::Moderator => 1,
            Self::Admin => 2,
        }
    }
}

/// Participant as rendered in conversation snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantView {
    pub user_id: i64,
    pub role: ParticipantRole,
    pub co_admin: bool,
    pub is_hidden: bool,
    pub joined_at: DateTime<Utc>,
}

/// One row of a user's sidebar: a conversation with enough context to
/// render the list entry without further queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: i64,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub admin_id: Option<i64>,
    pub unread_count: i64,
    pub last_message: Option<MessagePreview>,
    /// Peer user ids currently online, per the advisory presence store.
    pub online_participant_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePreview {
    pub message_id: i64,
    pub sender_id: i64,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}
