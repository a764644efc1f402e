use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate delivery state of a message across all recipients.
/// Monotonic: the stored value only ever moves toward `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn from_i16(raw: i16) -> Self {
        match raw {
            2 => Self::Read,
            1 => Self::Delivered,
            _ => Self::Sent,
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Read => 2,
        }
    }
}

/// A (user, timestamp) entry in a message's delivered-to or read-by set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub user_id: i64,
    pub at: DateTime<Utc>,
}
