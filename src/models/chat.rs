use chrono::Utc;
use serde::{ Serialize, Deserialize };
use std::fmt;
use std::sync::atomic::{ AtomicU64, Ordering };

static NEXT_TURN_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a conversation turn. Ids are handed out from a process-wide
/// counter, so comparing two ids tells which turn was created first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(u64);

impl TurnId {
    pub fn next() -> Self {
        Self(NEXT_TURN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: TurnId,
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: TurnId::next(),
            role,
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn model() -> Self {
        Self::new(Role::Model, String::new())
    }
}
