//! Core domain types for parley
//!
//! These are the plain records that cross the repository boundary. Nothing
//! here knows about SQLite; list-valued columns are already decoded.
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One conversation, with a running token total |
//! | **Message** | One turn in a session, authored by a [`Role`] |
//! | **Summary** | A message that replaces a run of older messages |
//! | **Tombstone** | `is_deleted = true`; hidden from replay but kept on disk |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Session
// ============================================

/// A conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Caller-supplied unique identifier
    pub id: String,
    /// Display title
    pub name: String,
    /// Running sum of token deltas
    pub total_tokens: i64,
    /// Assigned by the database on insert
    pub created_at: DateTime<Utc>,
    /// Refreshed by the database on every mutation
    pub updated_at: DateTime<Utc>,
}

/// Partial update for a session. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub name: Option<String>,
    pub total_tokens: Option<i64>,
}

impl SessionUpdate {
    /// Update only the name.
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.total_tokens.is_none()
    }
}

// ============================================
// Message
// ============================================

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Returns the identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    /// Attachment paths in the order they were sent
    pub file_paths: Option<Vec<String>>,
    pub token_count: i64,
    /// This message stands in for older, compacted messages
    pub is_summary: bool,
    /// Messages a summary replaces; only meaningful when `is_summary`
    pub original_message_ids: Option<Vec<String>>,
    /// Logical tombstone
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Parameters for inserting a message.
///
/// `token_count` defaults to 0 and `is_summary` to false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub file_paths: Option<Vec<String>>,
    pub token_count: Option<i64>,
    pub is_summary: Option<bool>,
    pub original_message_ids: Option<Vec<String>>,
}

impl NewMessage {
    /// A plain message with no attachments.
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            file_paths: None,
            token_count: None,
            is_summary: None,
            original_message_ids: None,
        }
    }

    pub fn with_file_paths(mut self, paths: Vec<String>) -> Self {
        self.file_paths = Some(paths);
        self
    }

    pub fn with_token_count(mut self, tokens: i64) -> Self {
        self.token_count = Some(tokens);
        self
    }

    /// Mark as a summary replacing `originals`.
    pub fn summarizing(mut self, originals: Vec<String>) -> Self {
        self.is_summary = Some(true);
        self.original_message_ids = Some(originals);
        self
    }
}

/// Equality filters for [`crate::db::MessageRepository::search`].
///
/// Unset fields impose no constraint. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub session_id: Option<String>,
    pub role: Option<Role>,
    pub is_summary: Option<bool>,
    pub is_deleted: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl MessageFilter {
    /// Filter to one session.
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }
}
