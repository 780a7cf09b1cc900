//! Transcript types
//!
//! A transcript is the ordered message list of one conversation. Insertion
//! order is causal order: a user message always precedes its response.

mod store;

pub use store::{Subscription, TranscriptStore, TranscriptUpdate};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Descriptor of a file attached to a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size: u64,
    pub mime: String,
}

/// A transcript entry.
///
/// Content is mutable only while `streaming` is true. Once sealed a message
/// never changes again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Set when the message was sealed by a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// A sealed user message
    pub fn user(
        id: impl Into<String>,
        content: impl Into<String>,
        attachment: Option<Attachment>,
    ) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            streaming: false,
            attachment,
            error: None,
        }
    }

    /// An empty assistant message awaiting chunks
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            streaming: true,
            attachment: None,
            error: None,
        }
    }

    /// A sealed assistant message, used when seeding history
    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            streaming: false,
            attachment: None,
            error: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        !self.streaming
    }
}

/// Text appended to a message sealed by a failure
pub fn fallback_notice(error: &str) -> String {
    format!("[Response failed: {error}]")
}
