//! Effects produced by state transitions

use crate::queue::OutgoingItem;
use crate::transcript::Attachment;

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Append the submission to the transcript as a sealed user message
    AppendUserMessage {
        message_id: String,
        content: String,
        attachment: Option<Attachment>,
    },

    /// Append an empty streaming assistant message
    CreatePlaceholder { message_id: String },

    /// Submit the item to the backend (spawns the stream pump)
    Dispatch {
        item: OutgoingItem,
        message_id: String,
    },

    /// Append a chunk to the in-flight message
    AppendChunk { message_id: String, delta: String },

    /// Freeze the in-flight message, optionally with a failure notice
    Seal {
        message_id: String,
        error: Option<String>,
    },

    /// Re-check the queue and begin the next item if one is waiting
    ProcessNext,

    /// Publish processor status to observers
    NotifyStatus,
}

impl Effect {
    pub fn seal(message_id: impl Into<String>) -> Self {
        Effect::Seal {
            message_id: message_id.into(),
            error: None,
        }
    }

    pub fn seal_with_error(message_id: impl Into<String>, error: impl Into<String>) -> Self {
        Effect::Seal {
            message_id: message_id.into(),
            error: Some(error.into()),
        }
    }
}
