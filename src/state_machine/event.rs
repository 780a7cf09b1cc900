//! Events that drive the processor

use crate::error::BackendError;
use crate::queue::OutgoingItem;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    /// Head of the queue handed to the processor. Ids are minted by the
    /// runtime so the transition stays pure.
    Begin {
        item: OutgoingItem,
        user_message_id: String,
        assistant_message_id: String,
    },

    // Backend stream events, addressed to one assistant message
    Chunk {
        message_id: String,
        delta: String,
    },
    Done {
        message_id: String,
    },
    /// Dispatch failure, mid-stream error, or timeout
    Failed {
        message_id: String,
        error: BackendError,
    },

    /// The store confirmed the seal
    Sealed {
        message_id: String,
    },

    /// Conversation cleared; the in-flight message (if any) is abandoned
    Reset,
}

impl Event {
    /// Target message of a stream event
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Event::Chunk { message_id, .. }
            | Event::Done { message_id }
            | Event::Failed { message_id, .. }
            | Event::Sealed { message_id } => Some(message_id),
            Event::Begin {
                assistant_message_id,
                ..
            } => Some(assistant_message_id),
            Event::Reset => None,
        }
    }
}
