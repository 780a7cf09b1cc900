//! Processor state types

use serde::{Deserialize, Serialize};

/// Per-conversation processor state.
///
/// `Idle` is the only state that accepts a new submission. The three busy
/// phases each carry the id of the single in-flight assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorState {
    /// Ready for the next queued submission
    #[default]
    Idle,

    /// Submission dispatched, placeholder created, no chunk yet
    AwaitingFirstChunk { message_id: String },

    /// Chunks are being appended to the placeholder
    Streaming { message_id: String, chunks: usize },

    /// Seal issued, waiting for the store to confirm
    Sealing { message_id: String },
}

impl ProcessorState {
    pub fn is_busy(&self) -> bool {
        !matches!(self, ProcessorState::Idle)
    }

    /// The in-flight assistant message, if any
    pub fn in_flight(&self) -> Option<&str> {
        match self {
            ProcessorState::Idle => None,
            ProcessorState::AwaitingFirstChunk { message_id }
            | ProcessorState::Streaming { message_id, .. }
            | ProcessorState::Sealing { message_id } => Some(message_id),
        }
    }

    /// Short name used in logs and status payloads
    pub fn name(&self) -> &'static str {
        match self {
            ProcessorState::Idle => "idle",
            ProcessorState::AwaitingFirstChunk { .. } => "awaiting_first_chunk",
            ProcessorState::Streaming { .. } => "streaming",
            ProcessorState::Sealing { .. } => "sealing",
        }
    }
}
