//! Pure state transition function
//!
//! idle -> awaiting_first_chunk -> streaming -> sealing -> idle
//!
//! Stream events that do not address the in-flight message are dropped as
//! no-op transitions: they belong to a message that was already sealed or
//! cleared, and must not disturb the current one.

use super::{Effect, Event, ProcessorState};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ProcessorState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ProcessorState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Processor is busy with message {0}")]
    ProcessorBusy(String),
}

/// Pure transition function: same inputs, same outputs, no I/O.
pub fn transition(
    state: &ProcessorState,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // Dequeue
        // ============================================================

        // Idle + Begin -> AwaitingFirstChunk. The user message lands in the
        // transcript before anything is sent.
        (
            ProcessorState::Idle,
            Event::Begin {
                item,
                user_message_id,
                assistant_message_id,
            },
        ) => Ok(TransitionResult::new(ProcessorState::AwaitingFirstChunk {
            message_id: assistant_message_id.clone(),
        })
        .with_effect(Effect::AppendUserMessage {
            message_id: user_message_id,
            content: item.content.clone(),
            attachment: item.attachment.clone(),
        })
        .with_effect(Effect::CreatePlaceholder {
            message_id: assistant_message_id.clone(),
        })
        .with_effect(Effect::NotifyStatus)
        .with_effect(Effect::Dispatch {
            item,
            message_id: assistant_message_id,
        })),

        // Busy + Begin -> reject; the caller keeps the item
        (busy, Event::Begin { .. }) => Err(TransitionError::ProcessorBusy(
            busy.in_flight().unwrap_or_default().to_string(),
        )),

        // ============================================================
        // Streaming
        // ============================================================
        (
            ProcessorState::AwaitingFirstChunk { message_id },
            Event::Chunk {
                message_id: target,
                delta,
            },
        ) if *message_id == target =>
        {
            Ok(TransitionResult::new(ProcessorState::Streaming {
                message_id: target.clone(),
                chunks: 1,
            })
            .with_effect(Effect::AppendChunk {
                message_id: target,
                delta,
            })
            .with_effect(Effect::NotifyStatus))
        }

        (
            ProcessorState::Streaming { message_id, chunks },
            Event::Chunk {
                message_id: target,
                delta,
            },
        ) if *message_id == target => Ok(TransitionResult::new(ProcessorState::Streaming {
            message_id: target.clone(),
            chunks: chunks + 1,
        })
        .with_effect(Effect::AppendChunk {
            message_id: target,
            delta,
        })),

        // ============================================================
        // Sealing
        // ============================================================
        (
            ProcessorState::AwaitingFirstChunk { message_id }
            | ProcessorState::Streaming { message_id, .. },
            Event::Done { message_id: target },
        ) if *message_id == target => Ok(TransitionResult::new(ProcessorState::Sealing {
            message_id: target.clone(),
        })
        .with_effect(Effect::seal(target))),

        (
            ProcessorState::AwaitingFirstChunk { message_id }
            | ProcessorState::Streaming { message_id, .. },
            Event::Failed {
                message_id: target,
                error,
            },
        ) if *message_id == target => Ok(TransitionResult::new(ProcessorState::Sealing {
            message_id: target.clone(),
        })
        .with_effect(Effect::seal_with_error(target, error.message))),

        // Sealing + Sealed -> Idle, then immediately look at the queue
        (ProcessorState::Sealing { message_id }, Event::Sealed { message_id: target })
            if *message_id == target =>
        {
            Ok(TransitionResult::new(ProcessorState::Idle)
                .with_effect(Effect::NotifyStatus)
                .with_effect(Effect::ProcessNext))
        }

        // ============================================================
        // Reset
        // ============================================================
        (ProcessorState::Idle, Event::Reset) => Ok(TransitionResult::new(ProcessorState::Idle)),
        (_, Event::Reset) => {
            Ok(TransitionResult::new(ProcessorState::Idle).with_effect(Effect::NotifyStatus))
        }

        // ============================================================
        // Stale stream events
        // ============================================================
        (
            state,
            Event::Chunk { .. } | Event::Done { .. } | Event::Failed { .. } | Event::Sealed { .. },
        ) => Ok(TransitionResult::new(state.clone())),
    }
}
