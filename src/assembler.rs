//! Streaming response assembly
//!
//! Backends deliver a response as a stream of [`StreamEvent`]s. Backends that
//! stream natively forward their chunks as they arrive; backends that return
//! a whole response at once are rendered through [`simulated_stream`], which
//! splits the text into small randomized pieces with a delay between them.
//!
//! The [`Assembler`] is the single writer of assistant message content.

use crate::error::BackendError;
use crate::transcript::TranscriptStore;
use futures::stream::{self, BoxStream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

/// One step of a backend response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    Done,
}

/// Response stream handed back by a backend after a successful submit
pub type ChunkStream = BoxStream<'static, Result<StreamEvent, BackendError>>;

/// How whole responses are split up when simulating a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingPolicy {
    /// Fewest characters per chunk
    pub min_chars: usize,
    /// Most characters per chunk
    pub max_chars: usize,
    /// Pause before each chunk
    pub delay: Duration,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self {
            min_chars: 2,
            max_chars: 4,
            delay: Duration::from_millis(30),
        }
    }
}

impl ChunkingPolicy {
    /// Clamp to a usable range: at least one character, `min <= max`
    pub fn normalized(self) -> Self {
        let min_chars = self.min_chars.max(1);
        Self {
            min_chars,
            max_chars: self.max_chars.max(min_chars),
            delay: self.delay,
        }
    }
}

/// Lazy `(delay, chunk)` sequence for one response text. Chunk sizes are
/// drawn from the policy range.
///
/// Works on characters, never on byte offsets, so multi-byte text is never
/// cut mid-character.
pub struct ChunkPlan<R> {
    chars: Vec<char>,
    pos: usize,
    policy: ChunkingPolicy,
    rng: R,
}

impl<R: Rng> ChunkPlan<R> {
    pub fn new(text: &str, policy: ChunkingPolicy, rng: R) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            policy: policy.normalized(),
            rng,
        }
    }
}

impl<R: Rng> Iterator for ChunkPlan<R> {
    type Item = (Duration, String);

    fn next(&mut self) -> Option<(Duration, String)> {
        let remaining = self.chars.len() - self.pos;
        if remaining == 0 {
            return None;
        }
        let size = self
            .rng
            .gen_range(self.policy.min_chars..=self.policy.max_chars)
            .min(remaining);
        let chunk: String = self.chars[self.pos..self.pos + size].iter().collect();
        self.pos += size;
        Some((self.policy.delay, chunk))
    }
}

/// Render a complete response as a paced chunk stream ending in `Done`
pub fn simulated_stream(text: &str, policy: ChunkingPolicy) -> ChunkStream {
    let plan = ChunkPlan::new(text, policy, StdRng::from_entropy());

    let chunks = stream::iter(plan).then(|(delay, chunk)| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, BackendError>(StreamEvent::Chunk(chunk))
    });
    chunks
        .chain(stream::once(async { Ok(StreamEvent::Done) }))
        .boxed()
}

/// Writes chunks and seals into the transcript store.
///
/// Store errors (unknown conversation after a clear, message already sealed)
/// mean the target is gone; they are logged and dropped.
#[derive(Clone)]
pub struct Assembler {
    store: Arc<TranscriptStore>,
}

impl Assembler {
    pub fn new(store: Arc<TranscriptStore>) -> Self {
        Self { store }
    }

    /// Append a delta to the streaming message. Returns whether it applied.
    pub fn append(&self, conversation_id: &str, message_id: &str, delta: &str) -> bool {
        match self
            .store
            .update_streaming_message(conversation_id, message_id, delta)
        {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    conv_id = %conversation_id,
                    message_id = %message_id,
                    error = %e,
                    "Dropping chunk"
                );
                false
            }
        }
    }

    /// Seal the message, with a fallback notice when `error` is set.
    /// Returns whether this call sealed it.
    pub fn seal(&self, conversation_id: &str, message_id: &str, error: Option<&str>) -> bool {
        match self.store.seal(conversation_id, message_id, error) {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::debug!(
                    conv_id = %conversation_id,
                    message_id = %message_id,
                    error = %e,
                    "Dropping seal"
                );
                false
            }
        }
    }
}
