//! Local responder used when no live backend is configured

use super::{Backend, Submission};
use crate::assembler::{simulated_stream, ChunkStream, ChunkingPolicy};
use crate::error::BackendError;
use async_trait::async_trait;

/// Answers every submission with a short acknowledgement, streamed through
/// the simulated chunker
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    chunking: ChunkingPolicy,
}

impl SimulatedBackend {
    pub fn new(chunking: ChunkingPolicy) -> Self {
        Self { chunking }
    }
}

/// Reply text for a submission. Never empty.
pub(crate) fn compose_reply(submission: &Submission) -> String {
    let text = submission.content.trim();
    let mut reply = if text.is_empty() {
        "I received your message.".to_string()
    } else {
        format!("You said: \"{text}\". Here is my response.")
    };
    if let Some(attachment) = &submission.attachment {
        reply.push_str(&format!(
            " I also received {} ({} bytes, {}).",
            attachment.name, attachment.size, attachment.mime
        ));
    }
    reply
}

#[async_trait]
impl Backend for SimulatedBackend {
    async fn ready(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn submit(&self, submission: Submission) -> Result<ChunkStream, BackendError> {
        let reply = compose_reply(&submission);
        tracing::debug!(
            conv_id = %submission.conversation_id,
            message_id = %submission.message_id,
            len = reply.len(),
            "Simulating response"
        );
        Ok(simulated_stream(&reply, self.chunking))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
