//! Backend abstraction
//!
//! The processor only talks to a [`Backend`]: it waits for `ready`, calls
//! `submit`, and consumes the returned [`ChunkStream`]. Whether the chunks
//! come off a socket or are cut from a complete HTTP response is the
//! backend's business.

mod http;
mod simulated;
mod socket;

pub use http::HttpBackend;
pub use simulated::SimulatedBackend;
pub use socket::SocketBackend;

use crate::assembler::ChunkStream;
use crate::error::BackendError;
use crate::transcript::{Attachment, Message};
use crate::transport::ConnectionState;
use async_trait::async_trait;
use std::sync::Arc;

/// One dequeued item on its way to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub conversation_id: String,
    /// Assistant message the response will fill
    pub message_id: String,
    pub content: String,
    pub attachment: Option<Attachment>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Resolves once a submission could be sent. Errors mean it never will.
    async fn ready(&self) -> Result<(), BackendError>;

    /// Send one submission and return its response stream
    async fn submit(&self, submission: Submission) -> Result<ChunkStream, BackendError>;

    /// Earlier messages used to seed a conversation opened for the first time
    async fn history(&self, _conversation_id: &str) -> Result<Vec<Message>, BackendError> {
        Ok(Vec::new())
    }

    /// State of the underlying connection, for UI indicators
    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Open
    }

    fn name(&self) -> &str;
}

#[async_trait]
impl<T: Backend + ?Sized> Backend for Arc<T> {
    async fn ready(&self) -> Result<(), BackendError> {
        (**self).ready().await
    }

    async fn submit(&self, submission: Submission) -> Result<ChunkStream, BackendError> {
        (**self).submit(submission).await
    }

    async fn history(&self, conversation_id: &str) -> Result<Vec<Message>, BackendError> {
        (**self).history(conversation_id).await
    }

    fn connection_state(&self) -> ConnectionState {
        (**self).connection_state()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
