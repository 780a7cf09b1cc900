//! Error types for the delivery engine
//!
//! Transport and backend failures never escape a conversation task: they are
//! either recovered by the reconnect loop or folded into a sealed assistant
//! message. Store errors are swallowed by the assembler.

use thiserror::Error;

/// Failures of the shared duplex connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is not open")]
    NotOpen,
    #[error("Transport has been shut down")]
    Closed,
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Backend error with classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transport, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Rejected, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Timeout, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Protocol, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Server, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unknown, message)
    }
}

impl From<TransportError> for BackendError {
    fn from(err: TransportError) -> Self {
        Self::transport(err.to_string())
    }
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Connection not open, dropped mid-stream, or send failed
    Transport,
    /// Backend refused this submission (4xx, explicit error frame)
    Rejected,
    /// No chunk, completion, or error within the bounded wait
    Timeout,
    /// Malformed frames or a stream that ended without completion
    Protocol,
    /// Backend-side failure (5xx)
    Server,
    Unknown,
}

impl BackendErrorKind {
    /// Whether the same submission could succeed if sent again later
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Transport | Self::Timeout | Self::Server)
    }
}

/// Transcript store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),
    #[error("Unknown message {message_id} in conversation {conversation_id}")]
    UnknownMessage {
        conversation_id: String,
        message_id: String,
    },
    #[error("Message {0} is sealed")]
    Sealed(String),
    #[error("Conversation {0} already has a streaming message")]
    StreamingInProgress(String),
}
