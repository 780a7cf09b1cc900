//! API request and response types

use crate::runtime::ProcessorStatus;
use crate::transcript::{Attachment, Message};
use crate::transport::ConnectionState;
use serde::{Deserialize, Serialize};

/// Request to submit a message
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub content: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

/// Response for a submission
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub queued: bool,
}

/// Transcript and processor status of one conversation
#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub status: ProcessorStatus,
}

/// Response listing known conversations
#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<String>,
}

/// Current backend connection, for UI indicators
#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub backend: String,
    pub state: ConnectionState,
}

/// Generic success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
