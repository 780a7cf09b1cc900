//! JSON frames exchanged with the streaming backend

use crate::transcript::Attachment;
use serde::{Deserialize, Serialize};

/// Frames sent to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Submit {
        conversation_id: String,
        /// Assistant message the response chunks must be addressed to
        message_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<Attachment>,
    },
}

/// Frames received from the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Chunk {
        conversation_id: String,
        message_id: String,
        chunk: String,
    },
    Done {
        conversation_id: String,
        message_id: String,
    },
    Error {
        conversation_id: String,
        message_id: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn message_id(&self) -> &str {
        match self {
            ServerFrame::Chunk { message_id, .. }
            | ServerFrame::Done { message_id, .. }
            | ServerFrame::Error { message_id, .. } => message_id,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            ServerFrame::Chunk {
                conversation_id, ..
            }
            | ServerFrame::Done {
                conversation_id, ..
            }
            | ServerFrame::Error {
                conversation_id, ..
            } => conversation_id,
        }
    }
}
