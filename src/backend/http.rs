//! Request/response backend over HTTP
//!
//! The endpoint returns the whole answer at once; it is replayed to the
//! transcript through the simulated chunker.

use super::{Backend, Submission};
use crate::assembler::{simulated_stream, ChunkStream, ChunkingPolicy};
use crate::error::BackendError;
use crate::transcript::{Attachment, Message, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize)]
struct MessageRequest<'a> {
    conversation_id: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment: Option<&'a Attachment>,
}

#[derive(Deserialize)]
struct MessageResponse {
    response: String,
}

#[derive(Deserialize)]
struct HistoryResponse {
    messages: Vec<HistoryEntry>,
}

#[derive(Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    id: Option<String>,
    role: Role,
    content: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl From<HistoryEntry> for Message {
    fn from(entry: HistoryEntry) -> Self {
        let id = entry
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut message = match entry.role {
            Role::User => Message::user(id, entry.content, None),
            Role::Assistant => Message::assistant(id, entry.content),
        };
        if let Some(timestamp) = entry.timestamp {
            message.timestamp = timestamp;
        }
        message
    }
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    chunking: ChunkingPolicy,
}

impl HttpBackend {
    pub fn new(base_url: &str, chunking: ChunkingPolicy) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| BackendError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            chunking,
        })
    }

    fn classify_error(status: StatusCode, body: &str) -> BackendError {
        match status.as_u16() {
            400..=499 => BackendError::rejected(format!("Rejected ({status}): {body}")),
            500..=599 => BackendError::server(format!("Server error ({status}): {body}")),
            _ => BackendError::unknown(format!("HTTP {status}: {body}")),
        }
    }

    fn request_error(e: &reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::timeout(format!("Request timeout: {e}"))
        } else if e.is_connect() {
            BackendError::transport(format!("Connection failed: {e}"))
        } else {
            BackendError::unknown(format!("Request failed: {e}"))
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn ready(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn submit(&self, submission: Submission) -> Result<ChunkStream, BackendError> {
        let request = MessageRequest {
            conversation_id: &submission.conversation_id,
            content: &submission.content,
            attachment: submission.attachment.as_ref(),
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::request_error(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::transport(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }

        let parsed: MessageResponse = serde_json::from_str(&body).map_err(|e| {
            BackendError::protocol(format!("Failed to parse response: {e} - body: {body}"))
        })?;

        tracing::debug!(
            conv_id = %submission.conversation_id,
            message_id = %submission.message_id,
            len = parsed.response.len(),
            "Backend responded"
        );
        Ok(simulated_stream(&parsed.response, self.chunking))
    }

    async fn history(&self, conversation_id: &str) -> Result<Vec<Message>, BackendError> {
        let response = self
            .client
            .get(format!(
                "{}/conversations/{conversation_id}/messages",
                self.base_url
            ))
            .send()
            .await
            .map_err(|e| Self::request_error(&e))?;

        let status = response.status();
        // Unknown to the backend means a brand new conversation
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::transport(format!("Failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }

        let parsed: HistoryResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::protocol(format!("Failed to parse history: {e}")))?;
        Ok(parsed.messages.into_iter().map(Message::from).collect())
    }

    fn name(&self) -> &str {
        "http"
    }
}
