//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    ConnectionResponse, ConversationListResponse, ConversationResponse, ErrorResponse,
    SubmitRequest, SubmitResponse, SuccessResponse,
};
use super::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::sync::mpsc;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/conversations", get(list_conversations))
        .route(
            "/api/conversations/:id",
            get(get_conversation).delete(dispose_conversation),
        )
        // Submissions are queued, never rejected
        .route("/api/conversations/:id/messages", post(submit_message))
        // SSE streaming
        .route("/api/conversations/:id/stream", get(stream_conversation))
        .route("/api/conversations/:id/clear", post(clear_conversation))
        // Backend connection indicator
        .route("/api/connection", get(get_connection))
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Conversations
// ============================================================

async fn list_conversations(State(state): State<AppState>) -> Json<ConversationListResponse> {
    Json(ConversationListResponse {
        conversations: state.runtime.conversation_ids().await,
    })
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, AppError> {
    let status = state.runtime.processor_status(&id).await;
    if status.is_none() && !state.runtime.store().contains(&id) {
        return Err(AppError::NotFound(format!("Conversation not found: {id}")));
    }

    Ok(Json(ConversationResponse {
        messages: state.runtime.transcript(&id),
        status: status.unwrap_or_default(),
        conversation_id: id,
    }))
}

async fn dispose_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    if state.runtime.dispose(&id).await {
        Ok(Json(SuccessResponse { success: true }))
    } else {
        Err(AppError::NotFound(format!("Conversation not found: {id}")))
    }
}

// ============================================================
// User Actions
// ============================================================

async fn submit_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitRequest>,
) -> impl IntoResponse {
    state
        .runtime
        .enqueue_submission(&id, req.content, req.attachment)
        .await;
    (StatusCode::ACCEPTED, Json(SubmitResponse { queued: true }))
}

async fn clear_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<SuccessResponse> {
    state.runtime.clear_conversation(&id).await;
    Json(SuccessResponse { success: true })
}

// ============================================================
// SSE Streaming
// ============================================================

async fn stream_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (tx, updates) = mpsc::unbounded_channel();
    let subscription = state
        .runtime
        .subscribe_transcript(&id, move |update| {
            // Receiver gone means the client disconnected
            let _ = tx.send(update);
        })
        .await;
    sse_stream(subscription, updates)
}

// ============================================================
// Connection & Version
// ============================================================

async fn get_connection(State(state): State<AppState>) -> Json<ConnectionResponse> {
    Json(ConnectionResponse {
        backend: state.runtime.backend_name().to_string(),
        state: state.runtime.connection_state(),
    })
}

async fn get_version() -> &'static str {
    concat!("chatline ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

enum AppError {
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
