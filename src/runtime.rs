//! Conversation registry and per-conversation runtimes
//!
//! Each conversation gets its own task owning its queue and processor state.
//! The UI-facing calls only send commands to that task; nothing outside it
//! touches the queue.

mod executor;

#[cfg(test)]
pub mod testing;

pub use executor::ConversationRuntime;

use crate::backend::Backend;
use crate::queue::OutgoingItem;
use crate::state_machine::ProcessorState;
use crate::transcript::{Attachment, Message, Subscription, TranscriptStore, TranscriptUpdate};
use crate::transport::ConnectionState;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};

/// Bounds on every wait a runtime makes on its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Max wait for the submit call, the first chunk, and each later chunk
    pub submit_timeout: Duration,
    /// How long to wait for the backend to become ready before logging a
    /// warning and waiting again; queued items are kept throughout
    pub ready_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(60),
        }
    }
}

/// Snapshot of one conversation's processor, published on every change
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessorStatus {
    pub state: ProcessorState,
    /// Pending submissions, head first
    pub queued: Vec<String>,
    /// Idle with work queued, waiting for the backend to become ready
    pub waiting_for_backend: bool,
}

/// Commands from the registry to a conversation task
#[derive(Debug)]
pub enum Command {
    Enqueue(OutgoingItem),
    Clear { done: oneshot::Sender<()> },
    /// Detach the in-flight response and exit; acked after the last
    /// transcript write
    Stop { done: oneshot::Sender<()> },
}

/// Handle to interact with a running conversation
#[derive(Clone)]
pub struct ConversationHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ProcessorStatus>,
}

/// Manager for all conversation runtimes
pub struct RuntimeManager {
    backend: Arc<dyn Backend>,
    store: Arc<TranscriptStore>,
    config: RuntimeConfig,
    runtimes: RwLock<HashMap<String, ConversationHandle>>,
}

impl RuntimeManager {
    pub fn new(backend: Arc<dyn Backend>, config: RuntimeConfig) -> Self {
        Self {
            backend,
            store: Arc::new(TranscriptStore::new()),
            config,
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<TranscriptStore> {
        &self.store
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Get or create the runtime for a conversation.
    ///
    /// A conversation seen for the first time is seeded from the backend's
    /// history before its task starts.
    pub async fn get_or_create(&self, conversation_id: &str) -> ConversationHandle {
        {
            let runtimes = self.runtimes.read().await;
            if let Some(handle) = runtimes.get(conversation_id) {
                if !handle.command_tx.is_closed() {
                    return handle.clone();
                }
            }
        }

        // Fetch outside the lock; other conversations must not wait on it
        let history = if self.store.contains(conversation_id) {
            Vec::new()
        } else {
            self.fetch_history(conversation_id).await
        };

        let mut runtimes = self.runtimes.write().await;
        if let Some(handle) = runtimes.get(conversation_id) {
            if !handle.command_tx.is_closed() {
                return handle.clone();
            }
        }

        if history.is_empty() {
            self.store.ensure(conversation_id);
        } else if self.store.seed(conversation_id, history) {
            tracing::info!(conv_id = %conversation_id, "Seeded transcript from history");
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ProcessorStatus::default());

        let runtime = ConversationRuntime::new(
            conversation_id.to_string(),
            Arc::clone(&self.backend),
            Arc::clone(&self.store),
            self.config,
            command_rx,
            status_tx,
        );

        let conv_id = conversation_id.to_string();
        tokio::spawn(async move {
            runtime.run().await;
            tracing::info!(conv_id = %conv_id, "Conversation runtime finished");
        });

        let handle = ConversationHandle {
            command_tx,
            status_rx,
        };
        runtimes.insert(conversation_id.to_string(), handle.clone());
        handle
    }

    async fn fetch_history(&self, conversation_id: &str) -> Vec<Message> {
        match self.backend.history(conversation_id).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(conv_id = %conversation_id, error = %e, "Failed to load history");
                Vec::new()
            }
        }
    }

    /// Queue a submission. Always accepted, whatever the connection or
    /// processor state.
    pub async fn enqueue_submission(
        &self,
        conversation_id: &str,
        content: impl Into<String>,
        attachment: Option<Attachment>,
    ) {
        let command = Command::Enqueue(OutgoingItem::new(content, attachment));
        let handle = self.get_or_create(conversation_id).await;
        if let Err(mpsc::error::SendError(command)) = handle.command_tx.send(command) {
            // Runtime went away between lookup and send; start a fresh one
            tracing::warn!(conv_id = %conversation_id, "Runtime gone, restarting");
            self.runtimes.write().await.remove(conversation_id);
            let handle = self.get_or_create(conversation_id).await;
            let _ = handle.command_tx.send(command);
        }
    }

    /// Call `callback` with the current transcript and after every mutation
    /// until the returned handle is dropped or unsubscribed
    pub async fn subscribe_transcript<F>(&self, conversation_id: &str, callback: F) -> Subscription
    where
        F: FnMut(TranscriptUpdate) + Send + 'static,
    {
        self.get_or_create(conversation_id).await;
        self.store.subscribe_with(conversation_id, callback)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.backend.connection_state()
    }

    pub fn transcript(&self, conversation_id: &str) -> Vec<Message> {
        self.store.snapshot(conversation_id)
    }

    pub async fn processor_status(&self, conversation_id: &str) -> Option<ProcessorStatus> {
        let runtimes = self.runtimes.read().await;
        runtimes
            .get(conversation_id)
            .map(|handle| handle.status_rx.borrow().clone())
    }

    /// Empty the transcript and queue. An in-flight response is detached
    /// locally; the request already sent to the backend is not cancelled.
    pub async fn clear_conversation(&self, conversation_id: &str) {
        let handle = self.runtimes.read().await.get(conversation_id).cloned();
        if let Some(handle) = handle {
            let (done, ack) = oneshot::channel();
            if handle.command_tx.send(Command::Clear { done }).is_ok() {
                let _ = ack.await;
                return;
            }
        }
        self.store.clear(conversation_id);
    }

    /// Stop a conversation's runtime and forget its transcript
    pub async fn dispose(&self, conversation_id: &str) -> bool {
        let handle = self.runtimes.write().await.remove(conversation_id);
        let had_runtime = handle.is_some();
        if let Some(handle) = handle {
            let (done, ack) = oneshot::channel();
            if handle.command_tx.send(Command::Stop { done }).is_ok() {
                let _ = ack.await;
            }
        }
        let had_transcript = self.store.remove(conversation_id);
        if had_runtime || had_transcript {
            tracing::info!(conv_id = %conversation_id, "Disposed conversation");
        }
        had_runtime || had_transcript
    }

    pub async fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runtimes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
