//! Transcript store
//!
//! Each conversation owns its own slot (message list + update channel), so
//! mutations of one conversation never contend with another beyond the brief
//! map lookup. Within a slot every read-modify-write runs under the slot lock
//! and the update is published before the lock is released, so subscribers
//! observe mutations in the order they were applied.

use super::{fallback_notice, Message};
use crate::error::StoreError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Full transcript published after every mutation
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptUpdate {
    pub conversation_id: String,
    pub messages: Vec<Message>,
}

struct Slot {
    messages: Mutex<Vec<Message>>,
    updates: broadcast::Sender<TranscriptUpdate>,
}

impl Slot {
    fn new(messages: Vec<Message>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            messages: Mutex::new(messages),
            updates,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, conversation_id: &str, messages: &[Message]) {
        // No subscribers is fine
        let _ = self.updates.send(TranscriptUpdate {
            conversation_id: conversation_id.to_string(),
            messages: messages.to_vec(),
        });
    }
}

/// Conversation-keyed transcript storage with change subscriptions
#[derive(Default)]
pub struct TranscriptStore {
    conversations: RwLock<HashMap<String, Arc<Slot>>>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, conversation_id: &str) -> Option<Arc<Slot>> {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
    }

    fn slot_or_create(&self, conversation_id: &str) -> Arc<Slot> {
        if let Some(slot) = self.slot(conversation_id) {
            return slot;
        }
        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Slot::new(Vec::new())))
            .clone()
    }

    fn existing(&self, conversation_id: &str) -> Result<Arc<Slot>, StoreError> {
        self.slot(conversation_id)
            .ok_or_else(|| StoreError::UnknownConversation(conversation_id.to_string()))
    }

    /// Register a conversation if it does not exist yet
    pub fn ensure(&self, conversation_id: &str) {
        self.slot_or_create(conversation_id);
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.slot(conversation_id).is_some()
    }

    /// Seed an empty transcript with historical messages.
    ///
    /// Seeded messages are forced sealed. Returns false (and changes nothing)
    /// when the transcript already has content.
    pub fn seed(&self, conversation_id: &str, history: Vec<Message>) -> bool {
        let slot = self.slot_or_create(conversation_id);
        let mut messages = slot.lock();
        if !messages.is_empty() {
            return false;
        }
        messages.extend(history.into_iter().map(|mut m| {
            m.streaming = false;
            m
        }));
        slot.publish(conversation_id, &messages);
        true
    }

    /// Append a message to a registered conversation
    pub fn append(&self, conversation_id: &str, message: Message) -> Result<(), StoreError> {
        let slot = self.existing(conversation_id)?;
        let mut messages = slot.lock();
        if message.streaming && messages.iter().any(|m| m.streaming) {
            return Err(StoreError::StreamingInProgress(conversation_id.to_string()));
        }
        messages.push(message);
        slot.publish(conversation_id, &messages);
        Ok(())
    }

    /// Append a content delta to a message that is still streaming
    pub fn update_streaming_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        delta: &str,
    ) -> Result<(), StoreError> {
        let slot = self.existing(conversation_id)?;
        let mut messages = slot.lock();
        let message = find_mut(&mut messages, conversation_id, message_id)?;
        if !message.streaming {
            return Err(StoreError::Sealed(message_id.to_string()));
        }
        message.content.push_str(delta);
        slot.publish(conversation_id, &messages);
        Ok(())
    }

    /// Freeze a message.
    ///
    /// With an error the fallback notice is appended to whatever content
    /// arrived. Returns `Ok(false)` if the message was already sealed, in
    /// which case nothing changes.
    pub fn seal(
        &self,
        conversation_id: &str,
        message_id: &str,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let slot = self.existing(conversation_id)?;
        let mut messages = slot.lock();
        let message = find_mut(&mut messages, conversation_id, message_id)?;
        if !message.streaming {
            return Ok(false);
        }
        if let Some(error) = error {
            if !message.content.is_empty() {
                message.content.push_str("\n\n");
            }
            message.content.push_str(&fallback_notice(error));
            message.error = Some(error.to_string());
        }
        message.streaming = false;
        slot.publish(conversation_id, &messages);
        Ok(true)
    }

    /// Empty a transcript, keeping the conversation and its subscribers
    pub fn clear(&self, conversation_id: &str) {
        if let Some(slot) = self.slot(conversation_id) {
            let mut messages = slot.lock();
            messages.clear();
            slot.publish(conversation_id, &messages);
        }
    }

    /// Drop a conversation entirely; subscribers see their channel close
    pub fn remove(&self, conversation_id: &str) -> bool {
        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conversation_id)
            .is_some()
    }

    pub fn snapshot(&self, conversation_id: &str) -> Vec<Message> {
        self.slot(conversation_id)
            .map(|slot| slot.lock().clone())
            .unwrap_or_default()
    }

    /// Current transcript plus a receiver for every later mutation.
    ///
    /// Both are taken under the slot lock so no update falls between them.
    pub fn subscribe(
        &self,
        conversation_id: &str,
    ) -> (Vec<Message>, broadcast::Receiver<TranscriptUpdate>) {
        let slot = self.slot_or_create(conversation_id);
        let messages = slot.lock();
        (messages.clone(), slot.updates.subscribe())
    }

    /// Invoke `callback` with the current transcript and after each mutation.
    ///
    /// Delivery stops when the returned [`Subscription`] is dropped or
    /// unsubscribed, or when the conversation is removed.
    pub fn subscribe_with<F>(
        self: &Arc<Self>,
        conversation_id: &str,
        mut callback: F,
    ) -> Subscription
    where
        F: FnMut(TranscriptUpdate) + Send + 'static,
    {
        let (initial, mut rx) = self.subscribe(conversation_id);
        let store = Arc::clone(self);
        let conversation_id = conversation_id.to_string();

        let task = tokio::spawn(async move {
            callback(TranscriptUpdate {
                conversation_id: conversation_id.clone(),
                messages: initial,
            });
            loop {
                match rx.recv().await {
                    Ok(update) => callback(update),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(
                            conv_id = %conversation_id,
                            skipped,
                            "Transcript subscriber lagged, resending snapshot"
                        );
                        callback(TranscriptUpdate {
                            conversation_id: conversation_id.clone(),
                            messages: store.snapshot(&conversation_id),
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription { task: Some(task) }
    }
}

fn find_mut<'a>(
    messages: &'a mut [Message],
    conversation_id: &str,
    message_id: &str,
) -> Result<&'a mut Message, StoreError> {
    messages
        .iter_mut()
        .find(|m| m.id == message_id)
        .ok_or_else(|| StoreError::UnknownMessage {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        })
}

/// Handle for a callback subscription; dropping it unsubscribes
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
