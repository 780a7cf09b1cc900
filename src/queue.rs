//! Outgoing submission queue
//!
//! One FIFO per conversation. Enqueue is always accepted regardless of
//! connection or processor state; only the processor removes items.

use crate::transcript::Attachment;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// A pending user submission. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingItem {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub enqueued_at: DateTime<Utc>,
}

impl OutgoingItem {
    pub fn new(content: impl Into<String>, attachment: Option<Attachment>) -> Self {
        Self {
            content: content.into(),
            attachment,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct OutgoingQueue {
    items: VecDeque<OutgoingItem>,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, item: OutgoingItem) {
        self.items.push_back(item);
    }

    pub fn peek(&self) -> Option<&OutgoingItem> {
        self.items.front()
    }

    pub fn dequeue(&mut self) -> Option<OutgoingItem> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every pending item, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    /// Contents of pending items, head first
    pub fn contents(&self) -> Vec<String> {
        self.items.iter().map(|i| i.content.clone()).collect()
    }
}
