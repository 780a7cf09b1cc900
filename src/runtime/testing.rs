//! Mock backend and runtime integration tests
//!
//! These exercise the registry, processor and transcript together without
//! real I/O.

use super::{ProcessorStatus, RuntimeConfig, RuntimeManager};
use crate::assembler::{ChunkStream, StreamEvent};
use crate::backend::{Backend, Submission};
use crate::error::BackendError;
use crate::transcript::{Message, Role, TranscriptUpdate};
use crate::transport::ConnectionState;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};

// ============================================================================
// Mock Backend
// ============================================================================

/// Scripted answer to one submission
pub enum MockResponse {
    /// Stream these chunks, then done
    Chunks(Vec<String>),
    /// Reject at submit time
    Fail(BackendError),
    /// Stream these chunks, then fail
    FailAfter(Vec<String>, BackendError),
    /// Stream nothing until notified, then these chunks and done
    Gated(Arc<Notify>, Vec<String>),
    /// Accept and never produce anything
    Hang,
}

/// Simulated link between the engine and the mock backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockLink {
    Open,
    Down,
    /// Gone for good; `ready` fails
    Closed,
}

/// Mock backend that answers from a queue of scripted responses.
///
/// Unscripted submissions are echoed back as `Echo <conversation>: <content>`.
pub struct MockBackend {
    responses: Mutex<VecDeque<MockResponse>>,
    history: Mutex<HashMap<String, Vec<Message>>>,
    link: watch::Sender<MockLink>,
    chunk_delay: Duration,
    /// Record of all submissions made
    pub submissions: Mutex<Vec<Submission>>,
}

impl MockBackend {
    pub fn new() -> Self {
        let (link, _) = watch::channel(MockLink::Open);
        Self {
            responses: Mutex::new(VecDeque::new()),
            history: Mutex::new(HashMap::new()),
            link,
            chunk_delay: Duration::from_millis(2),
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_response(&self, response: MockResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn with_history(self, conversation_id: &str, messages: Vec<Message>) -> Self {
        self.history
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), messages);
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.link
            .send_replace(if ready { MockLink::Open } else { MockLink::Down });
    }

    /// Take the backend away permanently
    pub fn close(&self) {
        self.link.send_replace(MockLink::Closed);
    }

    pub fn recorded_contents(&self) -> Vec<String> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.content.clone())
            .collect()
    }

    fn paced(&self, chunks: Vec<String>, tail: Result<StreamEvent, BackendError>) -> ChunkStream {
        let delay = self.chunk_delay;
        stream::iter(chunks)
            .then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                Ok(StreamEvent::Chunk(chunk))
            })
            .chain(stream::once(async move { tail }))
            .boxed()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn ready(&self) -> Result<(), BackendError> {
        let mut rx = self.link.subscribe();
        let link = *rx
            .wait_for(|link| *link != MockLink::Down)
            .await
            .map_err(|_| BackendError::transport("Mock backend dropped"))?;
        match link {
            MockLink::Closed => Err(BackendError::transport("Transport closed")),
            _ => Ok(()),
        }
    }

    async fn submit(&self, submission: Submission) -> Result<ChunkStream, BackendError> {
        if *self.link.borrow() != MockLink::Open {
            return Err(BackendError::transport("Transport is not open"));
        }
        self.submissions.lock().unwrap().push(submission.clone());

        let response = self.responses.lock().unwrap().pop_front();
        match response {
            None => Ok(self.paced(
                vec![
                    "Echo ".to_string(),
                    submission.conversation_id,
                    ": ".to_string(),
                    submission.content,
                ],
                Ok(StreamEvent::Done),
            )),
            Some(MockResponse::Chunks(chunks)) => Ok(self.paced(chunks, Ok(StreamEvent::Done))),
            Some(MockResponse::Fail(error)) => Err(error),
            Some(MockResponse::FailAfter(chunks, error)) => Ok(self.paced(chunks, Err(error))),
            Some(MockResponse::Gated(gate, chunks)) => {
                let rest = self.paced(chunks, Ok(StreamEvent::Done));
                Ok(stream::once(async move {
                    gate.notified().await;
                    rest
                })
                .flatten()
                .boxed())
            }
            Some(MockResponse::Hang) => Ok(stream::pending().boxed()),
        }
    }

    async fn history(&self, conversation_id: &str) -> Result<Vec<Message>, BackendError> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    fn connection_state(&self) -> ConnectionState {
        match *self.link.borrow() {
            MockLink::Open => ConnectionState::Open,
            MockLink::Down => ConnectionState::Reconnecting {
                attempt: 1,
                delay_ms: 500,
            },
            MockLink::Closed => ConnectionState::Closed,
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ============================================================================
// Test Engine
// ============================================================================

/// Registry wired to a mock backend, with polling helpers
pub struct TestEngine {
    pub backend: Arc<MockBackend>,
    pub manager: RuntimeManager,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with(MockBackend::new(), RuntimeConfig::default())
    }

    pub fn with(backend: MockBackend, config: RuntimeConfig) -> Self {
        let backend = Arc::new(backend);
        let manager = RuntimeManager::new(backend.clone(), config);
        Self { backend, manager }
    }

    /// Start the conversation and subscribe to its transcript
    pub async fn subscribe(
        &self,
        conversation_id: &str,
    ) -> (Vec<Message>, broadcast::Receiver<TranscriptUpdate>) {
        self.manager.get_or_create(conversation_id).await;
        self.manager.store().subscribe(conversation_id)
    }

    /// Wait until the transcript satisfies `pred`
    pub async fn wait_for<F>(&self, conversation_id: &str, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&[Message]) -> bool,
    {
        let (initial, mut rx) = self.manager.store().subscribe(conversation_id);
        if pred(&initial) {
            return true;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(update)) => {
                    if pred(&update.messages) {
                        return true;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    if pred(&self.manager.transcript(conversation_id)) {
                        return true;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return pred(&self.manager.transcript(conversation_id));
                }
            }
        }
    }

    /// Wait until `count` messages exist and all are sealed
    pub async fn wait_settled(&self, conversation_id: &str, count: usize) -> Vec<Message> {
        let settled = self
            .wait_for(conversation_id, Duration::from_secs(5), |messages| {
                messages.len() == count && messages.iter().all(Message::is_sealed)
            })
            .await;
        let messages = self.manager.transcript(conversation_id);
        assert!(settled, "transcript never settled: {messages:#?}");
        messages
    }

    /// Wait until the backend has seen `count` submissions
    pub async fn wait_submitted(&self, count: usize) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.backend.submissions.lock().unwrap().len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the processor status satisfies `pred`
    pub async fn wait_status<F>(&self, conversation_id: &str, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&ProcessorStatus) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.manager.processor_status(conversation_id).await {
                if pred(&status) {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn chunks(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::ProcessorState;
    use crate::transcript::Attachment;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_submission_produces_user_message_then_reply() {
        let engine = TestEngine::new();
        let (initial, mut updates) = engine.subscribe("c1").await;
        assert!(initial.is_empty());

        engine.manager.enqueue_submission("c1", "Hello", None).await;
        let messages = engine.wait_settled("c1", 2).await;

        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Echo c1: Hello");
        assert!(messages[1].error.is_none());

        // The user message is visible on its own before the placeholder
        let first = updates.recv().await.unwrap();
        assert_eq!(first.messages.len(), 1);
        assert_eq!(first.messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_reply_streams_into_placeholder() {
        let engine = TestEngine::new();
        engine
            .backend
            .queue_response(MockResponse::Chunks(chunks(&["Hi", " there", "!"])));
        let (_, mut updates) = engine.subscribe("c1").await;

        engine.manager.enqueue_submission("c1", "Hello", None).await;
        engine.wait_settled("c1", 2).await;

        let mut partials = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let Some(reply) = update.messages.get(1) {
                partials.push((reply.content.clone(), reply.streaming));
            }
        }
        assert_eq!(
            partials,
            vec![
                (String::new(), true),
                ("Hi".to_string(), true),
                ("Hi there".to_string(), true),
                ("Hi there!".to_string(), true),
                ("Hi there!".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_submission_while_busy_waits_for_seal() {
        let engine = TestEngine::new();
        let gate = Arc::new(Notify::new());
        engine
            .backend
            .queue_response(MockResponse::Gated(gate.clone(), chunks(&["first reply"])));

        engine.manager.enqueue_submission("c1", "First", None).await;
        assert!(engine.wait_submitted(1).await);

        engine.manager.enqueue_submission("c1", "Second", None).await;
        assert!(
            engine
                .wait_status("c1", WAIT, |s| s.queued == vec!["Second".to_string()])
                .await
        );
        let messages = engine.manager.transcript("c1");
        assert_eq!(messages.len(), 2);
        assert!(messages[1].streaming);
        assert_eq!(engine.backend.recorded_contents(), vec!["First"]);

        gate.notify_one();
        let messages = engine.wait_settled("c1", 4).await;
        let summary: Vec<(Role, &str)> = messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (Role::User, "First"),
                (Role::Assistant, "first reply"),
                (Role::User, "Second"),
                (Role::Assistant, "Echo c1: Second"),
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_follows_enqueue_order() {
        let engine = TestEngine::new();
        let inputs: Vec<String> = (0..5).map(|i| format!("msg {i}")).collect();
        for input in &inputs {
            engine.manager.enqueue_submission("c1", input.clone(), None).await;
        }

        let messages = engine.wait_settled("c1", 10).await;
        assert_eq!(engine.backend.recorded_contents(), inputs);
        let users: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(users, inputs);
        // Each reply directly follows its submission
        for pair in messages.chunks(2) {
            assert_eq!(pair[1].content, format!("Echo c1: {}", pair[0].content));
        }
    }

    #[tokio::test]
    async fn test_drop_mid_stream_seals_with_error_and_recovers() {
        let engine = TestEngine::new();
        engine.backend.queue_response(MockResponse::FailAfter(
            chunks(&["partial"]),
            BackendError::transport("Connection lost"),
        ));

        engine.manager.enqueue_submission("c1", "x", None).await;
        let messages = engine.wait_settled("c1", 2).await;
        let reply = &messages[1];
        assert!(reply.content.starts_with("partial"));
        assert!(reply.content.contains("Connection lost"));
        assert_eq!(reply.error.as_deref(), Some("Connection lost"));
        assert!(
            engine
                .wait_status("c1", WAIT, |s| s.state == ProcessorState::Idle)
                .await
        );

        engine.manager.enqueue_submission("c1", "again", None).await;
        let messages = engine.wait_settled("c1", 4).await;
        assert_eq!(messages[3].content, "Echo c1: again");
        assert!(messages[3].error.is_none());
    }

    #[tokio::test]
    async fn test_rejected_submission_does_not_block_queue() {
        let engine = TestEngine::new();
        engine
            .backend
            .queue_response(MockResponse::Fail(BackendError::rejected("too large")));

        engine.manager.enqueue_submission("c1", "big", None).await;
        engine.manager.enqueue_submission("c1", "small", None).await;

        let messages = engine.wait_settled("c1", 4).await;
        assert_eq!(messages[1].error.as_deref(), Some("too large"));
        assert_eq!(messages[3].content, "Echo c1: small");
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let engine = TestEngine::with(
            MockBackend::new(),
            RuntimeConfig {
                submit_timeout: Duration::from_millis(100),
                ..RuntimeConfig::default()
            },
        );
        engine.backend.queue_response(MockResponse::Hang);

        engine.manager.enqueue_submission("c1", "anyone?", None).await;
        let messages = engine.wait_settled("c1", 2).await;
        assert!(messages[1].error.as_deref().unwrap().contains("No response"));
        assert!(
            engine
                .wait_status("c1", WAIT, |s| s.state == ProcessorState::Idle)
                .await
        );
    }

    #[tokio::test]
    async fn test_conversations_are_isolated() {
        let engine = TestEngine::new();
        let gate = Arc::new(Notify::new());
        engine
            .backend
            .queue_response(MockResponse::Gated(gate.clone(), chunks(&["slow"])));

        engine.manager.enqueue_submission("c1", "alpha", None).await;
        assert!(engine.wait_submitted(1).await);
        engine.manager.enqueue_submission("c2", "beta", None).await;

        // c2 completes while c1 is still waiting on its backend
        let c2 = engine.wait_settled("c2", 2).await;
        assert_eq!(c2[0].content, "beta");
        assert_eq!(c2[1].content, "Echo c2: beta");
        assert!(engine.manager.transcript("c1")[1].streaming);

        gate.notify_one();
        let c1 = engine.wait_settled("c1", 2).await;
        assert_eq!(c1[0].content, "alpha");
        assert_eq!(c1[1].content, "slow");
        assert_eq!(engine.manager.transcript("c2"), c2);
        assert_eq!(engine.manager.conversation_ids().await, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_submissions_buffer_until_backend_ready() {
        let backend = MockBackend::new();
        backend.set_ready(false);
        let engine = TestEngine::with(backend, RuntimeConfig::default());
        assert!(!engine.manager.connection_state().is_open());

        engine.manager.enqueue_submission("c1", "queued", None).await;
        assert!(
            engine
                .wait_status("c1", WAIT, |s| s.waiting_for_backend
                    && s.queued == vec!["queued".to_string()])
                .await
        );
        assert!(engine.manager.transcript("c1").is_empty());
        assert!(engine.backend.recorded_contents().is_empty());

        engine.backend.set_ready(true);
        let messages = engine.wait_settled("c1", 2).await;
        assert_eq!(messages[1].content, "Echo c1: queued");
        assert!(
            engine
                .wait_status("c1", WAIT, |s| !s.waiting_for_backend && s.queued.is_empty())
                .await
        );
    }

    #[tokio::test]
    async fn test_submission_outlives_ready_timeout() {
        let backend = MockBackend::new();
        backend.set_ready(false);
        let engine = TestEngine::with(
            backend,
            RuntimeConfig {
                ready_timeout: Duration::from_millis(50),
                ..RuntimeConfig::default()
            },
        );

        engine.manager.enqueue_submission("c1", "buffered", None).await;
        // Several timeouts pass while the backend is down
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(engine.manager.transcript("c1").is_empty());
        assert!(engine.backend.recorded_contents().is_empty());
        let status = engine.manager.processor_status("c1").await.unwrap();
        assert!(status.waiting_for_backend);
        assert_eq!(status.queued, vec!["buffered".to_string()]);

        engine.backend.set_ready(true);
        let messages = engine.wait_settled("c1", 2).await;
        assert_eq!(engine.backend.recorded_contents(), vec!["buffered"]);
        assert_eq!(messages[0].content, "buffered");
        assert_eq!(messages[1].content, "Echo c1: buffered");
        assert!(messages[1].error.is_none());
    }

    #[tokio::test]
    async fn test_closed_backend_fails_queued_items() {
        let backend = MockBackend::new();
        backend.set_ready(false);
        let engine = TestEngine::with(backend, RuntimeConfig::default());

        engine.manager.enqueue_submission("c1", "first", None).await;
        engine.manager.enqueue_submission("c1", "second", None).await;
        assert!(
            engine
                .wait_status("c1", WAIT, |s| s.waiting_for_backend && s.queued.len() == 2)
                .await
        );

        engine.backend.close();
        let messages = engine.wait_settled("c1", 4).await;
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].error.as_deref(), Some("Transport is not open"));
        assert_eq!(messages[2].content, "second");
        assert_eq!(messages[3].error.as_deref(), Some("Transport is not open"));
        assert!(
            engine
                .wait_status("c1", WAIT, |s| s.state == ProcessorState::Idle
                    && s.queued.is_empty()
                    && !s.waiting_for_backend)
                .await
        );
    }

    #[tokio::test]
    async fn test_clear_discards_queue_and_late_chunks() {
        let engine = TestEngine::new();
        let gate = Arc::new(Notify::new());
        engine
            .backend
            .queue_response(MockResponse::Gated(gate.clone(), chunks(&["late"])));

        engine.manager.enqueue_submission("c1", "First", None).await;
        engine.manager.enqueue_submission("c1", "Second", None).await;
        assert!(engine.wait_for("c1", WAIT, |m| m.len() == 2).await);

        engine.manager.clear_conversation("c1").await;
        assert!(engine.manager.transcript("c1").is_empty());
        let status = engine.manager.processor_status("c1").await.unwrap();
        assert_eq!(status, ProcessorStatus::default());

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.manager.transcript("c1").is_empty());
        assert_eq!(engine.backend.recorded_contents(), vec!["First"]);

        engine.manager.enqueue_submission("c1", "Third", None).await;
        let messages = engine.wait_settled("c1", 2).await;
        assert_eq!(messages[0].content, "Third");
    }

    #[tokio::test]
    async fn test_clear_unknown_conversation_is_noop() {
        let engine = TestEngine::new();
        engine.manager.clear_conversation("nobody").await;
        assert!(engine.manager.conversation_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_transcript_until_unsubscribed() {
        let engine = TestEngine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = engine
            .manager
            .subscribe_transcript("c1", move |update| {
                sink.lock().unwrap().push(update.messages.len());
            })
            .await;

        engine.manager.enqueue_submission("c1", "Hello", None).await;
        engine.wait_settled("c1", 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.first(), Some(&0));
            assert_eq!(seen.last(), Some(&2));
        }

        subscription.unsubscribe();
        let count = seen.lock().unwrap().len();
        engine.manager.enqueue_submission("c1", "again", None).await;
        engine.wait_settled("c1", 4).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), count);
    }

    #[tokio::test]
    async fn test_history_seeds_new_conversation() {
        let history = vec![
            Message::user("h1", "earlier", None),
            Message::assistant("h2", "answer"),
        ];
        let engine = TestEngine::with(
            MockBackend::new().with_history("c1", history.clone()),
            RuntimeConfig::default(),
        );

        let (initial, _) = engine.subscribe("c1").await;
        assert_eq!(initial, history);

        engine.manager.enqueue_submission("c1", "next", None).await;
        let messages = engine.wait_settled("c1", 4).await;
        assert_eq!(&messages[..2], &history[..]);
        assert_eq!(messages[2].content, "next");
    }

    #[tokio::test]
    async fn test_attachment_reaches_backend_and_transcript() {
        let engine = TestEngine::new();
        let attachment = Attachment {
            name: "notes.txt".to_string(),
            size: 12,
            mime: "text/plain".to_string(),
        };

        engine
            .manager
            .enqueue_submission("c1", "see file", Some(attachment.clone()))
            .await;
        let messages = engine.wait_settled("c1", 2).await;
        assert_eq!(messages[0].attachment.as_ref(), Some(&attachment));
        let submissions = engine.backend.submissions.lock().unwrap().clone();
        assert_eq!(submissions[0].attachment.as_ref(), Some(&attachment));
        assert_eq!(submissions[0].message_id, messages[1].id);
    }

    #[tokio::test]
    async fn test_dispose_forgets_conversation() {
        let engine = TestEngine::new();
        engine.manager.enqueue_submission("c1", "Hello", None).await;
        engine.wait_settled("c1", 2).await;

        assert!(engine.manager.dispose("c1").await);
        assert!(engine.manager.transcript("c1").is_empty());
        assert!(engine.manager.processor_status("c1").await.is_none());
        assert!(!engine.manager.dispose("c1").await);

        // A later submission starts from scratch
        engine.manager.enqueue_submission("c1", "again", None).await;
        let messages = engine.wait_settled("c1", 2).await;
        assert_eq!(messages[0].content, "again");
    }

    #[tokio::test]
    async fn test_dispose_mid_stream_leaves_no_transcript() {
        let engine = TestEngine::new();
        let gate = Arc::new(Notify::new());
        engine
            .backend
            .queue_response(MockResponse::Gated(gate.clone(), chunks(&["late"])));

        engine.manager.enqueue_submission("c1", "in flight", None).await;
        assert!(engine.wait_submitted(1).await);
        engine.manager.enqueue_submission("c1", "queued", None).await;
        assert!(
            engine
                .wait_status("c1", WAIT, |s| s.queued == vec!["queued".to_string()])
                .await
        );

        assert!(engine.manager.dispose("c1").await);
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!engine.manager.store().contains("c1"));
        assert!(engine.manager.processor_status("c1").await.is_none());
        assert_eq!(engine.backend.recorded_contents(), vec!["in flight"]);

        // Recreated from history with a working processor
        engine.manager.enqueue_submission("c1", "fresh", None).await;
        let messages = engine.wait_settled("c1", 2).await;
        assert_eq!(messages[0].content, "fresh");
        assert_eq!(messages[1].content, "Echo c1: fresh");
    }
}
