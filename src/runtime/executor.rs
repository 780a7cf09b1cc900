//! Conversation runtime executor

use super::{Command, ProcessorStatus, RuntimeConfig};
use crate::assembler::{Assembler, StreamEvent};
use crate::backend::{Backend, Submission};
use crate::error::BackendError;
use crate::queue::{OutgoingItem, OutgoingQueue};
use crate::state_machine::{transition, Effect, Event, ProcessorState};
use crate::transcript::{Message, TranscriptStore};
use chrono::Utc;
use futures::StreamExt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Result of one readiness wait, tagged with the gate that produced it
type GateResult = (u64, Result<(), BackendError>);

/// Owns one conversation's queue and processor. Runs as its own task until
/// the registry stops it or drops the command channel.
pub struct ConversationRuntime<B: Backend + ?Sized + 'static> {
    conversation_id: String,
    state: ProcessorState,
    queue: OutgoingQueue,
    backend: Arc<B>,
    store: Arc<TranscriptStore>,
    assembler: Assembler,
    config: RuntimeConfig,
    command_rx: mpsc::UnboundedReceiver<Command>,
    /// Stream events from the pump task
    event_rx: mpsc::UnboundedReceiver<Event>,
    event_tx: mpsc::UnboundedSender<Event>,
    /// Readiness results from the gate task
    ready_rx: mpsc::UnboundedReceiver<GateResult>,
    ready_tx: mpsc::UnboundedSender<GateResult>,
    status_tx: watch::Sender<ProcessorStatus>,
    /// Detaches the running pump
    pump: Option<CancellationToken>,
    /// Set while waiting for the backend to become ready
    gate: Option<(u64, CancellationToken)>,
    gate_generation: u64,
}

impl<B: Backend + ?Sized + 'static> ConversationRuntime<B> {
    pub fn new(
        conversation_id: String,
        backend: Arc<B>,
        store: Arc<TranscriptStore>,
        config: RuntimeConfig,
        command_rx: mpsc::UnboundedReceiver<Command>,
        status_tx: watch::Sender<ProcessorStatus>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            conversation_id,
            state: ProcessorState::Idle,
            queue: OutgoingQueue::new(),
            backend,
            assembler: Assembler::new(Arc::clone(&store)),
            store,
            config,
            command_rx,
            event_rx,
            event_tx,
            ready_rx,
            ready_tx,
            status_tx,
            pump: None,
            gate: None,
            gate_generation: 0,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(conv_id = %self.conversation_id, "Starting conversation runtime");

        let mut stopped = None;
        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => self.process_event(event),
                Some((generation, ready)) = self.ready_rx.recv() => {
                    self.on_backend_ready(generation, ready);
                }
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    if let ControlFlow::Break(done) = self.handle_command(command) {
                        stopped = Some(done);
                        break;
                    }
                }
            }
        }

        self.detach();
        tracing::info!(
            conv_id = %self.conversation_id,
            discarded = self.queue.len(),
            "Conversation runtime stopped"
        );
        // Acked only once nothing else can touch the transcript
        if let Some(done) = stopped {
            let _ = done.send(());
        }
    }

    /// Cancel the running pump and any pending readiness wait
    fn detach(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.cancel();
        }
        if let Some((_, gate)) = self.gate.take() {
            gate.cancel();
        }
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Enqueue(item) => {
                tracing::debug!(
                    conv_id = %self.conversation_id,
                    queued = self.queue.len() + 1,
                    "Enqueued submission"
                );
                self.queue.enqueue(item);
                if let Some(begin) = self.start_next() {
                    self.process_event(begin);
                } else {
                    self.publish_status();
                }
            }
            Command::Clear { done } => {
                let discarded = self.queue.clear();
                self.detach();
                self.process_event(Event::Reset);
                self.store.clear(&self.conversation_id);
                self.publish_status();
                tracing::info!(conv_id = %self.conversation_id, discarded, "Cleared conversation");
                let _ = done.send(());
            }
            Command::Stop { done } => return ControlFlow::Break(done),
        }
        ControlFlow::Continue(())
    }

    fn process_event(&mut self, event: Event) {
        // Chained effects can generate further events
        let mut events_to_process = vec![event];

        while let Some(current_event) = events_to_process.pop() {
            if !matches!(current_event, Event::Begin { .. } | Event::Reset)
                && current_event.message_id() != self.state.in_flight()
            {
                tracing::debug!(
                    conv_id = %self.conversation_id,
                    message_id = ?current_event.message_id(),
                    "Dropping stale stream event"
                );
            }

            let result = match transition(&self.state, current_event) {
                Ok(r) => r,
                Err(e) => {
                    // Only reachable if Begin is issued while busy; the item stays put
                    tracing::error!(
                        conv_id = %self.conversation_id,
                        error = %e,
                        "Rejected transition"
                    );
                    continue;
                }
            };

            if result.new_state.name() != self.state.name() {
                tracing::debug!(
                    conv_id = %self.conversation_id,
                    from = self.state.name(),
                    to = result.new_state.name(),
                    "Processor transition"
                );
            }
            self.state = result.new_state;

            for effect in result.effects {
                if let Some(generated_event) = self.execute_effect(effect) {
                    events_to_process.push(generated_event);
                }
            }
        }
    }

    /// Execute an effect and optionally return a generated event
    fn execute_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::AppendUserMessage {
                message_id,
                content,
                attachment,
            } => {
                let message = Message::user(message_id, content, attachment);
                if let Err(e) = self.store.append(&self.conversation_id, message) {
                    tracing::error!(
                        conv_id = %self.conversation_id,
                        error = %e,
                        "Failed to append user message"
                    );
                }
                None
            }

            Effect::CreatePlaceholder { message_id } => {
                if let Err(e) = self
                    .store
                    .append(&self.conversation_id, Message::placeholder(message_id))
                {
                    tracing::error!(
                        conv_id = %self.conversation_id,
                        error = %e,
                        "Failed to create placeholder"
                    );
                }
                None
            }

            Effect::Dispatch { item, message_id } => {
                self.spawn_pump(item, message_id);
                None
            }

            Effect::AppendChunk { message_id, delta } => {
                self.assembler
                    .append(&self.conversation_id, &message_id, &delta);
                None
            }

            Effect::Seal { message_id, error } => {
                if let Some(pump) = self.pump.take() {
                    pump.cancel();
                }
                if self
                    .assembler
                    .seal(&self.conversation_id, &message_id, error.as_deref())
                {
                    match &error {
                        Some(error) => tracing::warn!(
                            conv_id = %self.conversation_id,
                            message_id = %message_id,
                            error = %error,
                            "Response failed"
                        ),
                        None => tracing::info!(
                            conv_id = %self.conversation_id,
                            message_id = %message_id,
                            "Response complete"
                        ),
                    }
                }
                Some(Event::Sealed { message_id })
            }

            Effect::ProcessNext => self.start_next(),

            Effect::NotifyStatus => {
                self.publish_status();
                None
            }
        }
    }

    /// Begin the head item if the processor is idle and the backend can take
    /// it. Otherwise wait for readiness in the background; items stay queued.
    fn start_next(&mut self) -> Option<Event> {
        if self.state.is_busy() || self.queue.is_empty() {
            return None;
        }
        if self.gate.is_some() {
            return None;
        }
        if self.backend.connection_state().is_open() {
            return self.begin_next();
        }
        self.open_gate();
        None
    }

    fn begin_next(&mut self) -> Option<Event> {
        if self.state.is_busy() {
            return None;
        }
        let item = self.queue.dequeue()?;
        Some(Event::Begin {
            item,
            user_message_id: uuid::Uuid::new_v4().to_string(),
            assistant_message_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    fn open_gate(&mut self) {
        let cancel = CancellationToken::new();
        self.gate_generation += 1;
        let generation = self.gate_generation;
        self.gate = Some((generation, cancel.clone()));
        self.publish_status();

        tracing::info!(
            conv_id = %self.conversation_id,
            queued = self.queue.len(),
            head_enqueued_at = ?self.queue.peek().map(|item| item.enqueued_at),
            "Waiting for backend before dispatch"
        );

        let backend = Arc::clone(&self.backend);
        let ready_tx = self.ready_tx.clone();
        let ready_timeout = self.config.ready_timeout;
        let conv_id = self.conversation_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {}

                result = wait_ready(backend.as_ref(), ready_timeout, &conv_id) => {
                    let _ = ready_tx.send((generation, result));
                }
            }
        });
    }

    fn on_backend_ready(&mut self, generation: u64, result: Result<(), BackendError>) {
        if !matches!(&self.gate, Some((current, _)) if *current == generation) {
            // Gate was cancelled by a clear, or replaced since
            tracing::debug!(
                conv_id = %self.conversation_id,
                generation,
                "Dropping stale readiness result"
            );
            return;
        }
        self.gate = None;
        if let Err(e) = result {
            // Closed for good: dispatch so the head item fails instead of stalling the queue
            tracing::warn!(conv_id = %self.conversation_id, error = %e, "Backend unavailable");
        }
        if let Some(begin) = self.begin_next() {
            self.process_event(begin);
        } else {
            self.publish_status();
        }
    }

    fn spawn_pump(&mut self, item: OutgoingItem, message_id: String) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.pump.replace(cancel.clone()) {
            previous.cancel();
        }

        tracing::info!(
            conv_id = %self.conversation_id,
            message_id = %message_id,
            backend = self.backend.name(),
            queued_ms = (Utc::now() - item.enqueued_at).num_milliseconds(),
            "Dispatching submission"
        );

        let submission = Submission {
            conversation_id: self.conversation_id.clone(),
            message_id,
            content: item.content,
            attachment: item.attachment,
        };
        let backend = Arc::clone(&self.backend);
        let event_tx = self.event_tx.clone();
        let config = self.config;

        tokio::spawn(async move {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::debug!("Pump detached");
                }

                () = pump(backend, submission, config, event_tx) => {}
            }
        });
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(ProcessorStatus {
            state: self.state.clone(),
            queued: self.queue.contents(),
            waiting_for_backend: self.gate.is_some(),
        });
    }
}

/// Wait for the backend to accept submissions.
///
/// Running out of `ready_timeout` only logs and waits again; the queued items
/// stay buffered until the backend is ready or reports a permanent failure.
async fn wait_ready<B: Backend + ?Sized>(
    backend: &B,
    ready_timeout: Duration,
    conv_id: &str,
) -> Result<(), BackendError> {
    let mut waited = Duration::ZERO;
    loop {
        if let Ok(result) = tokio::time::timeout(ready_timeout, backend.ready()).await {
            return result;
        }
        waited += ready_timeout;
        tracing::warn!(
            conv_id = %conv_id,
            waited_secs = waited.as_secs(),
            state = ?backend.connection_state(),
            "Backend still not ready, keeping submissions queued"
        );
    }
}

/// Submit one item and forward its response stream as processor events.
///
/// Every wait is bounded by `submit_timeout`, so the processor always leaves
/// its busy phase.
async fn pump<B: Backend + ?Sized>(
    backend: Arc<B>,
    submission: Submission,
    config: RuntimeConfig,
    events: mpsc::UnboundedSender<Event>,
) {
    let message_id = submission.message_id.clone();
    let submission_conv = submission.conversation_id.clone();
    let failed = |error: BackendError| {
        tracing::warn!(
            conv_id = %submission_conv,
            message_id = %message_id,
            kind = ?error.kind,
            transient = error.kind.is_transient(),
            error = %error,
            "Submission failed"
        );
        Event::Failed {
            message_id: message_id.clone(),
            error,
        }
    };
    let timeout_secs = config.submit_timeout.as_secs_f64();

    let mut stream =
        match tokio::time::timeout(config.submit_timeout, backend.submit(submission)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = events.send(failed(e));
                return;
            }
            Err(_) => {
                let _ = events.send(failed(BackendError::timeout(format!(
                    "Backend did not accept the submission within {timeout_secs}s"
                ))));
                return;
            }
        };

    loop {
        let event = match tokio::time::timeout(config.submit_timeout, stream.next()).await {
            Ok(Some(Ok(StreamEvent::Chunk(delta)))) => Event::Chunk {
                message_id: message_id.clone(),
                delta,
            },
            Ok(Some(Ok(StreamEvent::Done))) => {
                let _ = events.send(Event::Done {
                    message_id: message_id.clone(),
                });
                return;
            }
            Ok(Some(Err(e))) => {
                let _ = events.send(failed(e));
                return;
            }
            Ok(None) => {
                let _ = events.send(failed(BackendError::protocol(
                    "Response ended without completion",
                )));
                return;
            }
            Err(_) => {
                let _ = events.send(failed(BackendError::timeout(format!(
                    "No response from backend within {timeout_secs}s"
                ))));
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}
