//! Property-based tests for the processor state machine
//!
//! A small model executor applies effects the way the runtime does, so the
//! properties cover the transcript the machine produces, not just its states.

use super::transition::*;
use super::*;
use crate::error::BackendError;
use crate::queue::{OutgoingItem, OutgoingQueue};
use proptest::prelude::*;
use std::collections::HashMap;

// ============================================================================
// Model executor
// ============================================================================

#[derive(Debug, Clone)]
struct ModelMessage {
    id: String,
    streaming: bool,
    content: String,
}

#[derive(Default)]
struct Model {
    state: ProcessorState,
    queue: OutgoingQueue,
    transcript: Vec<ModelMessage>,
    dispatched: Vec<String>,
    next_id: usize,
    seals: HashMap<String, usize>,
}

impl Model {
    fn mint(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn begin_next(&mut self) -> Option<Event> {
        if self.state.is_busy() {
            return None;
        }
        let item = self.queue.dequeue()?;
        Some(Event::Begin {
            item,
            user_message_id: self.mint("u"),
            assistant_message_id: self.mint("a"),
        })
    }

    fn apply(&mut self, event: Event) {
        let mut pending = vec![event];
        while let Some(event) = pending.pop() {
            let result = transition(&self.state, event).expect("model only begins when idle");
            self.state = result.new_state;
            for effect in result.effects {
                if let Some(generated) = self.execute(effect) {
                    pending.push(generated);
                }
            }
        }
    }

    fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::AppendUserMessage {
                message_id,
                content,
                ..
            } => {
                self.transcript.push(ModelMessage {
                    id: message_id,
                    streaming: false,
                    content,
                });
                None
            }
            Effect::CreatePlaceholder { message_id } => {
                self.transcript.push(ModelMessage {
                    id: message_id,
                    streaming: true,
                    content: String::new(),
                });
                None
            }
            Effect::Dispatch { item, .. } => {
                self.dispatched.push(item.content);
                None
            }
            Effect::AppendChunk { message_id, delta } => {
                let msg = self
                    .transcript
                    .iter_mut()
                    .find(|m| m.id == message_id)
                    .expect("chunk target exists");
                assert!(msg.streaming, "chunk applied to sealed message");
                msg.content.push_str(&delta);
                None
            }
            Effect::Seal { message_id, error } => {
                *self.seals.entry(message_id.clone()).or_default() += 1;
                if let Some(msg) = self.transcript.iter_mut().find(|m| m.id == message_id) {
                    if let Some(error) = error {
                        msg.content.push_str(&error);
                    }
                    msg.streaming = false;
                }
                Some(Event::Sealed { message_id })
            }
            Effect::ProcessNext => self.begin_next(),
            Effect::NotifyStatus => None,
        }
    }

    fn streaming_count(&self) -> usize {
        self.transcript.iter().filter(|m| m.streaming).count()
    }
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Debug, Clone)]
enum Action {
    Enqueue(String),
    Chunk(String),
    StaleChunk(String),
    Done,
    Fail(String),
    Reset,
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => "[a-zA-Z]{1,8}".prop_map(Action::Enqueue),
        4 => "[a-z ]{1,5}".prop_map(Action::Chunk),
        1 => "[a-z]{1,5}".prop_map(Action::StaleChunk),
        2 => Just(Action::Done),
        1 => "[a-z]{1,10}".prop_map(Action::Fail),
        1 => Just(Action::Reset),
    ]
}

fn in_flight(model: &Model) -> Option<String> {
    model.state.in_flight().map(str::to_string)
}

fn step(model: &mut Model, action: Action) {
    match action {
        Action::Enqueue(text) => {
            model.queue.enqueue(OutgoingItem::new(text, None));
            if let Some(begin) = model.begin_next() {
                model.apply(begin);
            }
        }
        Action::Chunk(delta) => {
            if let Some(message_id) = in_flight(model) {
                model.apply(Event::Chunk { message_id, delta });
            }
        }
        Action::StaleChunk(delta) => model.apply(Event::Chunk {
            message_id: "gone".to_string(),
            delta,
        }),
        Action::Done => {
            if let Some(message_id) = in_flight(model) {
                model.apply(Event::Done { message_id });
            }
        }
        Action::Fail(reason) => {
            if let Some(message_id) = in_flight(model) {
                model.apply(Event::Failed {
                    message_id,
                    error: BackendError::server(reason),
                });
            }
        }
        Action::Reset => {
            model.queue.clear();
            model.apply(Event::Reset);
            // The runtime clears the transcript along with the reset
            model.transcript.clear();
        }
    }
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // At most one streaming message per conversation at any time
    #[test]
    fn prop_single_streaming_message(actions in proptest::collection::vec(arb_action(), 0..60)) {
        let mut model = Model::default();
        for action in actions {
            step(&mut model, action);
            prop_assert!(model.streaming_count() <= 1, "transcript: {:?}", model.transcript);
        }
    }

    // Sealed messages never change and are sealed exactly once
    #[test]
    fn prop_sealed_messages_are_frozen(actions in proptest::collection::vec(arb_action(), 0..60)) {
        let mut model = Model::default();
        let mut frozen: HashMap<String, String> = HashMap::new();
        for action in actions {
            step(&mut model, action);
            for msg in model.transcript.iter().filter(|m| !m.streaming) {
                let previous = frozen.entry(msg.id.clone()).or_insert_with(|| msg.content.clone());
                prop_assert_eq!(&*previous, &msg.content);
            }
            prop_assert!(model.seals.values().all(|&n| n == 1), "seals: {:?}", model.seals);
        }
    }

    // Dispatch order equals enqueue order when nothing is cleared
    #[test]
    fn prop_dispatch_preserves_enqueue_order(
        texts in proptest::collection::vec("[a-z]{1,6}", 1..8),
        chunks in proptest::collection::vec("[a-z]{1,4}", 0..4),
    ) {
        let mut model = Model::default();
        for text in &texts {
            step(&mut model, Action::Enqueue(text.clone()));
        }
        // Exactly one dispatched while the first is in flight
        prop_assert_eq!(model.dispatched.len(), 1);
        prop_assert_eq!(model.queue.len(), texts.len() - 1);

        for _ in 0..texts.len() {
            for c in &chunks {
                step(&mut model, Action::Chunk(c.clone()));
            }
            step(&mut model, Action::Done);
        }
        prop_assert_eq!(&model.dispatched, &texts);
        prop_assert_eq!(model.state, ProcessorState::Idle);
        prop_assert!(model.queue.is_empty());
    }

    // Concatenating chunks yields the final content
    #[test]
    fn prop_chunks_concatenate(chunks in proptest::collection::vec("[a-zA-Z0-9 ]{0,6}", 0..20)) {
        let mut model = Model::default();
        step(&mut model, Action::Enqueue("q".to_string()));
        for c in &chunks {
            step(&mut model, Action::Chunk(c.clone()));
        }
        step(&mut model, Action::Done);

        let answer = &model.transcript[1];
        prop_assert!(!answer.streaming);
        prop_assert_eq!(&answer.content, &chunks.concat());
    }

    // Every busy state has a way out via failure
    #[test]
    fn prop_failure_always_leaves_busy(chunks in 0usize..5, reason in "[a-z]{1,10}") {
        let mut model = Model::default();
        step(&mut model, Action::Enqueue("q".to_string()));
        for _ in 0..chunks {
            step(&mut model, Action::Chunk("x".to_string()));
        }
        step(&mut model, Action::Fail(reason.clone()));
        prop_assert_eq!(model.state, ProcessorState::Idle);
        prop_assert!(model.transcript[1].content.ends_with(&reason));
    }

    // Stream events never apply outside their message
    #[test]
    fn prop_stale_events_are_noops(
        actions in proptest::collection::vec(arb_action(), 0..30),
        delta in "[a-z]{1,5}",
    ) {
        let mut model = Model::default();
        for action in actions {
            step(&mut model, action);
        }
        let before_state = model.state.clone();
        let before: Vec<String> = model.transcript.iter().map(|m| m.content.clone()).collect();
        let stale = Event::Chunk {
            message_id: "never-issued".to_string(),
            delta,
        };
        let result = transition(&model.state, stale).unwrap();
        prop_assert_eq!(&result.new_state, &before_state);
        prop_assert!(result.effects.is_empty());
        let after: Vec<String> = model.transcript.iter().map(|m| m.content.clone()).collect();
        prop_assert_eq!(before, after);
    }
}
