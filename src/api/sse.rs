//! Server-Sent Events support
//!
//! One `init` event with the transcript at subscription time, then a
//! `transcript` event with the full message list after every mutation.

use crate::transcript::{Subscription, TranscriptUpdate};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;

/// Convert a transcript subscription to an SSE stream.
///
/// The stream owns the subscription; a disconnected client unsubscribes.
pub fn sse_stream(
    subscription: Subscription,
    updates: mpsc::UnboundedReceiver<TranscriptUpdate>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = futures::stream::unfold(
        (updates, subscription, true),
        |(mut updates, subscription, first)| async move {
            let update = updates.recv().await?;
            let event_type = if first { "init" } else { "transcript" };
            Some((
                Ok(transcript_event(event_type, &update)),
                (updates, subscription, false),
            ))
        },
    );

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn transcript_event(event_type: &str, update: &TranscriptUpdate) -> Event {
    let data = json!({
        "type": event_type,
        "conversation_id": update.conversation_id,
        "messages": update.messages,
    });
    Event::default().event(event_type).data(data.to_string())
}
