//! Streaming backend over the shared transport connection
//!
//! Frames from the socket are routed to the stream of the message they are
//! addressed to. When the connection leaves `open`, or a new socket replaces
//! the one a submission went out on, the affected streams fail immediately:
//! the backend will never finish those responses on a new socket.

use super::{Backend, Submission};
use crate::assembler::{ChunkStream, StreamEvent};
use crate::error::BackendError;
use crate::transport::{ClientFrame, ConnectionState, ServerFrame, TransportConnection};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

type Sink = mpsc::UnboundedSender<Result<StreamEvent, BackendError>>;

struct Route {
    /// Transport session the submission went out on; unset until sent
    session: Option<u64>,
    sink: Sink,
}

#[derive(Default)]
struct Routes {
    sinks: Mutex<HashMap<String, Route>>,
}

impl Routes {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Route>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, frame: ServerFrame) {
        let mut sinks = self.lock();
        let Some(Route { sink, .. }) = sinks.get(frame.message_id()) else {
            tracing::debug!(
                conv_id = %frame.conversation_id(),
                message_id = %frame.message_id(),
                "Frame for unknown message"
            );
            return;
        };
        match frame {
            ServerFrame::Chunk {
                message_id, chunk, ..
            } => {
                if sink.send(Ok(StreamEvent::Chunk(chunk))).is_err() {
                    // Consumer went away (conversation cleared)
                    sinks.remove(&message_id);
                }
            }
            ServerFrame::Done { message_id, .. } => {
                let _ = sink.send(Ok(StreamEvent::Done));
                sinks.remove(&message_id);
            }
            ServerFrame::Error {
                message_id,
                message,
                ..
            } => {
                let _ = sink.send(Err(BackendError::rejected(message)));
                sinks.remove(&message_id);
            }
        }
    }

    fn fail_all(&self, error: &BackendError) {
        let drained: Vec<Sink> = self.lock().drain().map(|(_, route)| route.sink).collect();
        fail(drained, error);
    }

    /// Fail streams sent on any session other than the current one.
    /// `current` is read under the routes lock.
    fn fail_stale(&self, current: impl FnOnce() -> u64, error: &BackendError) {
        let mut stale = Vec::new();
        {
            let mut routes = self.lock();
            let current = current();
            routes.retain(|_, route| {
                let keep = route.session.map_or(true, |session| session == current);
                if !keep {
                    stale.push(route.sink.clone());
                }
                keep
            });
        }
        fail(stale, error);
    }

    fn on_state_change(&self, state: &ConnectionState, current: impl FnOnce() -> u64) {
        let lost = BackendError::transport("Connection lost");
        if state.is_open() {
            // A drop and reconnect can coalesce into a single `Open`
            self.fail_stale(current, &lost);
        } else {
            self.fail_all(&lost);
        }
    }
}

fn fail(sinks: Vec<Sink>, error: &BackendError) {
    if !sinks.is_empty() {
        tracing::warn!(count = sinks.len(), error = %error, "Failing in-flight streams");
    }
    for sink in sinks {
        let _ = sink.send(Err(error.clone()));
    }
}

pub struct SocketBackend {
    transport: Arc<TransportConnection>,
    routes: Arc<Routes>,
    stop: CancellationToken,
}

impl SocketBackend {
    /// Start routing frames from `transport`. Must be called inside a runtime.
    pub fn spawn(transport: Arc<TransportConnection>) -> Self {
        let routes = Arc::new(Routes::default());
        let stop = CancellationToken::new();

        tokio::spawn(route_frames(
            Arc::clone(&transport),
            Arc::clone(&routes),
            stop.clone(),
        ));

        Self {
            transport,
            routes,
            stop,
        }
    }
}

impl Drop for SocketBackend {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn route_frames(
    transport: Arc<TransportConnection>,
    routes: Arc<Routes>,
    stop: CancellationToken,
) {
    let mut frames = transport.on_message();
    let mut states = transport.on_state_change();
    loop {
        // Frames first: a chunk read before a drop must land before the failure
        tokio::select! {
            biased;

            () = stop.cancelled() => break,
            frame = frames.recv() => match frame {
                Ok(frame) => routes.deliver(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Lost chunks cannot be recovered; the affected responses are broken
                    tracing::warn!(skipped, "Frame router lagged");
                    routes.fail_all(&BackendError::protocol(format!("Lost {skipped} frames")));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                routes.on_state_change(&state, || transport.session());
            }
        }
    }
    routes.fail_all(&BackendError::transport("Socket backend stopped"));
}

#[async_trait]
impl Backend for SocketBackend {
    async fn ready(&self) -> Result<(), BackendError> {
        self.transport.wait_open().await.map_err(BackendError::from)
    }

    async fn submit(&self, submission: Submission) -> Result<ChunkStream, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Route before sending so no early chunk is missed
        self.routes.lock().insert(
            submission.message_id.clone(),
            Route {
                session: None,
                sink: tx,
            },
        );

        let frame = ClientFrame::Submit {
            conversation_id: submission.conversation_id,
            message_id: submission.message_id.clone(),
            content: submission.content,
            attachment: submission.attachment,
        };
        let session = match self.transport.send(&frame) {
            Ok(session) => session,
            Err(e) => {
                self.routes.lock().remove(&submission.message_id);
                return Err(e.into());
            }
        };

        {
            let mut routes = self.routes.lock();
            if self.transport.session() != session {
                // Socket replaced before the route was tagged
                routes.remove(&submission.message_id);
                return Err(BackendError::transport("Connection lost"));
            }
            if let Some(route) = routes.get_mut(&submission.message_id) {
                route.session = Some(session);
            }
        }

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    fn name(&self) -> &str {
        "socket"
    }
}
