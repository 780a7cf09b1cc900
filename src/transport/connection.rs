//! WebSocket connection with automatic reconnect

use super::wire::{ClientFrame, ServerFrame};
use super::ReconnectPolicy;
use crate::error::TransportError;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Writer for the current socket, tagged with its session number
type Writer = (u64, mpsc::UnboundedSender<String>);

/// Observable connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Dialing; `attempt` is 0 for the first connect
    Connecting { attempt: u32 },
    Open,
    /// Waiting `delay_ms` before reconnect attempt `attempt`
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Not started, shut down, or out of attempts
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

/// The process-wide duplex channel to the backend.
///
/// `send` only succeeds while the connection is open; it never buffers.
/// Buffering is the outgoing queue's job.
pub struct TransportConnection {
    url: String,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: broadcast::Sender<ServerFrame>,
    /// Set before the state becomes `Open`, cleared before it leaves `Open`
    writer: Mutex<Option<Writer>>,
    /// Number of sessions opened so far; the current one while open
    sessions: AtomicU64,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl TransportConnection {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        Arc::new(Self {
            url: url.into(),
            policy,
            state_tx,
            inbound_tx,
            writer: Mutex::new(None),
            sessions: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Start the connection supervisor. Calling it again is a no-op.
    pub fn connect(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Connecting { attempt: 0 });
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.supervise().await;
        });
    }

    /// Queue a frame on the open socket. Returns the session it went out on.
    pub fn send(&self, frame: &ClientFrame) -> Result<u64, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let payload = serde_json::to_string(frame)?;
        let writer = self.writer();
        let (session, tx) = writer.as_ref().ok_or(TransportError::NotOpen)?;
        tx.send(payload)
            .map_err(|_| TransportError::Send("connection writer is gone".to_string()))?;
        Ok(*session)
    }

    /// The most recently opened session. A frame sent on an older session
    /// will never be answered.
    pub fn session(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Receiver for every frame the backend sends
    pub fn on_message(&self) -> broadcast::Receiver<ServerFrame> {
        self.inbound_tx.subscribe()
    }

    /// Receiver for connection state transitions
    pub fn on_state_change(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Wait until the connection is open. Fails once it is closed for good.
    pub async fn wait_open(&self) -> Result<(), TransportError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Closed if self.shutdown.is_cancelled() => {
                    return Err(TransportError::Closed)
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Close the socket and stop reconnecting
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn writer(&self) -> MutexGuard<'_, Option<Writer>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::debug!(url = %self.url, state = ?state, "Transport state");
        self.state_tx.send_replace(state);
    }

    async fn supervise(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting { attempt });
            tracing::info!(url = %self.url, attempt, "Connecting transport");

            let connected = tokio::select! {
                () = self.shutdown.cancelled() => break,
                result = connect_async(self.url.as_str()) => result,
            };

            match connected {
                Ok((socket, _)) => {
                    attempt = 0;
                    self.run_session(socket).await;
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    tracing::warn!(url = %self.url, "Transport dropped");
                }
                Err(e) => {
                    let e = TransportError::Connect(e.to_string());
                    tracing::warn!(
                        url = %self.url,
                        attempt,
                        error = %e,
                        "Transport connect failed"
                    );
                }
            }

            attempt = attempt.saturating_add(1);
            if !self.policy.allows(attempt) {
                tracing::error!(
                    url = %self.url,
                    attempts = attempt - 1,
                    "Reconnect attempts exhausted"
                );
                break;
            }
            let delay = self.policy.delay_for(attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            self.set_state(ConnectionState::Reconnecting { attempt, delay_ms });
            tracing::info!(url = %self.url, attempt, delay_ms, "Scheduling reconnect");

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        // Out of attempts counts as shut down
        self.shutdown.cancel();
        self.writer().take();
        self.set_state(ConnectionState::Closed);
        tracing::info!(url = %self.url, "Transport closed");
    }

    /// Pump one connected socket until it drops or shutdown is requested
    async fn run_session(&self, socket: Socket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer() = Some((session, tx));
        self.set_state(ConnectionState::Open);
        tracing::info!(url = %self.url, session, "Transport open");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(payload) = rx.recv() => {
                    if let Err(e) = sink.send(Message::Text(payload.into())).await {
                        tracing::warn!(url = %self.url, error = %e, "Transport send failed");
                        break;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(url = %self.url, error = %e, "Transport read failed");
                        break;
                    }
                },
            }
        }

        self.writer().take();
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => {
                // No listeners is fine
                let _ = self.inbound_tx.send(frame);
            }
            Err(e) => tracing::warn!(url = %self.url, error = %e, "Malformed frame from backend"),
        }
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
