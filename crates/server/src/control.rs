use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use shared::{error::ProtocolError, protocol::ClientMessage, protocol::Instruction};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn, Instrument, Span};

/// Lifetime of the single-shot control listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    SessionActive,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("control listener is {current:?}; cannot start a session")]
pub struct SessionRejected {
    pub current: ListenerState,
}

#[derive(Debug)]
pub struct ListenerLifecycle {
    state: ListenerState,
}

impl Default for ListenerLifecycle {
    fn default() -> Self {
        Self {
            state: ListenerState::Listening,
        }
    }
}

impl ListenerLifecycle {
    #[cfg(test)]
    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// `Listening → SessionActive`. Only the first viewer gets a session.
    pub fn begin_session(&mut self) -> Result<(), SessionRejected> {
        match self.state {
            ListenerState::Listening => {
                self.state = ListenerState::SessionActive;
                Ok(())
            }
            current => Err(SessionRejected { current }),
        }
    }

    /// Moves to `Closed` from any state and returns the previous one.
    pub fn close(&mut self) -> ListenerState {
        std::mem::replace(&mut self.state, ListenerState::Closed)
    }
}

/// How a control session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Acknowledged,
    ClientDisconnected,
    TimedOut,
    Aborted(String),
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acknowledged => f.write_str("acknowledged"),
            Self::ClientDisconnected => f.write_str("client disconnected"),
            Self::TimedOut => f.write_str("timed out waiting for acknowledgment"),
            Self::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

/// What a session sends and what it requires before sending it.
#[derive(Debug, Clone, Default)]
pub struct SessionPlan {
    pub instructions: Vec<Instruction>,
    /// In file mode, the served file must still exist when the viewer
    /// connects or the session is aborted without sending anything.
    pub served_file: Option<PathBuf>,
    /// `None` waits for the acknowledgment indefinitely.
    pub ack_timeout: Option<Duration>,
}

#[derive(Clone)]
struct ControlState {
    plan: Arc<SessionPlan>,
    lifecycle: Arc<Mutex<ListenerLifecycle>>,
    done: Arc<Mutex<Option<oneshot::Sender<SessionOutcome>>>>,
    span: Span,
}

impl ControlState {
    fn lifecycle(&self) -> MutexGuard<'_, ListenerLifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, outcome: SessionOutcome) {
        self.lifecycle().close();
        let done = self
            .done
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(done) = done {
            let _ = done.send(outcome);
        }
    }
}

/// WebSocket endpoint that hands one viewer its instructions and waits for
/// the acknowledgment.
pub struct ControlChannelServer {
    state: ControlState,
}

impl ControlChannelServer {
    pub fn new(plan: SessionPlan, span: Span) -> (Self, oneshot::Receiver<SessionOutcome>) {
        let (done, outcome) = oneshot::channel();
        let server = Self {
            state: ControlState {
                plan: Arc::new(plan),
                lifecycle: Arc::new(Mutex::new(ListenerLifecycle::default())),
                done: Arc::new(Mutex::new(Some(done))),
                span,
            },
        };
        (server, outcome)
    }

    #[cfg(test)]
    pub fn listener_state(&self) -> ListenerState {
        self.state.lifecycle().state()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .with_state(self.state.clone())
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ControlState>) -> Response {
    let begun = state.lifecycle().begin_session();
    if let Err(rejected) = begun {
        let _entered = state.span.enter();
        warn!(%rejected, "refusing additional viewer connection");
        return (StatusCode::CONFLICT, "viewer session already in progress").into_response();
    }

    let failed = state.clone();
    ws.on_failed_upgrade(move |error| {
        let _entered = failed.span.enter();
        warn!(%error, "viewer websocket upgrade failed");
        failed.finish(SessionOutcome::ClientDisconnected);
    })
    .on_upgrade(move |socket| control_connection(state, socket))
}

async fn control_connection(state: ControlState, socket: WebSocket) {
    let span = state.span.clone();
    async move {
        info!("viewer connected");
        let (sink, stream) = socket.split();
        let outcome = run_session(&state.plan, sink, stream).await;
        info!(%outcome, "control session finished");
        state.finish(outcome);
    }
    .instrument(span)
    .await
}

/// Drives one session over an already-established connection: sends the
/// planned instructions, then consumes frames until an acknowledgment, a
/// disconnect, or the optional timeout.
pub async fn run_session<Tx, Rx>(plan: &SessionPlan, mut sink: Tx, mut stream: Rx) -> SessionOutcome
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: fmt::Display,
    Rx: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    if let Some(path) = &plan.served_file {
        if let Err(error) = tokio::fs::metadata(path).await {
            warn!(file = %path.display(), %error, "served file unavailable; closing viewer connection");
            let _ = sink.send(Message::Close(None)).await;
            return SessionOutcome::Aborted(format!("{} is unavailable: {error}", path.display()));
        }
    }

    for instruction in &plan.instructions {
        let text = match serde_json::to_string(instruction) {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, "failed to encode instruction");
                let _ = sink.send(Message::Close(None)).await;
                return SessionOutcome::Aborted(error.to_string());
            }
        };
        if let Err(error) = sink.send(Message::Text(text)).await {
            warn!(%error, kind = instruction.kind(), "failed to send instruction");
            return SessionOutcome::ClientDisconnected;
        }
        debug!(kind = instruction.kind(), "instruction sent; waiting for acknowledgment");
    }

    let outcome = match plan.ack_timeout {
        Some(limit) => tokio::time::timeout(limit, await_ack(&mut stream))
            .await
            .unwrap_or_else(|_| {
                warn!(?limit, "no acknowledgment before timeout");
                SessionOutcome::TimedOut
            }),
        None => await_ack(&mut stream).await,
    };

    if outcome != SessionOutcome::ClientDisconnected {
        let _ = sink.send(Message::Close(None)).await;
    }
    let _ = sink.close().await;
    outcome
}

async fn await_ack<Rx>(stream: &mut Rx) -> SessionOutcome
where
    Rx: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match ClientMessage::expect_ack(&text) {
                Ok(_) => {
                    debug!("received acknowledgment from viewer");
                    return SessionOutcome::Acknowledged;
                }
                Err(ProtocolError::InvalidJson(error)) => {
                    warn!(%error, "received invalid JSON from viewer");
                }
                Err(ProtocolError::UnexpectedType(message_type)) => {
                    warn!(
                        message_type = message_type.as_deref().unwrap_or("<missing>"),
                        "received unexpected message type"
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => debug!("ignoring non-text frame"),
            Err(error) => {
                warn!(%error, "control connection failed");
                break;
            }
        }
    }
    info!("viewer disconnected before acknowledging");
    SessionOutcome::ClientDisconnected
}

#[cfg(test)]
#[path = "tests/control_tests.rs"]
mod tests;
