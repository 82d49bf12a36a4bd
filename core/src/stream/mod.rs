//! C7 — frames token sequences and control events into a server-pushed
//! channel, matching the coordination core's async-channel idiom for
//! streaming responses (`tokio::sync::mpsc`).

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone)]
pub struct SourceRef {
    pub book: String,
    pub ordinal: u32,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Position(i64),
    Typing(bool),
    Token(String),
    Sources(Vec<SourceRef>),
    Done,
    Error { kind: String, message: String },
    Cancelled,
}

#[derive(Debug, Default)]
struct EmitterState {
    typing_started: bool,
    typing_stopped: bool,
    sources_sent: bool,
    token_sent: bool,
    terminal_sent: bool,
}

/// Wraps an `mpsc::Sender<StreamEvent>` and enforces the framing contract:
/// one `typing=true` before the first token, one `typing=false` before the
/// terminal event, at most one `sources`, and exactly one of
/// `done | error | cancelled` after which the channel is closed.
pub struct StreamEmitter {
    tx: mpsc::Sender<StreamEvent>,
    state: Mutex<EmitterState>,
}

impl StreamEmitter {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            state: Mutex::new(EmitterState::default()),
        }
    }

    fn guard_not_terminal(&self) -> GatewayResult<()> {
        if self.state.lock().terminal_sent {
            return Err(GatewayError::Storage(
                "stream already closed by a terminal event".into(),
            ));
        }
        Ok(())
    }

    /// May repeat while queued; no ordering constraint relative to `typing`.
    pub async fn position(&self, pos: i64) -> GatewayResult<()> {
        self.guard_not_terminal()?;
        self.send(StreamEvent::Position(pos)).await
    }

    async fn ensure_typing_started(&self) -> GatewayResult<()> {
        let should_start = {
            let mut state = self.state.lock();
            if !state.typing_started {
                state.typing_started = true;
                true
            } else {
                false
            }
        };
        if should_start {
            self.send(StreamEvent::Typing(true)).await?;
        }
        Ok(())
    }

    pub async fn token(&self, fragment: String) -> GatewayResult<()> {
        self.guard_not_terminal()?;
        self.ensure_typing_started().await?;
        self.state.lock().token_sent = true;
        self.send(StreamEvent::Token(fragment)).await
    }

    /// Fires at most once, after all tokens, before the terminal event.
    pub async fn sources(&self, sources: Vec<SourceRef>) -> GatewayResult<()> {
        self.guard_not_terminal()?;
        {
            let mut state = self.state.lock();
            if state.sources_sent {
                return Err(GatewayError::Storage("sources already sent".into()));
            }
            state.sources_sent = true;
        }
        self.send(StreamEvent::Sources(sources)).await
    }

    async fn stop_typing(&self) -> GatewayResult<()> {
        self.ensure_typing_started().await?;
        let should_stop = {
            let mut state = self.state.lock();
            if !state.typing_stopped {
                state.typing_stopped = true;
                true
            } else {
                false
            }
        };
        if should_stop {
            self.send(StreamEvent::Typing(false)).await?;
        }
        Ok(())
    }

    async fn finish(&self, event: StreamEvent) -> GatewayResult<()> {
        self.guard_not_terminal()?;
        self.stop_typing().await?;
        self.state.lock().terminal_sent = true;
        self.send(event).await
    }

    pub async fn done(&self) -> GatewayResult<()> {
        self.finish(StreamEvent::Done).await
    }

    pub async fn error(&self, kind: impl Into<String>, message: impl Into<String>) -> GatewayResult<()> {
        self.finish(StreamEvent::Error {
            kind: kind.into(),
            message: message.into(),
        })
        .await
    }

    pub async fn cancelled(&self) -> GatewayResult<()> {
        self.finish(StreamEvent::Cancelled).await
    }

    async fn send(&self, event: StreamEvent) -> GatewayResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| GatewayError::Storage("stream receiver dropped".into()))
    }
}
