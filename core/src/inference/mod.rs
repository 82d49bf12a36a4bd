//! C4 — load the local LLM, expose `generate(prompt) -> token-stream`,
//! enforce a single-load lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone)]
pub struct Limits {
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub per_call_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_output_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            per_call_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_path: std::path::PathBuf,
}

/// Terminal sentinel closing a generation stream. Exactly one of these (or
/// none, if the channel is simply dropped on cancellation) ends the
/// sequence; no further `Token` follows.
#[derive(Debug, Clone)]
pub enum TokenEvent {
    Token(String),
    Done,
    Error(TerminalError),
}

#[derive(Debug, Clone)]
pub enum TerminalError {
    OutOfMemory,
    ContextOverflow { required: u32, window: u32 },
    Timeout,
}

/// Contract any local model runtime implements. The shipped adapter is a
/// deterministic simulator; swapping in a real GGUF-backed engine is a
/// substitution behind this trait, not a rewrite of the dispatcher or
/// orchestrator.
#[async_trait]
pub trait InferenceAdapter: Send + Sync {
    /// Idempotent: calling twice without an intervening `unload` is a no-op.
    async fn load(&self, config: ModelConfig) -> GatewayResult<()>;

    fn is_loaded(&self) -> bool;

    /// Produces a lazy, finite, non-restartable sequence of token fragments
    /// terminated by exactly one sentinel.
    async fn generate(
        &self,
        prompt: String,
        limits: Limits,
        cancel: CancellationToken,
    ) -> GatewayResult<mpsc::Receiver<TokenEvent>>;

    async fn unload(&self) -> GatewayResult<()>;
}

/// Deterministic, configurable simulator honoring every `InferenceAdapter`
/// contract (idempotent load, single-instance rule, cancellation, timeouts,
/// sentinel-terminated stream) so the dispatcher and orchestrator can be
/// exercised end-to-end without a real model artifact.
pub struct SimulatorAdapter {
    loaded: AtomicBool,
    token_delay: Duration,
}

impl SimulatorAdapter {
    pub fn new() -> Self {
        Self {
            loaded: AtomicBool::new(false),
            token_delay: Duration::from_millis(5),
        }
    }

    pub fn with_token_delay(token_delay: Duration) -> Self {
        Self {
            loaded: AtomicBool::new(false),
            token_delay,
        }
    }

    fn simulated_reply(prompt: &str) -> Vec<String> {
        let question = prompt
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string();
        format!("Jawaban simulasi untuk: {question}")
            .split_whitespace()
            .map(|w| format!("{w} "))
            .collect()
    }
}

impl Default for SimulatorAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceAdapter for SimulatorAdapter {
    async fn load(&self, _config: ModelConfig) -> GatewayResult<()> {
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn generate(
        &self,
        prompt: String,
        limits: Limits,
        cancel: CancellationToken,
    ) -> GatewayResult<mpsc::Receiver<TokenEvent>> {
        if !self.is_loaded() {
            return Err(GatewayError::ModelMissing);
        }

        let (tx, rx) = mpsc::channel(32);
        let delay = self.token_delay;

        tokio::spawn(async move {
            let words = Self::simulated_reply(&prompt);
            let budget = limits.max_output_tokens as usize;
            let emit = async {
                for word in words.into_iter().take(budget) {
                    tokio::time::sleep(delay).await;
                    if tx.send(TokenEvent::Token(word)).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(TokenEvent::Done).await;
            };

            tokio::select! {
                _ = emit => {}
                _ = cancel.cancelled() => {
                    // Receiver observes closure with no terminal event; the
                    // dispatcher emits `cancelled` itself at the protocol
                    // layer (§4.7), this stream just stops.
                }
                _ = tokio::time::sleep(limits.per_call_timeout) => {
                    let _ = tx.send(TokenEvent::Error(TerminalError::Timeout)).await;
                }
            }
        });

        Ok(rx)
    }

    async fn unload(&self) -> GatewayResult<()> {
        self.loaded.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_without_load_fails() {
        let adapter = SimulatorAdapter::new();
        let result = adapter
            .generate("halo".into(), Limits::default(), CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn load_is_idempotent() {
        let adapter = SimulatorAdapter::new();
        adapter.load(ModelConfig { model_path: "x".into() }).await.unwrap();
        adapter.load(ModelConfig { model_path: "x".into() }).await.unwrap();
        assert!(adapter.is_loaded());
    }

    #[tokio::test]
    async fn generate_terminates_with_done() {
        let adapter = SimulatorAdapter::with_token_delay(Duration::from_millis(1));
        adapter.load(ModelConfig { model_path: "x".into() }).await.unwrap();
        let mut rx = adapter
            .generate(
                "## Question\nApa itu variabel?".into(),
                Limits::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut saw_done = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, TokenEvent::Done) {
                saw_done = true;
                break;
            }
        }
        assert!(saw_done);
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream() {
        let adapter = SimulatorAdapter::with_token_delay(Duration::from_millis(50));
        adapter.load(ModelConfig { model_path: "x".into() }).await.unwrap();
        let cancel = CancellationToken::new();
        let mut rx = adapter
            .generate("pertanyaan panjang".into(), Limits::default(), cancel.clone())
            .await
            .unwrap();
        cancel.cancel();
        // Draining should terminate without ever observing `Done`.
        while let Some(event) = rx.recv().await {
            assert!(!matches!(event, TokenEvent::Done));
        }
    }

    #[tokio::test]
    async fn zero_max_output_tokens_yields_only_done() {
        let adapter = SimulatorAdapter::with_token_delay(Duration::from_millis(1));
        adapter.load(ModelConfig { model_path: "x".into() }).await.unwrap();
        let mut limits = Limits::default();
        limits.max_output_tokens = 0;
        let mut rx = adapter
            .generate("pertanyaan".into(), limits, CancellationToken::new())
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, TokenEvent::Done));
    }
}
