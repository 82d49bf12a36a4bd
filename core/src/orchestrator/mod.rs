//! C6 — binds the vector store, context assembler, and inference adapter;
//! owns the per-request state machine from intake to final token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sekolah_rag::{fit_chunks, rank_chunks, EmbeddingService, Language, PromptRenderer, RetrievedChunk};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayResult;
use crate::inference::{InferenceAdapter, Limits, ModelConfig, TerminalError, TokenEvent};
use crate::metadata::{ChatEntry, SharedMetadataStore};
use crate::stream::{SourceRef, StreamEmitter};
use crate::telemetry::TelemetryAggregator;
use crate::vector::VectorStoreGateway;

pub struct OrchestratorConfig {
    pub top_k: usize,
    pub budget_tokens: u32,
    pub floor_tokens: u32,
    pub language: Language,
    pub limits: Limits,
}

pub struct Orchestrator {
    metadata: SharedMetadataStore,
    vector: Arc<dyn VectorStoreGateway>,
    embedding: Arc<dyn EmbeddingService>,
    inference: Arc<dyn InferenceAdapter>,
    renderer: Arc<PromptRenderer>,
    telemetry: Arc<TelemetryAggregator>,
    config: OrchestratorConfig,
}

pub struct ChatRequest {
    pub user_id: uuid::Uuid,
    pub subject: Option<(String, u8)>,
    pub subject_id: Option<uuid::Uuid>,
    pub question: String,
}

impl Orchestrator {
    pub fn new(
        metadata: SharedMetadataStore,
        vector: Arc<dyn VectorStoreGateway>,
        embedding: Arc<dyn EmbeddingService>,
        inference: Arc<dyn InferenceAdapter>,
        renderer: Arc<PromptRenderer>,
        telemetry: Arc<TelemetryAggregator>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            metadata,
            vector,
            embedding,
            inference,
            renderer,
            telemetry,
            config,
        }
    }

    /// Runs one request end-to-end: retrieval -> assembly -> generate ->
    /// persist, strictly in that order. Errors at the retrieval stage take
    /// the fallback branch rather than aborting — only a C4 failure or a
    /// persistence failure is reported as a partial/spilled outcome.
    pub async fn handle(
        &self,
        request: ChatRequest,
        emitter: &StreamEmitter,
        cancel: CancellationToken,
    ) -> GatewayResult<()> {
        let start = Instant::now();

        let embedding = self.embedding.embed(&request.question).await.ok();
        let chunks: Vec<RetrievedChunk> = match (&embedding, &request.subject) {
            (Some(vector), Some((code, grade))) => {
                match self
                    .vector
                    .search(vector, Some((code.as_str(), *grade)), self.config.top_k)
                    .await
                {
                    Ok(hits) => hits
                        .into_iter()
                        .map(|h| RetrievedChunk {
                            chunk_id: h.chunk_id,
                            text: h.text,
                            book_id: h.book_id.to_string(),
                            book_title: h.book_title,
                            ordinal: h.ordinal,
                            token_count: h.token_count,
                            score: h.score,
                            subject_match: true,
                        })
                        .collect(),
                    Err(e) => {
                        log::warn!("vector store unavailable, falling back: {e}");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        let ranked = rank_chunks(chunks, &request.question);
        let outcome = fit_chunks(&ranked, self.config.budget_tokens, self.config.floor_tokens);
        let rendered = self
            .renderer
            .render(&outcome.selected, &request.question, self.config.language)
            .map_err(|e| crate::error::GatewayError::Storage(e.to_string()))?;

        let confidence: f32 = if rendered.is_fallback {
            0.0
        } else {
            outcome
                .selected
                .first()
                .map(|c| c.score.clamp(0.0, 1.0))
                .unwrap_or(0.0)
        };

        let mut accumulated = String::new();
        let mut partial = false;
        let mut error_kind: Option<&'static str> = None;

        let mut rx = self
            .inference
            .generate(rendered.text, self.config.limits.clone(), cancel.clone())
            .await?;

        while let Some(event) = rx.recv().await {
            match event {
                TokenEvent::Token(fragment) => {
                    accumulated.push_str(&fragment);
                    if emitter.token(fragment).await.is_err() {
                        break;
                    }
                }
                TokenEvent::Done => {
                    if !rendered.is_fallback {
                        let sources = outcome
                            .selected
                            .iter()
                            .map(|c| SourceRef {
                                book: c.book_title.clone(),
                                ordinal: c.ordinal,
                                score: c.score,
                            })
                            .collect();
                        let _ = emitter.sources(sources).await;
                    }
                    let _ = emitter.done().await;
                    break;
                }
                TokenEvent::Error(terminal) => {
                    partial = true;
                    error_kind = Some(match terminal {
                        TerminalError::OutOfMemory => "OutOfMemory",
                        TerminalError::ContextOverflow { .. } => "ContextOverflow",
                        TerminalError::Timeout => "Timeout",
                    });
                    let _ = emitter.error(error_kind.unwrap_or("Unknown"), "generation failed").await;
                    break;
                }
            }
        }

        if cancel.is_cancelled() {
            let _ = emitter.cancelled().await;
        } else {
            let entry = ChatEntry {
                id: uuid::Uuid::new_v4(),
                user_id: request.user_id,
                subject_id: request.subject_id,
                question: request.question,
                response: accumulated,
                confidence,
                created_at: chrono::Utc::now(),
                partial,
            };
            if let Err(e) = self.metadata.append_chat_entry(entry).await {
                log::error!("persistence failure for chat entry, spilled: {e}");
            }
        }

        self.telemetry.record_query(start.elapsed().max(Duration::ZERO), error_kind);
        Ok(())
    }

    pub async fn ensure_model_loaded(&self, model: ModelConfig) -> GatewayResult<()> {
        self.inference.load(model).await
    }
}
