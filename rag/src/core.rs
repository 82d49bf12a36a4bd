//! Core types and traits for context assembly.
//!
//! `RetrievedChunk` is the shape the Vector Store Gateway hands to ranking;
//! `EmbeddingService` is the external embedding provider contract consumed
//! by the RAG Orchestrator (one query embedding per request, computed before
//! the Vector Store Gateway is searched).

use serde::{Deserialize, Serialize};

/// A chunk as returned from similarity search, before ranking/fitting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub text: String,
    pub book_id: String,
    pub book_title: String,
    pub ordinal: u32,
    pub token_count: u32,
    /// Cosine similarity score against the query embedding, higher is better.
    pub score: f32,
    /// True if this chunk's subject matches the request's subject filter.
    pub subject_match: bool,
}

/// Errors produced by the context assembly pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("unknown instructional language: {0}")]
    UnknownLanguage(String),

    #[error("template rendering failed: {0}")]
    Template(String),

    #[error("embedding provider failed: {0}")]
    Embedding(String),
}

pub type RagResult<T> = Result<T, RagError>;

/// External embedding provider contract (§6). Implementations may call a
/// local or remote model; the core never assumes a specific dimension
/// beyond it matching the vector store's.
#[async_trait::async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed a single piece of text (typically a user question).
    async fn embed(&self, text: &str) -> RagResult<Vec<f32>>;

    /// Dimensionality of vectors this service produces.
    fn dimensions(&self) -> usize;

    /// Name of the embedding model, for logging/telemetry (never the text).
    fn model_name(&self) -> &str;
}
