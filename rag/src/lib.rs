//! # sekolah-rag
//!
//! Context assembly for the sekolah school-edge inference gateway.
//!
//! Three pure operations — `rank`, `fit`, `render` — turn a list of
//! similarity-scored chunks into the prompt text handed to the inference
//! adapter. None of them touch the network, a clock, or a database; the
//! orchestrator crate (`sekolah-core`) wires retrieval and generation
//! around them.

pub mod core;
pub mod fit;
pub mod rank;
pub mod render;

pub use crate::core::{EmbeddingService, RagError, RagResult, RetrievedChunk};
pub use fit::{fit as fit_chunks, FitOutcome, DEFAULT_BUDGET_FLOOR_TOKENS};
pub use rank::rank as rank_chunks;
pub use render::{Language, PromptRenderer, RenderedPrompt};
