//! C2 — facade over an external similarity index.

pub mod chunk;
pub mod store;

pub use chunk::{cosine_similarity, Chunk, SearchHit};
pub use store::{Collection, InMemoryVectorStore, VectorStoreGateway};
