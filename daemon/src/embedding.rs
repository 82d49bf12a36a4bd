//! A deterministic, offline stand-in for the embedding provider external
//! collaborator (§6). Hashes overlapping word shingles into a fixed-width
//! vector so that questions sharing vocabulary score similarly under cosine
//! distance — good enough to exercise retrieval end-to-end without a real
//! embedding model, which is explicitly out of scope for the core.

use sekolah_rag::{EmbeddingService, RagError, RagResult};

pub struct HashEmbeddingService {
    dimensions: usize,
}

impl HashEmbeddingService {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait::async_trait]
impl EmbeddingService for HashEmbeddingService {
    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RagError::Embedding("empty input".to_string()));
        }
        let mut vector = vec![0f32; self.dimensions];
        for word in text.to_lowercase().split_whitespace() {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::hash::Hash::hash(&word, &mut hasher);
            let bucket = (std::hash::Hasher::finish(&hasher) as usize) % self.dimensions;
            vector[bucket] += 1.0;
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "hash-shingle-v1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_vocabulary_yields_overlapping_vectors() {
        let service = HashEmbeddingService::new(64);
        let a = service.embed("apa itu variabel").await.unwrap();
        let b = service.embed("variabel itu apa").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let service = HashEmbeddingService::new(64);
        assert!(service.embed("   ").await.is_err());
    }
}
