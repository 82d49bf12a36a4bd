//! Facade over an external similarity index: add/query/prune under a
//! single-writer discipline.
//!
//! Adapted from the concurrent-map-plus-canonical-order facade the
//! coordination core uses for its shared mutable state: a `DashMap` keyed
//! collection table, an atomic active pointer per key, and install/prune
//! operations that mutate a staged copy before swapping it in — never a
//! live one. Readers retrieved via `search` observe a consistent
//! snapshot because they are handed an `Arc` clone of the active
//! collection, not a reference into shared state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{GatewayError, GatewayResult};

use super::chunk::{cosine_similarity, Chunk, SearchHit};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(7 * 24 * 3600);

type SubjectGrade = (String, u8);

/// One immutable installed version of a (subject, grade)'s chunk set.
#[derive(Debug)]
pub struct Collection {
    pub subject_code: String,
    pub grade: u8,
    pub version: String,
    pub chunks: Vec<Chunk>,
    pub active: bool,
}

impl Collection {
    fn search(&self, query_embedding: &[f32], k: usize) -> Vec<SearchHit> {
        let mut scored: Vec<SearchHit> = self
            .chunks
            .iter()
            .map(|c| SearchHit {
                chunk_id: c.chunk_id.clone(),
                text: c.text.clone(),
                book_id: c.book_id,
                book_title: c.book_title.clone(),
                ordinal: c.ordinal,
                token_count: c.token_count,
                score: cosine_similarity(query_embedding, &c.embedding),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.ordinal.cmp(&b.ordinal))
        });
        scored.truncate(k);
        scored
    }
}

struct RetiredVersion {
    collection: Arc<Collection>,
    retired_at: DateTime<Utc>,
}

struct Slot {
    active: Arc<Collection>,
    retired: Vec<RetiredVersion>,
}

#[async_trait]
pub trait VectorStoreGateway: Send + Sync {
    async fn search(
        &self,
        query_embedding: &[f32],
        subject_filter: Option<(&str, u8)>,
        k: usize,
    ) -> GatewayResult<Vec<SearchHit>>;

    /// Stages `chunks` under (subject, grade, version) without touching the
    /// active pointer; observable atomically once `activate` runs.
    async fn install(
        &self,
        subject_code: &str,
        grade: u8,
        version: &str,
        chunks: Vec<Chunk>,
    ) -> GatewayResult<()>;

    /// Atomically flips the active pointer for (subject, grade) to a staged
    /// version. The previously active version remains addressable for the
    /// grace period.
    async fn activate(&self, subject_code: &str, grade: u8, version: &str) -> GatewayResult<()>;

    /// Removes chunks for a version that is inactive and out of grace.
    async fn prune(&self, subject_code: &str, grade: u8, version: &str) -> GatewayResult<()>;
}

/// Default backend: an in-process, brute-force cosine index. Acceptable at
/// school-edge scale (a few thousand chunks per subject); substitutable by a
/// future ANN-backed implementation without touching the rank/fit/render
/// pipeline, since both speak only `VectorStoreGateway`.
pub struct InMemoryVectorStore {
    active: DashMap<SubjectGrade, RwLock<Slot>>,
    staged: DashMap<(String, u8, String), Vec<Chunk>>,
    install_locks: DashMap<SubjectGrade, Arc<AsyncMutex<()>>>,
    grace_period: Duration,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
            staged: DashMap::new(),
            install_locks: DashMap::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            grace_period,
            ..Self::new()
        }
    }

    fn lock_for(&self, key: &SubjectGrade) -> Arc<AsyncMutex<()>> {
        self.install_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStoreGateway for InMemoryVectorStore {
    async fn search(
        &self,
        query_embedding: &[f32],
        subject_filter: Option<(&str, u8)>,
        k: usize,
    ) -> GatewayResult<Vec<SearchHit>> {
        let Some((subject, grade)) = subject_filter else {
            return Ok(Vec::new());
        };
        let key = (subject.to_string(), grade);
        let collection = match self.active.get(&key) {
            Some(slot) => slot.read().active.clone(),
            None => return Ok(Vec::new()),
        };
        Ok(collection.search(query_embedding, k))
    }

    async fn install(
        &self,
        subject_code: &str,
        grade: u8,
        version: &str,
        chunks: Vec<Chunk>,
    ) -> GatewayResult<()> {
        let key = (subject_code.to_string(), grade);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;
        self.staged
            .insert((subject_code.to_string(), grade, version.to_string()), chunks);
        Ok(())
    }

    async fn activate(&self, subject_code: &str, grade: u8, version: &str) -> GatewayResult<()> {
        let key = (subject_code.to_string(), grade);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let staged_key = (subject_code.to_string(), grade, version.to_string());
        let chunks = self
            .staged
            .remove(&staged_key)
            .map(|(_, v)| v)
            .ok_or_else(|| {
                GatewayError::Storage(format!(
                    "no staged install for {subject_code}/{grade}/{version}"
                ))
            })?;

        let new_collection = Arc::new(Collection {
            subject_code: subject_code.to_string(),
            grade,
            version: version.to_string(),
            chunks,
            active: true,
        });

        match self.active.get(&key) {
            Some(slot) => {
                // Hold the write lock only for the pointer swap itself, not
                // for staging or copying, so readers are never starved for
                // longer than the bounded wait this discipline promises.
                let mut slot = slot.write();
                let retired = std::mem::replace(&mut slot.active, new_collection);
                slot.retired.push(RetiredVersion {
                    collection: retired,
                    retired_at: Utc::now(),
                });
            }
            None => {
                self.active.insert(
                    key,
                    RwLock::new(Slot {
                        active: new_collection,
                        retired: Vec::new(),
                    }),
                );
            }
        }
        Ok(())
    }

    async fn prune(&self, subject_code: &str, grade: u8, version: &str) -> GatewayResult<()> {
        let key = (subject_code.to_string(), grade);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if let Some(slot) = self.active.get(&key) {
            let mut slot = slot.write();
            let cutoff = Utc::now() - chrono::Duration::from_std(self.grace_period).unwrap_or(chrono::Duration::zero());
            slot.retired.retain(|r| {
                !(r.collection.version == version && r.retired_at < cutoff)
            });
        }
        Ok(())
    }
}
