//! Scheduled puller, integrity checker, delta patcher, atomic installer.
//!
//! At most one installation runs per (subject, grade) at a time; different
//! pairs install concurrently, coordinated by a `DashMap`-backed lock table
//! — the same pattern the VKP install lock in the component design
//! describes and the vector store's own per-key install lock already uses.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{GatewayError, GatewayResult};
use crate::metadata::SharedMetadataStore;
use crate::vector::{Chunk, VectorStoreGateway};

use super::source::{RemoteVkpSource, VkpPackage};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const MAX_RETRIES_PER_CYCLE: u32 = 5;

type SubjectGrade = (String, u8);

pub struct VkpLifecycleManager {
    source: Arc<dyn RemoteVkpSource>,
    vector: Arc<dyn VectorStoreGateway>,
    metadata: SharedMetadataStore,
    install_locks: DashMap<SubjectGrade, Arc<AsyncMutex<()>>>,
}

impl VkpLifecycleManager {
    pub fn new(
        source: Arc<dyn RemoteVkpSource>,
        vector: Arc<dyn VectorStoreGateway>,
        metadata: SharedMetadataStore,
    ) -> Self {
        Self {
            source,
            vector,
            metadata,
            install_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &SubjectGrade) -> Arc<AsyncMutex<()>> {
        self.install_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Runs one poll cycle across `subscriptions`, one background task per
    /// (subject, grade) pair, joined before returning.
    pub async fn run_cycle(&self, subscriptions: &[(String, u8)]) {
        let mut handles = Vec::new();
        for (subject_code, grade) in subscriptions.iter().cloned() {
            let lock = self.lock_for(&(subject_code.clone(), grade));
            handles.push(self.sync_pair(subject_code, grade, lock));
        }
        futures::future::join_all(handles).await;
    }

    async fn sync_pair(&self, subject_code: String, grade: u8, lock: Arc<AsyncMutex<()>>) {
        let _guard = lock.lock().await;

        let installed_version = match self.metadata.get_active_vkp(&subject_code, grade).await {
            Ok(Some(record)) => semver::Version::parse(&record.version).ok(),
            Ok(None) => None,
            Err(e) => {
                log::error!("vkp cycle: could not read installed version for {subject_code}/{grade}: {e}");
                return;
            }
        };

        let available = match self.retry(|| self.source.list_available(&subject_code, grade)).await {
            Ok(v) => v,
            Err(e) => {
                log::error!("vkp cycle: discovery failed for {subject_code}/{grade}: {e}");
                return;
            }
        };

        let mut candidates: Vec<semver::Version> = available
            .into_iter()
            .filter(|v| installed_version.as_ref().map(|cur| v > cur).unwrap_or(true))
            .collect();
        candidates.sort();

        for version in candidates {
            if let Err(e) = self
                .install_candidate(&subject_code, grade, &version, installed_version.as_ref())
                .await
            {
                log::error!("vkp cycle: install of {subject_code}/{grade}/{version} failed: {e}");
            }
        }
    }

    /// Downloads the full package and verifies it against `hash_manifest`.
    /// Terminal `IntegrityFailure` on mismatch — there is no further
    /// fallback once the full package itself doesn't check out.
    async fn download_full_verified(
        &self,
        subject_code: &str,
        grade: u8,
        version: &semver::Version,
    ) -> GatewayResult<(Vec<u8>, String)> {
        let bytes = self
            .retry(|| self.source.download_full(subject_code, grade, version))
            .await?;
        let expected_hash = self
            .retry(|| self.source.hash_manifest(subject_code, grade, version))
            .await?;
        let actual_hash = hex::encode(Sha256::digest(&bytes));
        if actual_hash != expected_hash {
            return Err(GatewayError::IntegrityFailure {
                subject: subject_code.to_string(),
                grade,
                version: version.to_string(),
            });
        }
        Ok((bytes, actual_hash))
    }

    async fn install_candidate(
        &self,
        subject_code: &str,
        grade: u8,
        version: &semver::Version,
        from_version: Option<&semver::Version>,
    ) -> GatewayResult<()> {
        let (bytes, actual_hash) = match from_version {
            Some(from) => {
                match self
                    .retry(|| self.source.download_delta(subject_code, grade, from, version))
                    .await?
                {
                    Some((delta_bytes, delta_hash)) => {
                        let actual_delta_hash = hex::encode(Sha256::digest(&delta_bytes));
                        if actual_delta_hash == delta_hash {
                            (delta_bytes, actual_delta_hash)
                        } else {
                            log::warn!(
                                "vkp delta for {subject_code}/{grade}/{version} failed its own \
                                 integrity check, falling back to the full package"
                            );
                            self.download_full_verified(subject_code, grade, version).await?
                        }
                    }
                    None => self.download_full_verified(subject_code, grade, version).await?,
                }
            }
            None => self.download_full_verified(subject_code, grade, version).await?,
        };

        let package: VkpPackage = serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::Storage(format!("malformed vkp payload: {e}")))?;

        let chunks: Vec<Chunk> = package
            .chunks
            .into_iter()
            .map(|dto| Chunk {
                chunk_id: dto.chunk_id,
                vkp_record_id: uuid::Uuid::new_v4(),
                text: dto.text,
                embedding: dto.embedding,
                book_id: uuid::Uuid::new_v4(),
                book_title: dto.book_title,
                ordinal: dto.ordinal,
                token_count: dto.token_count,
            })
            .collect();
        let chunk_count = chunks.len() as u32;

        self.vector
            .install(subject_code, grade, &version.to_string(), chunks)
            .await?;
        self.vector.activate(subject_code, grade, &version.to_string()).await?;

        self.metadata
            .record_vkp_installation(subject_code, grade, &version.to_string(), &actual_hash, chunk_count)
            .await?;

        Ok(())
    }

    /// Exponential backoff with jitter, base 1s cap 60s, terminal after a
    /// bounded number of attempts for this cycle.
    async fn retry<F, Fut, T>(&self, mut op: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = GatewayResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 >= MAX_RETRIES_PER_CYCLE => return Err(e),
                Err(_) => {
                    let exp = BACKOFF_BASE.saturating_mul(1 << attempt.min(6));
                    let capped = exp.min(BACKOFF_CAP);
                    let jitter_ms = rand::Rng::gen_range(&mut rand::thread_rng(), 0..100);
                    tokio::time::sleep(capped + Duration::from_millis(jitter_ms)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SqliteMetadataStore;
    use crate::vector::InMemoryVectorStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeSource {
        payload: Vec<u8>,
        hash: String,
        fail_times: AtomicU32,
        delta: Option<(Vec<u8>, String)>,
        versions: Vec<semver::Version>,
    }

    #[async_trait]
    impl RemoteVkpSource for FakeSource {
        async fn list_available(&self, _s: &str, _g: u8) -> GatewayResult<Vec<semver::Version>> {
            Ok(self.versions.clone())
        }

        async fn hash_manifest(&self, _s: &str, _g: u8, _v: &semver::Version) -> GatewayResult<String> {
            Ok(self.hash.clone())
        }

        async fn download_full(&self, _s: &str, _g: u8, _v: &semver::Version) -> GatewayResult<Vec<u8>> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(GatewayError::ResourceUnavailable("flaky".into()));
            }
            Ok(self.payload.clone())
        }

        async fn download_delta(
            &self,
            _s: &str,
            _g: u8,
            _f: &semver::Version,
            _t: &semver::Version,
        ) -> GatewayResult<Option<(Vec<u8>, String)>> {
            Ok(self.delta.clone())
        }
    }

    fn make_payload() -> (Vec<u8>, String) {
        let package = VkpPackage {
            subject_code: "mat".into(),
            grade: 10,
            version: "1.0.0".into(),
            chunks: vec![super::super::source::ChunkDto {
                chunk_id: "c1".into(),
                text: "isi".into(),
                embedding: vec![1.0, 0.0],
                book_title: "Buku".into(),
                ordinal: 0,
                token_count: 5,
            }],
        };
        let bytes = serde_json::to_vec(&package).unwrap();
        let hash = hex::encode(Sha256::digest(&bytes));
        (bytes, hash)
    }

    #[tokio::test]
    async fn cycle_installs_and_activates() {
        let (bytes, hash) = make_payload();
        let source = Arc::new(FakeSource {
            payload: bytes,
            hash,
            fail_times: AtomicU32::new(0),
            delta: None,
            versions: vec![semver::Version::parse("1.0.0").unwrap()],
        });
        let vector = Arc::new(InMemoryVectorStore::new());
        let dir = tempfile::tempdir().unwrap();
        let metadata: SharedMetadataStore = Arc::new(
            SqliteMetadataStore::open(&dir.path().join("m.sqlite3"), Duration::from_secs(1)).unwrap(),
        );

        let manager = VkpLifecycleManager::new(source, vector.clone(), metadata.clone());
        manager.run_cycle(&[("mat".to_string(), 10)]).await;

        let hits = vector.search(&[1.0, 0.0], Some(("mat", 10)), 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        let active = metadata.get_active_vkp("mat", 10).await.unwrap().unwrap();
        assert_eq!(active.version, "1.0.0");
    }

    #[tokio::test]
    async fn hash_mismatch_is_rejected() {
        let (bytes, _correct_hash) = make_payload();
        let source = Arc::new(FakeSource {
            payload: bytes,
            hash: "deadbeef".repeat(8),
            fail_times: AtomicU32::new(0),
            delta: None,
            versions: vec![semver::Version::parse("1.0.0").unwrap()],
        });
        let vector = Arc::new(InMemoryVectorStore::new());
        let dir = tempfile::tempdir().unwrap();
        let metadata: SharedMetadataStore = Arc::new(
            SqliteMetadataStore::open(&dir.path().join("m.sqlite3"), Duration::from_secs(1)).unwrap(),
        );

        let manager = VkpLifecycleManager::new(source, vector.clone(), metadata);
        manager.run_cycle(&[("mat".to_string(), 10)]).await;

        let hits = vector.search(&[1.0, 0.0], Some(("mat", 10)), 5).await.unwrap();
        assert!(hits.is_empty(), "a hash-mismatched candidate must never activate");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (bytes, hash) = make_payload();
        let source = Arc::new(FakeSource {
            payload: bytes,
            hash,
            fail_times: AtomicU32::new(2),
            delta: None,
            versions: vec![semver::Version::parse("1.0.0").unwrap()],
        });
        let vector = Arc::new(InMemoryVectorStore::new());
        let dir = tempfile::tempdir().unwrap();
        let metadata: SharedMetadataStore = Arc::new(
            SqliteMetadataStore::open(&dir.path().join("m.sqlite3"), Duration::from_secs(1)).unwrap(),
        );

        let manager = VkpLifecycleManager::new(source, vector.clone(), metadata);
        manager.run_cycle(&[("mat".to_string(), 10)]).await;

        let hits = vector.search(&[1.0, 0.0], Some(("mat", 10)), 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    async fn seed_installed_version(metadata: &SharedMetadataStore) {
        metadata
            .record_vkp_installation("mat", 10, "1.0.0", "seed-hash", 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn valid_delta_is_installed_without_a_full_download() {
        let (bytes, hash) = make_payload();
        let delta_bytes = bytes.clone();
        let delta_hash = hex::encode(Sha256::digest(&delta_bytes));
        let source = Arc::new(FakeSource {
            payload: Vec::new(),
            hash,
            // download_full would fail if ever called, proving the delta
            // path was actually taken.
            fail_times: AtomicU32::new(u32::MAX),
            delta: Some((delta_bytes, delta_hash)),
            versions: vec![semver::Version::parse("1.1.0").unwrap()],
        });
        let vector = Arc::new(InMemoryVectorStore::new());
        let dir = tempfile::tempdir().unwrap();
        let metadata: SharedMetadataStore = Arc::new(
            SqliteMetadataStore::open(&dir.path().join("m.sqlite3"), Duration::from_secs(1)).unwrap(),
        );
        seed_installed_version(&metadata).await;

        let manager = VkpLifecycleManager::new(source, vector.clone(), metadata.clone());
        manager.run_cycle(&[("mat".to_string(), 10)]).await;

        let hits = vector.search(&[1.0, 0.0], Some(("mat", 10)), 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        let active = metadata.get_active_vkp("mat", 10).await.unwrap().unwrap();
        assert_eq!(active.version, "1.1.0");
    }

    #[tokio::test]
    async fn delta_with_bad_hash_falls_back_to_the_full_package() {
        let (bytes, hash) = make_payload();
        let source = Arc::new(FakeSource {
            payload: bytes,
            hash,
            fail_times: AtomicU32::new(0),
            delta: Some((b"corrupt delta bytes".to_vec(), "deadbeef".repeat(8))),
            versions: vec![semver::Version::parse("1.1.0").unwrap()],
        });
        let vector = Arc::new(InMemoryVectorStore::new());
        let dir = tempfile::tempdir().unwrap();
        let metadata: SharedMetadataStore = Arc::new(
            SqliteMetadataStore::open(&dir.path().join("m.sqlite3"), Duration::from_secs(1)).unwrap(),
        );
        seed_installed_version(&metadata).await;

        let manager = VkpLifecycleManager::new(source, vector.clone(), metadata.clone());
        manager.run_cycle(&[("mat".to_string(), 10)]).await;

        let hits = vector.search(&[1.0, 0.0], Some(("mat", 10)), 5).await.unwrap();
        assert_eq!(hits.len(), 1, "a bad delta must fall back to installing the full package");
        let active = metadata.get_active_vkp("mat", 10).await.unwrap().unwrap();
        assert_eq!(active.version, "1.1.0");
    }
}
