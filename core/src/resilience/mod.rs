//! C10 — periodic snapshot/backup, health checks, and spill-buffer replay
//! on restart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::dispatcher::Dispatcher;
use crate::error::{GatewayError, GatewayResult};
use crate::inference::InferenceAdapter;
use crate::metadata::SharedMetadataStore;
use crate::vector::VectorStoreGateway;

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const QUEUE_DEPTH_WARNING: usize = 500;

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub metadata_ok: bool,
    pub vector_ok: bool,
    pub model_loaded: bool,
    pub queue_healthy: bool,
    pub probed_at: chrono::DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.metadata_ok && self.vector_ok && self.model_loaded && self.queue_healthy
    }
}

pub struct ResilienceSupervisor {
    metadata: SharedMetadataStore,
    vector: Arc<dyn VectorStoreGateway>,
    inference: Arc<dyn InferenceAdapter>,
    dispatcher: Dispatcher,
    backup_dir: PathBuf,
    last_incremental: Mutex<chrono::DateTime<Utc>>,
}

impl ResilienceSupervisor {
    pub fn new(
        metadata: SharedMetadataStore,
        vector: Arc<dyn VectorStoreGateway>,
        inference: Arc<dyn InferenceAdapter>,
        dispatcher: Dispatcher,
        backup_dir: PathBuf,
    ) -> Self {
        Self {
            metadata,
            vector,
            inference,
            dispatcher,
            backup_dir,
            last_incremental: Mutex::new(Utc::now()),
        }
    }

    pub async fn probe_health(&self) -> HealthReport {
        let metadata_ok = self.metadata.health_check().await;
        // The vector store has no network round trip to fail in-process; an
        // empty, always-answering search stands in for "reachable".
        let vector_ok = self.vector.search(&[], None, 1).await.is_ok();
        let model_loaded = self.inference.is_loaded();
        let queue_healthy = self.dispatcher.stats().depth < QUEUE_DEPTH_WARNING;

        let report = HealthReport {
            metadata_ok,
            vector_ok,
            model_loaded,
            queue_healthy,
            probed_at: Utc::now(),
        };
        if !report.is_healthy() {
            log::error!(
                "health probe failing: metadata={} vector={} model={} queue={}",
                metadata_ok,
                vector_ok,
                model_loaded,
                queue_healthy
            );
        }
        report
    }

    pub fn health_probe_interval(&self) -> Duration {
        HEALTH_PROBE_INTERVAL
    }

    /// Weekly full snapshot: a consistent on-disk copy of the metadata store
    /// (`VACUUM INTO`). The vector store's on-disk layout is opaque to the
    /// core (§6), so a full snapshot in a real deployment also fsyncs its
    /// backend-specific directory; this core only owns the metadata side.
    pub async fn snapshot_full(&self) -> GatewayResult<()> {
        std::fs::create_dir_all(&self.backup_dir).map_err(|e| GatewayError::Storage(e.to_string()))?;
        let dest = self
            .backup_dir
            .join(format!("full-{}.sqlite3", Utc::now().timestamp()));
        self.metadata.backup_full(&dest).await
    }

    /// Daily incremental snapshot: every chat entry recorded since the last
    /// incremental run, serialized as JSON.
    pub async fn snapshot_incremental(&self) -> GatewayResult<()> {
        std::fs::create_dir_all(&self.backup_dir).map_err(|e| GatewayError::Storage(e.to_string()))?;
        let since = *self.last_incremental.lock();
        let entries = self.metadata.export_chat_entries_since(since).await?;
        let dest = self
            .backup_dir
            .join(format!("incremental-{}.json", Utc::now().timestamp()));
        let body = serde_json::to_vec_pretty(&entries).map_err(|e| GatewayError::Storage(e.to_string()))?;
        std::fs::write(dest, body).map_err(|e| GatewayError::Storage(e.to_string()))?;
        *self.last_incremental.lock() = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::SimulatorAdapter;
    use crate::metadata::SqliteMetadataStore;
    use crate::vector::InMemoryVectorStore;

    #[tokio::test]
    async fn health_report_reflects_unloaded_model() {
        let dir = tempfile::tempdir().unwrap();
        let metadata: SharedMetadataStore = Arc::new(
            SqliteMetadataStore::open(&dir.path().join("m.sqlite3"), Duration::from_secs(1)).unwrap(),
        );
        let vector = Arc::new(InMemoryVectorStore::new());
        let inference = Arc::new(SimulatorAdapter::new());
        let dispatcher = Dispatcher::new(5, 1000, Duration::from_secs(60));
        let supervisor =
            ResilienceSupervisor::new(metadata, vector, inference, dispatcher, dir.path().join("backups"));

        let report = supervisor.probe_health().await;
        assert!(!report.model_loaded);
        assert!(!report.is_healthy());
    }

    #[tokio::test]
    async fn full_snapshot_is_a_restorable_database_copy() {
        use crate::metadata::{MetadataStore, Role};

        let dir = tempfile::tempdir().unwrap();
        let metadata_store = Arc::new(
            SqliteMetadataStore::open(&dir.path().join("m.sqlite3"), Duration::from_secs(1)).unwrap(),
        );
        metadata_store
            .create_user("budi", Role::Student, "Budi", "hash")
            .await
            .unwrap();
        let metadata: SharedMetadataStore = metadata_store;
        let vector = Arc::new(InMemoryVectorStore::new());
        let inference = Arc::new(SimulatorAdapter::new());
        let dispatcher = Dispatcher::new(5, 1000, Duration::from_secs(60));
        let backup_dir = dir.path().join("backups");
        let supervisor = ResilienceSupervisor::new(metadata, vector, inference, dispatcher, backup_dir.clone());

        supervisor.snapshot_full().await.unwrap();
        let snapshot_path = std::fs::read_dir(&backup_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();

        let restored = SqliteMetadataStore::open(&snapshot_path, Duration::from_secs(1)).unwrap();
        assert!(restored.get_user_by_username("budi").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn incremental_snapshot_writes_a_chat_entry_export() {
        let dir = tempfile::tempdir().unwrap();
        let metadata: SharedMetadataStore = Arc::new(
            SqliteMetadataStore::open(&dir.path().join("m.sqlite3"), Duration::from_secs(1)).unwrap(),
        );
        let vector = Arc::new(InMemoryVectorStore::new());
        let inference = Arc::new(SimulatorAdapter::new());
        let dispatcher = Dispatcher::new(5, 1000, Duration::from_secs(60));
        let backup_dir = dir.path().join("backups");
        let supervisor = ResilienceSupervisor::new(metadata, vector, inference, dispatcher, backup_dir.clone());

        supervisor.snapshot_incremental().await.unwrap();
        assert!(std::fs::read_dir(&backup_dir).unwrap().count() > 0);
    }
}
