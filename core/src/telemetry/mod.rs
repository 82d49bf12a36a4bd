//! C9 — rolls local counters, strips identifiers, batches to a remote sink
//! on a cadence.
//!
//! The privacy invariant is structural, not procedural: [`TelemetryBatch`]
//! is the only type with a `Serialize` impl on this path, and its fields are
//! the allow-list in full. There is no code path anywhere in this module
//! that can serialize a `ChatEntry` or `User`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use uuid::Uuid;

use crate::error::GatewayResult;

const DEFAULT_RESERVOIR_CAPACITY: usize = 1024;
const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Fixed-capacity reservoir sample of latency observations. Memory is
/// bounded regardless of request volume; quantiles are approximate but
/// stable once the reservoir fills.
struct ReservoirSketch {
    capacity: usize,
    samples: Vec<u32>,
    seen: u64,
}

impl ReservoirSketch {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Vec::with_capacity(capacity),
            seen: 0,
        }
    }

    fn add(&mut self, value: u32) {
        self.seen += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
            return;
        }
        let j = rand::thread_rng().gen_range(0..self.seen);
        if (j as usize) < self.capacity {
            self.samples[j as usize] = value;
        }
    }

    fn quantile(&self, p: f64) -> u32 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

struct HourBucket {
    queries: AtomicU64,
    errors: DashMap<String, AtomicU64>,
    latencies: Mutex<ReservoirSketch>,
}

impl HourBucket {
    fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            errors: DashMap::new(),
            latencies: Mutex::new(ReservoirSketch::new(DEFAULT_RESERVOIR_CAPACITY)),
        }
    }
}

/// The only struct with a `Serialize` impl on the telemetry upload path.
/// Every field here is drawn from the allow-list; nothing referencing a
/// user, a question, or a response can reach this type.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryBatch {
    pub batch_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub total_queries: u64,
    pub latency_p50_ms: u32,
    pub latency_p90_ms: u32,
    pub latency_p99_ms: u32,
    pub error_counts: HashMap<String, u64>,
    pub active_model_version: String,
    pub storage_bytes_used: u64,
    pub package_versions_installed: Vec<String>,
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn upload(&self, batch: &TelemetryBatch) -> GatewayResult<()>;
}

pub struct ReqwestTelemetrySink {
    client: reqwest::Client,
    endpoint: String,
}

impl ReqwestTelemetrySink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TelemetrySink for ReqwestTelemetrySink {
    async fn upload(&self, batch: &TelemetryBatch) -> GatewayResult<()> {
        self.client
            .post(&self.endpoint)
            .json(batch)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn hour_key(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

pub struct TelemetryAggregator {
    buckets: DashMap<DateTime<Utc>, HourBucket>,
    retention: Duration,
    model_version: Mutex<String>,
    storage_bytes: AtomicU64,
    package_versions: Mutex<Vec<String>>,
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            retention: DEFAULT_RETENTION,
            model_version: Mutex::new(String::new()),
            storage_bytes: AtomicU64::new(0),
            package_versions: Mutex::new(Vec::new()),
        }
    }

    pub fn record_query(&self, latency: Duration, error_kind: Option<&str>) {
        let bucket = self
            .buckets
            .entry(hour_key(Utc::now()))
            .or_insert_with(HourBucket::new);
        bucket.queries.fetch_add(1, Ordering::SeqCst);
        bucket
            .latencies
            .lock()
            .add(latency.as_millis().min(u32::MAX as u128) as u32);
        if let Some(kind) = error_kind {
            bucket
                .errors
                .entry(kind.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn set_model_version(&self, version: impl Into<String>) {
        *self.model_version.lock() = version.into();
    }

    pub fn set_storage_bytes(&self, bytes: u64) {
        self.storage_bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn set_package_versions(&self, versions: Vec<String>) {
        *self.package_versions.lock() = versions;
    }

    /// Builds a batch per closed hourly bucket, uploads each through `sink`,
    /// retains buckets whose upload failed for the next cycle, and discards
    /// anything older than the retention window regardless of outcome.
    pub async fn upload_cycle(&self, sink: &dyn TelemetrySink) {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());
        let keys: Vec<DateTime<Utc>> = self.buckets.iter().map(|e| *e.key()).collect();

        for key in keys {
            if key < cutoff {
                self.buckets.remove(&key);
                continue;
            }
            let Some((_, bucket)) = self.buckets.remove(&key) else {
                continue;
            };
            let batch = self.build_batch(key, &bucket);
            match sink.upload(&batch).await {
                Ok(()) => {}
                Err(e) => {
                    log::warn!("telemetry upload failed for bucket {key}: {e}");
                    self.buckets.insert(key, bucket);
                }
            }
        }
    }

    fn build_batch(&self, period_start: DateTime<Utc>, bucket: &HourBucket) -> TelemetryBatch {
        let latencies = bucket.latencies.lock();
        let error_counts = bucket
            .errors
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::SeqCst)))
            .collect();
        TelemetryBatch {
            batch_id: Uuid::new_v4(),
            period_start,
            total_queries: bucket.queries.load(Ordering::SeqCst),
            latency_p50_ms: latencies.quantile(0.50),
            latency_p90_ms: latencies.quantile(0.90),
            latency_p99_ms: latencies.quantile(0.99),
            error_counts,
            active_model_version: self.model_version.lock().clone(),
            storage_bytes_used: self.storage_bytes.load(Ordering::SeqCst),
            package_versions_installed: self.package_versions.lock().clone(),
        }
    }
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct FailingSink;

    #[async_trait]
    impl TelemetrySink for FailingSink {
        async fn upload(&self, _batch: &TelemetryBatch) -> GatewayResult<()> {
            Err(crate::error::GatewayError::ResourceUnavailable("down".into()))
        }
    }

    struct CountingSink {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TelemetrySink for CountingSink {
        async fn upload(&self, batch: &TelemetryBatch) -> GatewayResult<()> {
            assert!(serde_json::to_string(batch).unwrap().contains("total_queries"));
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_upload_retains_bucket() {
        let agg = TelemetryAggregator::new();
        agg.record_query(Duration::from_millis(120), None);
        agg.upload_cycle(&FailingSink).await;
        assert_eq!(agg.buckets.len(), 1);
    }

    #[tokio::test]
    async fn successful_upload_drains_bucket() {
        let agg = TelemetryAggregator::new();
        agg.record_query(Duration::from_millis(80), Some("Timeout"));
        let count = Arc::new(AtomicUsize::new(0));
        agg.upload_cycle(&CountingSink { count: count.clone() }).await;
        assert_eq!(agg.buckets.len(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reservoir_quantiles_are_in_range() {
        let mut sketch = ReservoirSketch::new(16);
        for i in 0..1000u32 {
            sketch.add(i);
        }
        assert!(sketch.quantile(0.5) <= 999);
        assert!(sketch.quantile(0.99) >= sketch.quantile(0.5));
    }
}
