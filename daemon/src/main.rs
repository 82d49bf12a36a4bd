//! Process entrypoint: loads configuration, initializes logging, wires
//! `GatewayApp`, spawns the background tasks (VKP poller, telemetry
//! uploader, resilience supervisor, session sweep), and waits for a
//! shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use sekolah_core::{Config, GatewayApp};
use tokio_util::sync::CancellationToken;

mod embedding;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    let require_model = config.require_model;
    let embedding = Arc::new(embedding::HashEmbeddingService::new(256));
    let app = match GatewayApp::new(config, embedding) {
        Ok(app) => Arc::new(app),
        Err(e) => {
            log::error!("initialization failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.load_model(require_model).await {
        log::error!("model load failed and require_model=true: {e}");
        std::process::exit(1);
    }

    let shutdown = CancellationToken::new();
    spawn_background_tasks(app.clone(), shutdown.clone());

    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    })
    .expect("failed to register signal handler");

    rx.recv().await;
    log::info!("shutdown signal received, draining");
    shutdown.cancel();

    std::process::exit(0);
}

fn spawn_background_tasks(app: Arc<GatewayApp>, shutdown: CancellationToken) {
    let sweep_app = app.clone();
    let sweep_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = sweep_app.sweep_sessions().await {
                        log::warn!("session sweep failed: {e}");
                    }
                }
                _ = sweep_shutdown.cancelled() => break,
            }
        }
    });

    let health_app = app.clone();
    let health_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(health_app.resilience.health_probe_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    health_app.health().await;
                }
                _ = health_shutdown.cancelled() => break,
            }
        }
    });

    let telemetry_app = app.clone();
    let telemetry_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let interval_secs = telemetry_app.config.telemetry_upload_interval_seconds;
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        let sink = sekolah_core::telemetry::ReqwestTelemetrySink::new(
            "https://telemetry.invalid/ingest".to_string(),
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    telemetry_app.telemetry.upload_cycle(&sink).await;
                }
                _ = telemetry_shutdown.cancelled() => break,
            }
        }
    });

    let full_snapshot_app = app.clone();
    let full_snapshot_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(7 * 24 * 3600));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = full_snapshot_app.resilience.snapshot_full().await {
                        log::error!("full snapshot failed: {e}");
                    }
                }
                _ = full_snapshot_shutdown.cancelled() => break,
            }
        }
    });

    let incremental_snapshot_app = app.clone();
    let incremental_snapshot_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = incremental_snapshot_app.resilience.snapshot_incremental().await {
                        log::error!("incremental snapshot failed: {e}");
                    }
                }
                _ = incremental_snapshot_shutdown.cancelled() => break,
            }
        }
    });
}
