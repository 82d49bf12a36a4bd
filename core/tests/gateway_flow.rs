//! End-to-end exercises across the dispatcher, vector store, orchestrator,
//! and auth modules wired together the way `sekolahd` wires them.

use std::sync::Arc;
use std::time::Duration;

use sekolah_core::metadata::Role;
use sekolah_core::stream::StreamEvent;
use sekolah_core::vector::{Chunk, VectorStoreGateway};
use sekolah_core::{Config, GatewayApp};
use sekolah_rag::{EmbeddingService, RagError, RagResult};

/// Always returns the same fixed vector, so a chunk installed with that
/// exact embedding is guaranteed the top search hit.
struct FixedEmbedding {
    vector: Vec<f32>,
}

#[async_trait::async_trait]
impl EmbeddingService for FixedEmbedding {
    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RagError::Embedding("empty input".into()));
        }
        Ok(self.vector.clone())
    }

    fn dimensions(&self) -> usize {
        self.vector.len()
    }

    fn model_name(&self) -> &str {
        "fixed-test-vector"
    }
}

fn test_config(data_dir: &std::path::Path) -> Config {
    Config {
        max_concurrent_inferences: 1,
        max_queue_depth: 4,
        context_window_tokens: 4096,
        retrieval_top_k: 3,
        session_ttl_seconds: 3600,
        vkp_poll_interval_seconds: 3600,
        telemetry_upload_interval_seconds: 3600,
        instructional_language: "id".to_string(),
        data_dir: data_dir.to_path_buf(),
        require_model: true,
    }
}

async fn drain(mut rx: tokio::sync::mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn chat_without_matching_context_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let embedding = Arc::new(FixedEmbedding {
        vector: vec![1.0, 0.0],
    });
    let app = GatewayApp::new(test_config(dir.path()), embedding).unwrap();
    app.load_model(true).await.unwrap();

    let (queue_id, rx) = app
        .submit_chat(uuid::Uuid::new_v4(), None, None, "apa itu fotosintesis?".to_string())
        .await
        .unwrap();
    assert_eq!(app.queue_position(queue_id), 0);

    let events = drain(rx).await;
    assert!(matches!(events.first(), Some(StreamEvent::Position(_))));
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Token(_))));
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Sources(_))));
}

#[tokio::test]
async fn chat_with_installed_chunk_retrieves_and_cites_it() {
    let dir = tempfile::tempdir().unwrap();
    let embedding = Arc::new(FixedEmbedding {
        vector: vec![1.0, 0.0],
    });
    let app = GatewayApp::new(test_config(dir.path()), embedding).unwrap();
    app.load_model(true).await.unwrap();

    let book_id = uuid::Uuid::new_v4();
    let chunk = Chunk {
        chunk_id: "chunk-1".to_string(),
        vkp_record_id: uuid::Uuid::new_v4(),
        text: "Fotosintesis adalah proses tumbuhan mengubah cahaya menjadi energi.".to_string(),
        embedding: vec![1.0, 0.0],
        book_id,
        book_title: "Biologi Kelas 7".to_string(),
        ordinal: 1,
        token_count: 12,
    };
    app.vector
        .install("ipa", 7, "1.0.0", vec![chunk])
        .await
        .unwrap();
    app.vector.activate("ipa", 7, "1.0.0").await.unwrap();

    let (_, rx) = app
        .submit_chat(
            uuid::Uuid::new_v4(),
            Some(("ipa".to_string(), 7)),
            None,
            "apa itu fotosintesis?".to_string(),
        )
        .await
        .unwrap();

    let events = drain(rx).await;
    let sources = events.iter().find_map(|e| match e {
        StreamEvent::Sources(s) => Some(s),
        _ => None,
    });
    assert!(sources.is_some(), "expected a sources event when context was retrieved");
    assert_eq!(sources.unwrap()[0].book, "Biologi Kelas 7");
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
}

#[tokio::test]
async fn queue_rejects_once_full_and_position_reflects_fifo_order() {
    let dir = tempfile::tempdir().unwrap();
    let embedding = Arc::new(FixedEmbedding {
        vector: vec![1.0, 0.0],
    });
    let mut config = test_config(dir.path());
    config.max_concurrent_inferences = 1;
    config.max_queue_depth = 1;
    let app = GatewayApp::new(config, embedding).unwrap();
    app.load_model(true).await.unwrap();

    let (_first, _rx1) = app
        .submit_chat(uuid::Uuid::new_v4(), None, None, "pertanyaan pertama".to_string())
        .await
        .unwrap();
    let rejected = app
        .submit_chat(uuid::Uuid::new_v4(), None, None, "pertanyaan kedua".to_string())
        .await;
    assert!(rejected.is_err());
}

#[tokio::test]
async fn login_verify_logout_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let embedding = Arc::new(FixedEmbedding {
        vector: vec![1.0, 0.0],
    });
    let app = GatewayApp::new(test_config(dir.path()), embedding).unwrap();

    let hash = sekolah_core::auth::hash_password("rahasia123").unwrap();
    app.metadata
        .create_user("budi", Role::Student, "Budi Santoso", &hash)
        .await
        .unwrap();

    let session = app.login("budi", "rahasia123", Role::Student).await.unwrap();
    let user = app.verify_session(&session.token).await.unwrap();
    assert_eq!(user.username, "budi");

    app.logout(&session.token).await.unwrap();
    assert!(app.verify_session(&session.token).await.is_err());
}

#[tokio::test]
async fn health_report_reflects_up_components() {
    let dir = tempfile::tempdir().unwrap();
    let embedding = Arc::new(FixedEmbedding {
        vector: vec![1.0, 0.0],
    });
    let app = GatewayApp::new(test_config(dir.path()), embedding).unwrap();
    app.load_model(true).await.unwrap();

    let report = app.health().await;
    assert!(report.metadata_ok);
    assert!(report.vector_ok);
    assert!(report.model_loaded);
    assert!(report.is_healthy());
}

#[tokio::test]
async fn cancel_before_admission_short_circuits_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let embedding = Arc::new(FixedEmbedding {
        vector: vec![1.0, 0.0],
    });
    let mut config = test_config(dir.path());
    config.max_concurrent_inferences = 1;
    config.max_queue_depth = 4;
    let app = GatewayApp::new(config, embedding).unwrap();
    app.load_model(true).await.unwrap();

    let (_holder, _rx_holder) = app
        .submit_chat(uuid::Uuid::new_v4(), None, None, "tahan slot".to_string())
        .await
        .unwrap();
    let (queued_id, rx) = app
        .submit_chat(uuid::Uuid::new_v4(), None, None, "dibatalkan".to_string())
        .await
        .unwrap();

    app.cancel_chat(queued_id);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = drain(rx).await;
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Cancelled)));
}
