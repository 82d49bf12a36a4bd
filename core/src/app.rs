//! Wires every component into the surface an (out-of-scope) HTTP layer
//! would call: submit a chat, read queue stats, check health, manage
//! sessions.

use std::sync::Arc;
use std::time::Duration;

use sekolah_rag::{EmbeddingService, Language, PromptRenderer};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::AuthService;
use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherStats};
use crate::error::{GatewayError, GatewayResult};
use crate::inference::{InferenceAdapter, Limits, ModelConfig};
use crate::metadata::{Role, Session, SharedMetadataStore, SqliteMetadataStore, User};
use crate::orchestrator::{ChatRequest, Orchestrator, OrchestratorConfig};
use crate::resilience::{HealthReport, ResilienceSupervisor};
use crate::stream::StreamEvent;
use crate::telemetry::TelemetryAggregator;
use crate::vector::{InMemoryVectorStore, VectorStoreGateway};

pub struct GatewayApp {
    pub config: Config,
    pub metadata: SharedMetadataStore,
    pub vector: Arc<dyn VectorStoreGateway>,
    pub inference: Arc<dyn InferenceAdapter>,
    pub dispatcher: Dispatcher,
    pub auth: AuthService,
    pub orchestrator: Arc<Orchestrator>,
    pub telemetry: Arc<TelemetryAggregator>,
    pub resilience: ResilienceSupervisor,
}

impl GatewayApp {
    pub fn new(config: Config, embedding: Arc<dyn EmbeddingService>) -> GatewayResult<Self> {
        let metadata: SharedMetadataStore = Arc::new(SqliteMetadataStore::open(
            &config.metadata_db_path(),
            Duration::from_secs(5),
        )?);
        let vector: Arc<dyn VectorStoreGateway> = Arc::new(InMemoryVectorStore::new());
        let inference: Arc<dyn InferenceAdapter> = Arc::new(crate::inference::SimulatorAdapter::new());
        let renderer = Arc::new(
            PromptRenderer::new().map_err(|e| GatewayError::Config(e.to_string()))?,
        );
        let telemetry = Arc::new(TelemetryAggregator::new());
        let language = Language::from_code(&config.instructional_language).unwrap_or_else(|_| {
            log::warn!(
                "unrecognized instructional_language '{}', defaulting to id",
                config.instructional_language
            );
            Language::Indonesian
        });

        let dispatcher = Dispatcher::new(
            config.max_concurrent_inferences,
            config.max_queue_depth,
            Duration::from_secs(60),
        );

        let orchestrator = Arc::new(Orchestrator::new(
            metadata.clone(),
            vector.clone(),
            embedding,
            inference.clone(),
            renderer,
            telemetry.clone(),
            OrchestratorConfig {
                top_k: config.retrieval_top_k,
                budget_tokens: 3000,
                floor_tokens: sekolah_rag::DEFAULT_BUDGET_FLOOR_TOKENS,
                language,
                limits: Limits {
                    max_output_tokens: 512,
                    temperature: 0.7,
                    top_p: 0.9,
                    per_call_timeout: Duration::from_secs(60),
                },
            },
        ));

        let auth = AuthService::new(metadata.clone(), config.session_ttl());
        let resilience = ResilienceSupervisor::new(
            metadata.clone(),
            vector.clone(),
            inference.clone(),
            dispatcher.clone(),
            config.data_dir.join("backups"),
        );

        Ok(Self {
            config,
            metadata,
            vector,
            inference,
            dispatcher,
            auth,
            orchestrator,
            telemetry,
            resilience,
        })
    }

    pub async fn load_model(&self, require: bool) -> GatewayResult<()> {
        match self
            .inference
            .load(ModelConfig {
                model_path: std::path::PathBuf::from("./models"),
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if require => Err(e),
            Err(e) => {
                log::warn!("model load failed, continuing in degraded (fallback-only) mode: {e}");
                Ok(())
            }
        }
    }

    /// Submits a chat request: enqueues it in the dispatcher, then (once
    /// admitted) runs the orchestrator and streams events to the returned
    /// channel.
    pub async fn submit_chat(
        &self,
        user_id: Uuid,
        subject: Option<(String, u8)>,
        subject_id: Option<Uuid>,
        question: String,
    ) -> GatewayResult<(Uuid, mpsc::Receiver<StreamEvent>)> {
        let ticket = self.dispatcher.submit()?;
        let queue_id = ticket.queue_id;

        let dispatcher = self.dispatcher.clone();
        let orchestrator = self.orchestrator.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let emitter = crate::stream::StreamEmitter::new(tx);
            let _ = emitter.position(dispatcher.position(queue_id)).await;

            let admission = match dispatcher.acquire(queue_id).await {
                Ok(a) => a,
                Err(GatewayError::Cancelled) => {
                    let _ = emitter.cancelled().await;
                    return;
                }
                Err(_) => {
                    let _ = emitter.error("Timeout", "deadline exceeded while queued").await;
                    dispatcher.complete(queue_id, true);
                    return;
                }
            };
            admission.mark_streaming();

            let cancel = admission.cancellation_token();
            let request = ChatRequest {
                user_id,
                subject,
                subject_id,
                question,
            };
            let failed = orchestrator.handle(request, &emitter, cancel).await.is_err();
            dispatcher.complete(queue_id, failed);
        });

        Ok((queue_id, rx))
    }

    pub fn cancel_chat(&self, queue_id: Uuid) {
        self.dispatcher.cancel(queue_id);
    }

    pub fn queue_position(&self, queue_id: Uuid) -> i64 {
        self.dispatcher.position(queue_id)
    }

    pub fn queue_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    pub async fn health(&self) -> HealthReport {
        self.resilience.probe_health().await
    }

    pub async fn login(&self, username: &str, password: &str, role: Role) -> GatewayResult<Session> {
        self.auth.login(username, password, role).await
    }

    pub async fn verify_session(&self, token: &str) -> GatewayResult<User> {
        self.auth.verify(token).await
    }

    pub async fn logout(&self, token: &str) -> GatewayResult<()> {
        self.auth.logout(token).await
    }

    /// Removes sessions with `expiry < now`; intended to be driven by a
    /// periodic background task at least every 5 minutes.
    pub async fn sweep_sessions(&self) -> GatewayResult<u64> {
        self.metadata.sweep_expired_sessions(chrono::Utc::now()).await
    }
}
