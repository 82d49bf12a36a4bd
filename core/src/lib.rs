//! Coordination core for the sekolah school-edge inference gateway: a
//! bounded concurrency dispatcher, a retrieval-augmented generation
//! pipeline, a VKP lifecycle manager, a persistence layer, and an
//! anonymized telemetry aggregator, wired together behind [`app::GatewayApp`].

pub mod app;
pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod inference;
pub mod metadata;
pub mod orchestrator;
pub mod resilience;
pub mod stream;
pub mod telemetry;
pub mod vector;
pub mod vkp;

pub use app::GatewayApp;
pub use config::Config;
pub use error::{GatewayError, GatewayResult};
