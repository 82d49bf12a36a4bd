//! Typed configuration loaded from environment keys at startup.
//!
//! Unknown or malformed values are a configuration error (exit code 2 at the
//! daemon boundary); this module only builds and validates the struct, it
//! never calls `std::process::exit` itself.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct Config {
    pub max_concurrent_inferences: usize,
    pub max_queue_depth: usize,
    pub context_window_tokens: u32,
    pub retrieval_top_k: usize,
    pub session_ttl_seconds: u64,
    pub vkp_poll_interval_seconds: u64,
    pub telemetry_upload_interval_seconds: u64,
    pub instructional_language: String,
    pub data_dir: PathBuf,
    pub require_model: bool,
}

impl Config {
    /// Builds and validates a `Config` from the process environment,
    /// applying the documented defaults for every unset key.
    pub fn from_env() -> Result<Self, GatewayError> {
        let cfg = Config {
            max_concurrent_inferences: parse_or("max_concurrent_inferences", 5)?,
            max_queue_depth: parse_or("max_queue_depth", 1000)?,
            context_window_tokens: parse_or("context_window_tokens", 4096)?,
            retrieval_top_k: parse_or("retrieval_top_k", 5)?,
            session_ttl_seconds: parse_or("session_ttl_seconds", 86_400)?,
            vkp_poll_interval_seconds: parse_or("vkp_poll_interval_seconds", 3600)?,
            telemetry_upload_interval_seconds: parse_or(
                "telemetry_upload_interval_seconds",
                3600,
            )?,
            instructional_language: env::var("instructional_language")
                .unwrap_or_else(|_| "id".to_string()),
            data_dir: PathBuf::from(
                env::var("data_dir").unwrap_or_else(|_| "./data".to_string()),
            ),
            require_model: parse_or("require_model", true)?,
        };
        cfg.validate()
    }

    fn validate(self) -> Result<Self, GatewayError> {
        if self.max_concurrent_inferences == 0 {
            return Err(GatewayError::Config(
                "max_concurrent_inferences must be >= 1".into(),
            ));
        }
        if self.retrieval_top_k == 0 {
            return Err(GatewayError::Config("retrieval_top_k must be >= 1".into()));
        }
        if self.context_window_tokens < 256 {
            return Err(GatewayError::Config(
                "context_window_tokens must be >= 256".into(),
            ));
        }
        Ok(self)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.data_dir.join("metadata.sqlite3")
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.data_dir.join("spill")
    }

    pub fn vector_store_dir(&self) -> PathBuf {
        self.data_dir.join("vector_store")
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T, GatewayError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| GatewayError::Config(format!("{key} has an invalid value: {raw}"))),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => {
            Err(GatewayError::Config(format!("{key} is not valid unicode")))
        }
    }
}
