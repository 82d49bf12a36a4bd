//! Contract for the external source that publishes Versioned Knowledge
//! Packages. No assumption about transport beyond deterministic byte
//! streams plus a hash; the shipped client speaks HTTP via `reqwest`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDto {
    pub chunk_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub book_title: String,
    pub ordinal: u32,
    pub token_count: u32,
}

/// The decoded payload of a downloaded VKP: every chunk for one (subject,
/// grade, version). The on-wire encoding is JSON; `install_full`/
/// `install_delta` in the manager are the only code that touches this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VkpPackage {
    pub subject_code: String,
    pub grade: u8,
    pub version: String,
    pub chunks: Vec<ChunkDto>,
}

#[async_trait]
pub trait RemoteVkpSource: Send + Sync {
    /// Versions available for (subject, grade), newest last.
    async fn list_available(&self, subject_code: &str, grade: u8) -> GatewayResult<Vec<semver::Version>>;

    /// SHA-256 hex digest the source declares for this package's bytes.
    async fn hash_manifest(
        &self,
        subject_code: &str,
        grade: u8,
        version: &semver::Version,
    ) -> GatewayResult<String>;

    async fn download_full(
        &self,
        subject_code: &str,
        grade: u8,
        version: &semver::Version,
    ) -> GatewayResult<Vec<u8>>;

    /// `None` when no delta is published for this pair of versions; the
    /// manager falls back to a full install. When `Some`, the bundled
    /// `String` is the SHA-256 hex digest the source declares for *these*
    /// bytes — a separate checkpoint from `hash_manifest`, which always
    /// covers the full package. A delta is its own self-contained install
    /// payload (not a binary patch against the installed artifact); serving
    /// it from a `from`-version-specific endpoint lets the source keep it
    /// smaller on the wire while the manager still verifies it on its own
    /// terms before use.
    async fn download_delta(
        &self,
        subject_code: &str,
        grade: u8,
        from: &semver::Version,
        to: &semver::Version,
    ) -> GatewayResult<Option<(Vec<u8>, String)>>;
}

/// HTTP-backed source. The index, manifest, and download endpoints are
/// deployment-specific; this client assumes a simple REST layout under
/// `base_url`.
pub struct HttpVkpSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVkpSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RemoteVkpSource for HttpVkpSource {
    async fn list_available(&self, subject_code: &str, grade: u8) -> GatewayResult<Vec<semver::Version>> {
        let url = format!("{}/packages/{subject_code}/{grade}", self.base_url);
        let versions: Vec<String> = self.client.get(&url).send().await?.json().await?;
        Ok(versions
            .into_iter()
            .filter_map(|v| semver::Version::parse(&v).ok())
            .collect())
    }

    async fn hash_manifest(
        &self,
        subject_code: &str,
        grade: u8,
        version: &semver::Version,
    ) -> GatewayResult<String> {
        let url = format!("{}/packages/{subject_code}/{grade}/{version}/hash", self.base_url);
        Ok(self.client.get(&url).send().await?.text().await?)
    }

    async fn download_full(
        &self,
        subject_code: &str,
        grade: u8,
        version: &semver::Version,
    ) -> GatewayResult<Vec<u8>> {
        let url = format!("{}/packages/{subject_code}/{grade}/{version}", self.base_url);
        Ok(self.client.get(&url).send().await?.bytes().await?.to_vec())
    }

    async fn download_delta(
        &self,
        subject_code: &str,
        grade: u8,
        from: &semver::Version,
        to: &semver::Version,
    ) -> GatewayResult<Option<(Vec<u8>, String)>> {
        let url = format!(
            "{}/packages/{subject_code}/{grade}/delta/{from}/{to}",
            self.base_url
        );
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = resp.error_for_status()?.bytes().await?.to_vec();

        let hash_url = format!(
            "{}/packages/{subject_code}/{grade}/delta/{from}/{to}/hash",
            self.base_url
        );
        let hash = self.client.get(&hash_url).send().await?.text().await?;
        Ok(Some((bytes, hash)))
    }
}
