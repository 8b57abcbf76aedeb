//! REST client for the streaming provider's management API.
//!
//! Wraps the handful of provider endpoints the platform calls directly:
//! creating a live stream (returns the ingest credential and playback id),
//! deleting an archived asset, and querying asset state. Webhook traffic
//! flows the other way and is handled by the broadcast service itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider api error ({status}): {message}")]
    Api { status: u16, message: String },
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// A live stream as provisioned by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderLiveStream {
    /// Provider-assigned stream id, referenced by `stream.*` webhooks.
    pub id: String,
    /// Secret ingest credential handed to the broadcaster.
    pub stream_key: String,
    /// Public playback id used to derive the CDN playback URL.
    pub playback_id: String,
}

/// An archived asset as reported by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderAsset {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub playback_id: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
struct CreateLiveStreamBody<'a> {
    name: &'a str,
    playback_policy: &'a str,
}

/// Thin client over the provider's management REST API.
///
/// All calls are token-authenticated JSON requests. The client holds no
/// state beyond the connection pool and is cheap to clone.
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl ProviderClient {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        }
    }

    /// Provision a live stream, returning the provider stream id, the ingest
    /// credential, and the playback id.
    pub async fn create_live_stream(&self, name: &str) -> ProviderResult<ProviderLiveStream> {
        let url = format!("{}/v1/live-streams", self.base_url);
        let body = CreateLiveStreamBody {
            name,
            playback_policy: "public",
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let stream: ProviderLiveStream = response.json().await?;
        debug!(provider_stream_id = %stream.id, "Provisioned provider live stream");
        Ok(stream)
    }

    /// Delete an archived asset. A 404 means the asset is already gone and is
    /// treated as success so the call stays idempotent under retries.
    pub async fn delete_asset(&self, asset_id: &str) -> ProviderResult<()> {
        let url = format!("{}/v1/assets/{}", self.base_url, asset_id);

        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            warn!(%asset_id, "Provider asset already deleted");
            return Ok(());
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }

    /// Fetch current asset state; `None` when the provider no longer knows
    /// the asset.
    pub async fn get_asset(&self, asset_id: &str) -> ProviderResult<Option<ProviderAsset>> {
        let url = format!("{}/v1/assets/{}", self.base_url, asset_id);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(Some(response.json().await?))
    }
}
