//! Upstream media-locator client.
//!
//! The locator resolves a source link into a time-limited streaming URL plus
//! size/duration hints. Response envelope:
//! `{status_code, data: {media: {stream_url, size_bytes, duration}}}` where a
//! non-zero `status_code` or a missing `stream_url` is a permanent failure
//! for the job.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Failure classification for the fetch/transcode stages. Transient errors
/// requeue the job; permanent errors dead-letter it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

/// Resolved media location.
#[derive(Debug, Clone)]
pub struct MediaLocation {
    pub stream_url: String,
    pub size_bytes: Option<u64>,
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LocatorResponse {
    status_code: i64,
    #[serde(default)]
    data: Option<LocatorData>,
}

#[derive(Debug, Deserialize)]
struct LocatorData {
    #[serde(default)]
    media: Option<LocatorMedia>,
}

#[derive(Debug, Deserialize)]
struct LocatorMedia {
    #[serde(default)]
    stream_url: Option<String>,
    #[serde(default)]
    size_bytes: Option<u64>,
    #[serde(default)]
    duration: Option<f64>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocatorService: Send + Sync {
    /// Resolve a source link into a streaming location.
    async fn locate(&self, source_url: &str) -> Result<MediaLocation, FetchError>;
}

/// HTTP implementation backed by reqwest.
pub struct HttpLocatorClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLocatorClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl LocatorService for HttpLocatorClient {
    async fn locate(&self, source_url: &str) -> Result<MediaLocation, FetchError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("url", source_url)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    FetchError::Transient(format!("locator unreachable: {e}"))
                } else {
                    FetchError::Transient(format!("locator request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("locator returned {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("locator returned {status}")));
        }

        let body: LocatorResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Permanent(format!("malformed locator response: {e}")))?;

        if body.status_code != 0 {
            return Err(FetchError::Permanent(format!(
                "locator rejected link (status_code {})",
                body.status_code
            )));
        }

        let media = body
            .data
            .and_then(|d| d.media)
            .ok_or_else(|| FetchError::Permanent("locator response has no media".into()))?;

        let stream_url = match media.stream_url {
            Some(url) if !url.is_empty() => url,
            _ => return Err(FetchError::Permanent("locator response has no stream_url".into())),
        };

        debug!(
            size_bytes = ?media.size_bytes,
            duration = ?media.duration,
            "Resolved media location"
        );

        Ok(MediaLocation {
            stream_url,
            size_bytes: media.size_bytes,
            duration_secs: media.duration,
        })
    }
}
