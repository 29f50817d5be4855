//! Delivery transport seam.
//!
//! The dispatcher and router only see this trait: a credential-scoped store
//! call returning an opaque reference, and relay/status calls performed by
//! the canonical identity. [`HttpDeliveryTransport`] is the production
//! binding; tests inject mocks.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::credentials::DeliveryCredential;
use crate::transcode::Artifact;

/// Opaque locator for a durably stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultRef(String);

impl ResultRef {
    pub fn new(inner: impl Into<String>) -> Self {
        Self(inner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResultRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure modes of a transport call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// The transport asked us to back off this credential.
    #[error("throttled, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },
    /// The credential is no longer usable (permission revoked).
    #[error("credential revoked: {0}")]
    Revoked(String),
    /// Anything else; the dispatcher rotates to the next credential.
    #[error("send failed: {0}")]
    Failed(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Store an artifact under `credential`, returning its reference.
    async fn store(
        &self,
        credential: &DeliveryCredential,
        artifact: &Artifact,
    ) -> Result<ResultRef, SendError>;

    /// Relay an already-stored artifact to a requester. Always performed by
    /// the canonical identity, never a rotating credential.
    async fn relay(&self, requester_id: i64, result_ref: &ResultRef) -> Result<(), SendError>;

    /// Post a short status line to a requester (progress, failure notices).
    async fn update_status(&self, requester_id: i64, text: &str) -> Result<(), SendError>;
}

#[derive(Debug, Deserialize)]
struct StoreResponse {
    result_ref: String,
}

/// HTTP binding. `store` PUTs artifact bytes scoped by the credential
/// handle; `relay` and `update_status` POST under the canonical identity.
pub struct HttpDeliveryTransport {
    client: reqwest::Client,
    base_url: String,
    canonical_identity: String,
}

impl HttpDeliveryTransport {
    pub fn new(base_url: impl Into<String>, canonical_identity: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            canonical_identity: canonical_identity.into(),
        }
    }

    fn classify(response: &reqwest::Response) -> Option<SendError> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(30));
            return Some(SendError::Throttled { retry_after });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Some(SendError::Revoked(format!("transport returned {status}")));
        }
        if !status.is_success() {
            return Some(SendError::Failed(format!("transport returned {status}")));
        }
        None
    }
}

#[async_trait]
impl DeliveryTransport for HttpDeliveryTransport {
    async fn store(
        &self,
        credential: &DeliveryCredential,
        artifact: &Artifact,
    ) -> Result<ResultRef, SendError> {
        let file = tokio::fs::File::open(&artifact.path)
            .await
            .map_err(|e| SendError::Failed(format!("cannot open artifact: {e}")))?;

        let response = self
            .client
            .put(format!("{}/objects", self.base_url))
            .bearer_auth(&credential.handle)
            .header(reqwest::header::CONTENT_LENGTH, artifact.size_bytes)
            .body(reqwest::Body::wrap_stream(
                tokio_util::io::ReaderStream::new(file),
            ))
            .send()
            .await
            .map_err(|e| SendError::Failed(format!("store request failed: {e}")))?;

        if let Some(err) = Self::classify(&response) {
            return Err(err);
        }

        let body: StoreResponse = response
            .json()
            .await
            .map_err(|e| SendError::Failed(format!("malformed store response: {e}")))?;
        Ok(ResultRef::new(body.result_ref))
    }

    async fn relay(&self, requester_id: i64, result_ref: &ResultRef) -> Result<(), SendError> {
        let response = self
            .client
            .post(format!("{}/relay", self.base_url))
            .bearer_auth(&self.canonical_identity)
            .json(&json!({
                "requester_id": requester_id,
                "result_ref": result_ref.as_str(),
            }))
            .send()
            .await
            .map_err(|e| SendError::Failed(format!("relay request failed: {e}")))?;

        match Self::classify(&response) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn update_status(&self, requester_id: i64, text: &str) -> Result<(), SendError> {
        let response = self
            .client
            .post(format!("{}/status", self.base_url))
            .bearer_auth(&self.canonical_identity)
            .json(&json!({
                "requester_id": requester_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| SendError::Failed(format!("status request failed: {e}")))?;

        match Self::classify(&response) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
