//! Delivery dispatcher: round-robin over the credential list with cooldown
//! and revocation handling.
//!
//! Rotation rules: a throttled credential enters cooldown and the store call
//! is retried against the next available credential within the same call, no
//! sleeping as long as any credential is usable. When every credential is
//! cooling down, the dispatcher sleeps until the earliest deadline and
//! retries. A revoked credential is disabled and skipped until an operator
//! re-enables it; when all credentials are disabled, the call errors out.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::credentials::DeliveryCredential;
use super::transport::{DeliveryTransport, ResultRef, SendError};
use crate::transcode::Artifact;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on transport attempts per store call, counting cooldown
    /// sleeps. Guards against a transport that throttles forever.
    pub max_send_attempts: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: 25,
        }
    }
}

pub struct DeliveryDispatcher {
    credentials: Vec<Arc<DeliveryCredential>>,
    cursor: AtomicUsize,
    transport: Arc<dyn DeliveryTransport>,
    config: DispatcherConfig,
}

impl DeliveryDispatcher {
    pub fn new(
        handles: &[String],
        transport: Arc<dyn DeliveryTransport>,
        config: DispatcherConfig,
    ) -> Self {
        let credentials = handles
            .iter()
            .enumerate()
            .map(|(index, handle)| Arc::new(DeliveryCredential::new(index, handle.clone())))
            .collect();
        Self {
            credentials,
            cursor: AtomicUsize::new(0),
            transport,
            config,
        }
    }

    pub fn credentials(&self) -> &[Arc<DeliveryCredential>] {
        &self.credentials
    }

    /// Next credential in round-robin order, skipping cooling/disabled
    /// entries. The cursor advances on every pick so consecutive calls
    /// spread across the list.
    pub fn next_available(&self) -> Option<Arc<DeliveryCredential>> {
        let len = self.credentials.len();
        for _ in 0..len {
            let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let cred = &self.credentials[slot];
            if cred.is_available() {
                return Some(cred.clone());
            }
        }
        None
    }

    /// Earliest cooldown deadline among cooling credentials.
    fn earliest_cooldown(&self) -> Option<Duration> {
        self.credentials
            .iter()
            .filter_map(|c| c.cooldown_remaining())
            .min()
    }

    /// Block until at least one credential can be tried again. Errors only
    /// when the whole pool is disabled.
    async fn wait_for_capacity(&self) -> Result<()> {
        if let Some(wait) = self.earliest_cooldown() {
            warn!(wait_ms = wait.as_millis() as u64,
                "All delivery credentials cooling down, waiting for earliest");
            tokio::time::sleep(wait).await;
            return Ok(());
        }
        // Cooldown expiry is observed lazily on read, so a cooldown can
        // flip to available between the failed pick and the scan above. An
        // empty scan therefore does not by itself mean the pool is disabled.
        if self.credentials.iter().any(|c| c.is_available()) {
            return Ok(());
        }
        Err(Error::Other("all delivery credentials are disabled".into()))
    }

    /// Store an artifact through the rotation, returning its reference.
    pub async fn store(&self, artifact: &Artifact) -> Result<ResultRef> {
        for _ in 0..self.config.max_send_attempts {
            let Some(cred) = self.next_available() else {
                self.wait_for_capacity().await?;
                continue;
            };

            match self.transport.store(&cred, artifact).await {
                Ok(result_ref) => return Ok(result_ref),
                Err(SendError::Throttled { retry_after }) => {
                    warn!(
                        credential = cred.index,
                        retry_after_secs = retry_after.as_secs(),
                        "Credential throttled, rotating"
                    );
                    cred.begin_cooldown(retry_after);
                }
                Err(SendError::Revoked(reason)) => {
                    // Operator alert; the credential stays out of rotation
                    // until externally re-enabled.
                    error!(
                        credential = cred.index,
                        handle = %cred.handle,
                        %reason,
                        "Delivery credential revoked, disabling"
                    );
                    cred.disable();
                }
                Err(SendError::Failed(reason)) => {
                    warn!(credential = cred.index, %reason, "Store attempt failed, rotating");
                }
            }
        }

        Err(Error::Other(format!(
            "delivery failed after {} attempts",
            self.config.max_send_attempts
        )))
    }
}
