//! Result router: final relay to requesters through the canonical identity.
//!
//! Whether a result is fresh or pulled from the fingerprint store, the relay
//! always originates from the one canonical identity, never from whichever
//! rotating credential stored the artifact. The router also fans a finished
//! result out to duplicate requesters that enlisted as waiters while the
//! first job was in flight.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, warn};

use super::transport::{DeliveryTransport, ResultRef, SendError};
use crate::{Error, Result};

/// Relay attempts per requester before giving up.
const MAX_RELAY_ATTEMPTS: usize = 3;

pub struct ResultRouter {
    transport: Arc<dyn DeliveryTransport>,
    canonical_identity: String,
}

impl ResultRouter {
    pub fn new(transport: Arc<dyn DeliveryTransport>, canonical_identity: impl Into<String>) -> Self {
        Self {
            transport,
            canonical_identity: canonical_identity.into(),
        }
    }

    /// Relay a stored result to one requester, honoring throttle backoff.
    pub async fn relay_result(&self, requester_id: i64, result_ref: &ResultRef) -> Result<()> {
        for attempt in 1..=MAX_RELAY_ATTEMPTS {
            match self.transport.relay(requester_id, result_ref).await {
                Ok(()) => {
                    debug!(
                        requester_id,
                        %result_ref,
                        identity = %self.canonical_identity,
                        "Relayed result"
                    );
                    return Ok(());
                }
                Err(SendError::Throttled { retry_after }) if attempt < MAX_RELAY_ATTEMPTS => {
                    warn!(requester_id, ?retry_after, "Relay throttled, backing off");
                    sleep(retry_after).await;
                }
                Err(e) => {
                    return Err(Error::Other(format!(
                        "relay to requester {requester_id} failed: {e}"
                    )));
                }
            }
        }
        Err(Error::Other(format!(
            "relay to requester {requester_id} failed after {MAX_RELAY_ATTEMPTS} attempts"
        )))
    }

    /// Relay the same result to the primary requester plus any duplicate
    /// waiters. A failed waiter relay is logged but does not fail the job.
    pub async fn relay_to_all(&self, requester_ids: &[i64], result_ref: &ResultRef) -> Result<()> {
        let mut requesters = requester_ids.iter();
        if let Some(primary) = requesters.next() {
            self.relay_result(*primary, result_ref).await?;
        }
        for requester_id in requesters {
            if let Err(e) = self.relay_result(*requester_id, result_ref).await {
                warn!(requester_id, "Waiter relay failed: {e}");
            }
        }
        Ok(())
    }

    /// Notify a requester that their job permanently failed.
    pub async fn report_failure(&self, requester_id: i64, reason: &str) {
        let text = format!("Your request could not be completed: {reason}");
        if let Err(e) = self.transport.update_status(requester_id, &text).await {
            warn!(requester_id, "Failed to deliver failure notice: {e}");
        }
    }

    /// Push a progress line to a requester. Best-effort.
    pub async fn send_progress(&self, requester_id: i64, text: &str) {
        if let Err(e) = self.transport.update_status(requester_id, text).await {
            debug!(requester_id, "Progress update not delivered: {e}");
        }
    }
}
