//! Delivery credential health tracking.
//!
//! Credentials are shared across workers; health transitions happen on
//! whichever worker holds the credential at the moment a send fails, so state
//! lives in atomics rather than behind a lock. Cooldown expiry is observed
//! lazily on read — there is no background timer flipping credentials back.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

const STATE_AVAILABLE: u8 = 0;
const STATE_COOLING: u8 = 1;
const STATE_DISABLED: u8 = 2;

/// Observable credential availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Available,
    /// Cooling down until the contained epoch-millisecond deadline.
    CoolingDown { until_ms: u64 },
    Disabled,
}

/// One entry in the dispatcher's ordered credential list.
#[derive(Debug)]
pub struct DeliveryCredential {
    pub index: usize,
    /// Opaque transport handle (token, bot identity, ...).
    pub handle: String,
    state: AtomicU8,
    cooling_until_ms: AtomicU64,
    /// Anchor for the millisecond deadlines in `cooling_until_ms`. Uses the
    /// tokio clock so paused test time is honored.
    created: Instant,
}

impl DeliveryCredential {
    pub fn new(index: usize, handle: impl Into<String>) -> Self {
        Self {
            index,
            handle: handle.into(),
            state: AtomicU8::new(STATE_AVAILABLE),
            cooling_until_ms: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.created.elapsed().as_millis() as u64
    }

    /// Current state, promoting an expired cooldown back to available.
    pub fn state(&self) -> CredentialState {
        match self.state.load(Ordering::Acquire) {
            STATE_DISABLED => CredentialState::Disabled,
            STATE_COOLING => {
                let until_ms = self.cooling_until_ms.load(Ordering::Acquire);
                if self.now_ms() >= until_ms {
                    // Racing workers may both observe expiry; the CAS makes
                    // the promotion happen once. A concurrent disable wins.
                    let _ = self.state.compare_exchange(
                        STATE_COOLING,
                        STATE_AVAILABLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.state()
                } else {
                    CredentialState::CoolingDown { until_ms }
                }
            }
            _ => CredentialState::Available,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.state(), CredentialState::Available)
    }

    /// Enter cooldown for `retry_after`.
    pub fn begin_cooldown(&self, retry_after: Duration) {
        let until = self.now_ms() + retry_after.as_millis() as u64;
        self.cooling_until_ms.store(until, Ordering::Release);
        let _ = self.state.compare_exchange(
            STATE_AVAILABLE,
            STATE_COOLING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Exclude from rotation until [`DeliveryCredential::enable`] is called.
    pub fn disable(&self) {
        self.state.store(STATE_DISABLED, Ordering::Release);
    }

    /// Operator re-enable.
    pub fn enable(&self) {
        self.cooling_until_ms.store(0, Ordering::Release);
        self.state.store(STATE_AVAILABLE, Ordering::Release);
    }

    /// Remaining cooldown, if any.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        match self.state() {
            CredentialState::CoolingDown { until_ms } => {
                Some(Duration::from_millis(until_ms.saturating_sub(self.now_ms())))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_credential_is_available() {
        let cred = DeliveryCredential::new(0, "bot_a");
        assert!(cred.is_available());
        assert_eq!(cred.cooldown_remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_expires_on_read() {
        let cred = DeliveryCredential::new(0, "bot_a");
        cred.begin_cooldown(Duration::from_secs(5));
        assert!(!cred.is_available());
        assert!(cred.cooldown_remaining().unwrap() <= Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cred.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_stays_disabled_past_cooldown() {
        let cred = DeliveryCredential::new(0, "bot_a");
        cred.begin_cooldown(Duration::from_secs(1));
        cred.disable();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cred.state(), CredentialState::Disabled);

        cred.enable();
        assert!(cred.is_available());
    }
}
