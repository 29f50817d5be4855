//! Concurrency governor: adapts the admissible number of simultaneously
//! active jobs to host CPU load.
//!
//! Two states: normal (limit = configured maximum) and throttled (limit =
//! reduced floor). Transitions are debounced — utilization must stay on the
//! far side of the threshold for a sustained window before the state flips,
//! so transient spikes do not flap the limit. The sampling loop runs on its
//! own task and is never blocked by job work; the worker pool reads
//! [`ConcurrencyGovernor::current_limit`] before admitting a new job and
//! never preempts running ones.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Configuration for the governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Worker limit in the normal state.
    pub max_workers: usize,
    /// CPU utilization threshold in percent.
    pub cpu_threshold_percent: f32,
    /// How long utilization must stay past the threshold before a transition.
    pub sustain_secs: u64,
    /// Sampling period.
    pub sample_interval_secs: u64,
    /// Fraction of `max_workers` shed when throttled (0.0–1.0).
    pub reduction_factor: f32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            cpu_threshold_percent: 85.0,
            sustain_secs: 10,
            sample_interval_secs: 1,
            reduction_factor: 0.5,
        }
    }
}

impl GovernorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::config("MAX_WORKERS must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.reduction_factor) {
            return Err(Error::config("GOVERNOR_REDUCTION_FACTOR must be within 0.0..=1.0"));
        }
        if !self.cpu_threshold_percent.is_finite()
            || !(0.0..=100.0).contains(&self.cpu_threshold_percent)
        {
            return Err(Error::config("CPU_THRESHOLD_PERCENT must be within 0..=100"));
        }
        Ok(())
    }

    /// Reduced worker limit while throttled, never below 1.
    pub fn throttled_limit(&self) -> usize {
        let shed = (self.max_workers as f32 * self.reduction_factor).ceil() as usize;
        self.max_workers.saturating_sub(shed).max(1)
    }
}

/// Governor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorState {
    Normal,
    Throttled,
}

/// Emitted on state transitions.
#[derive(Debug, Clone)]
pub enum GovernorEvent {
    Throttled { limit: usize, utilization: f32 },
    Recovered { limit: usize, utilization: f32 },
}

/// Debounced threshold tracker. Pure state machine over (utilization, now),
/// so transitions are testable with synthetic sample sequences.
#[derive(Debug)]
pub struct DebounceTracker {
    threshold: f32,
    sustain: Duration,
    state: GovernorState,
    crossed_since: Option<Instant>,
}

impl DebounceTracker {
    pub fn new(threshold: f32, sustain: Duration) -> Self {
        Self {
            threshold,
            sustain,
            state: GovernorState::Normal,
            crossed_since: None,
        }
    }

    pub fn state(&self) -> GovernorState {
        self.state
    }

    /// Feed one sample. Returns the new state when this sample causes a
    /// transition. A transition fires on the first sample at or past the
    /// sustain window, never before.
    pub fn observe(&mut self, utilization: f32, now: Instant) -> Option<GovernorState> {
        let past_threshold = match self.state {
            GovernorState::Normal => utilization > self.threshold,
            GovernorState::Throttled => utilization <= self.threshold,
        };

        if !past_threshold {
            self.crossed_since = None;
            return None;
        }

        let since = *self.crossed_since.get_or_insert(now);
        if now.duration_since(since) >= self.sustain {
            self.state = match self.state {
                GovernorState::Normal => GovernorState::Throttled,
                GovernorState::Throttled => GovernorState::Normal,
            };
            self.crossed_since = None;
            return Some(self.state);
        }
        None
    }
}

const STATE_NORMAL: u8 = 0;
const STATE_THROTTLED: u8 = 1;

/// Process-wide concurrency budget.
pub struct ConcurrencyGovernor {
    config: GovernorConfig,
    current_limit: AtomicUsize,
    state: AtomicU8,
    tracker: parking_lot::Mutex<DebounceTracker>,
    event_tx: broadcast::Sender<GovernorEvent>,
}

impl ConcurrencyGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let (event_tx, _) = broadcast::channel(16);
        let tracker = DebounceTracker::new(
            config.cpu_threshold_percent,
            Duration::from_secs(config.sustain_secs),
        );
        Self {
            current_limit: AtomicUsize::new(config.max_workers),
            state: AtomicU8::new(STATE_NORMAL),
            tracker: parking_lot::Mutex::new(tracker),
            event_tx,
            config,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Admissible number of simultaneously active jobs right now.
    pub fn current_limit(&self) -> usize {
        self.current_limit.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> GovernorState {
        match self.state.load(Ordering::SeqCst) {
            STATE_THROTTLED => GovernorState::Throttled,
            _ => GovernorState::Normal,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GovernorEvent> {
        self.event_tx.subscribe()
    }

    /// Apply one utilization sample, updating the limit on a transition.
    pub fn observe_sample(&self, utilization: f32, now: Instant) -> Option<GovernorEvent> {
        let transition = self.tracker.lock().observe(utilization, now)?;

        let event = match transition {
            GovernorState::Throttled => {
                let limit = self.config.throttled_limit();
                self.current_limit.store(limit, Ordering::SeqCst);
                self.state.store(STATE_THROTTLED, Ordering::SeqCst);
                warn!(
                    utilization,
                    limit, "Sustained CPU pressure, throttling worker admission"
                );
                GovernorEvent::Throttled { limit, utilization }
            }
            GovernorState::Normal => {
                let limit = self.config.max_workers;
                self.current_limit.store(limit, Ordering::SeqCst);
                self.state.store(STATE_NORMAL, Ordering::SeqCst);
                info!(utilization, limit, "CPU pressure cleared, restoring worker admission");
                GovernorEvent::Recovered { limit, utilization }
            }
        };

        let _ = self.event_tx.send(event.clone());
        Some(event)
    }

    /// Spawn the host sampling loop.
    pub fn start(self: Arc<Self>, cancel_token: CancellationToken) {
        let interval = Duration::from_secs(self.config.sample_interval_secs.max(1));

        tokio::spawn(async move {
            let mut sys = sysinfo::System::new();
            // First refresh primes the counters; utilization is meaningful
            // from the second refresh onward.
            sys.refresh_cpu_usage();

            debug!(?interval, "Concurrency governor sampling started");
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Concurrency governor shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        sys.refresh_cpu_usage();
                        let utilization = sys.global_cpu_usage();
                        self.observe_sample(utilization, Instant::now());
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run(
        tracker: &mut DebounceTracker,
        start: Instant,
        step: Duration,
        samples: &[f32],
    ) -> Vec<(usize, GovernorState)> {
        let mut transitions = Vec::new();
        for (i, util) in samples.iter().enumerate() {
            if let Some(state) = tracker.observe(*util, start + step * i as u32) {
                transitions.push((i, state));
            }
        }
        transitions
    }

    #[test]
    fn throttled_limit_sheds_a_fraction_with_floor_of_one() {
        let config = GovernorConfig {
            max_workers: 4,
            reduction_factor: 0.5,
            ..Default::default()
        };
        assert_eq!(config.throttled_limit(), 2);

        let config = GovernorConfig {
            max_workers: 1,
            reduction_factor: 0.9,
            ..Default::default()
        };
        assert_eq!(config.throttled_limit(), 1);
    }

    #[test]
    fn transition_fires_on_first_sample_after_sustain_elapses() {
        let mut tracker = DebounceTracker::new(85.0, Duration::from_secs(10));
        let start = Instant::now();
        let step = Duration::from_secs(1);

        // 11 samples above threshold at 1s spacing: the sample at t=10s is
        // the first at the sustain window, and the one that transitions.
        let samples = [90.0f32; 11];
        let transitions = sample_run(&mut tracker, start, step, &samples);
        assert_eq!(transitions, vec![(10, GovernorState::Throttled)]);
    }

    #[test]
    fn transient_spike_does_not_throttle() {
        let mut tracker = DebounceTracker::new(85.0, Duration::from_secs(10));
        let start = Instant::now();
        let step = Duration::from_secs(1);

        // spike resets when utilization dips back under the threshold
        let samples = [90.0, 95.0, 50.0, 92.0, 91.0, 40.0];
        let transitions = sample_run(&mut tracker, start, step, &samples);
        assert!(transitions.is_empty());
        assert_eq!(tracker.state(), GovernorState::Normal);
    }

    #[test]
    fn recovery_is_debounced_symmetrically() {
        let mut tracker = DebounceTracker::new(85.0, Duration::from_secs(2));
        let start = Instant::now();
        let step = Duration::from_secs(1);

        // throttle: above for 0,1,2 → transition at index 2
        let transitions = sample_run(&mut tracker, start, step, &[90.0, 90.0, 90.0]);
        assert_eq!(transitions, vec![(2, GovernorState::Throttled)]);

        // recover: below for 3 consecutive samples
        let start2 = start + Duration::from_secs(10);
        let transitions = sample_run(&mut tracker, start2, step, &[50.0, 50.0, 50.0]);
        assert_eq!(transitions, vec![(2, GovernorState::Normal)]);
    }

    #[test]
    fn governor_updates_limit_on_transitions() {
        let config = GovernorConfig {
            max_workers: 4,
            cpu_threshold_percent: 85.0,
            sustain_secs: 0,
            reduction_factor: 0.5,
            ..Default::default()
        };
        let governor = ConcurrencyGovernor::new(config);
        assert_eq!(governor.current_limit(), 4);
        assert_eq!(governor.state(), GovernorState::Normal);

        // sustain 0: a single sample past the threshold flips the state
        let event = governor.observe_sample(95.0, Instant::now());
        assert!(matches!(event, Some(GovernorEvent::Throttled { limit: 2, .. })));
        assert_eq!(governor.current_limit(), 2);
        assert_eq!(governor.state(), GovernorState::Throttled);

        let event = governor.observe_sample(10.0, Instant::now());
        assert!(matches!(event, Some(GovernorEvent::Recovered { limit: 4, .. })));
        assert_eq!(governor.current_limit(), 4);
    }

    #[test]
    fn events_are_broadcast_to_subscribers() {
        let governor = ConcurrencyGovernor::new(GovernorConfig {
            sustain_secs: 0,
            ..Default::default()
        });
        let mut rx = governor.subscribe();

        governor.observe_sample(99.0, Instant::now());
        assert!(matches!(rx.try_recv(), Ok(GovernorEvent::Throttled { .. })));
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let mut config = GovernorConfig::default();
        config.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = GovernorConfig::default();
        config.reduction_factor = 1.5;
        assert!(config.validate().is_err());

        assert!(GovernorConfig::default().validate().is_ok());
    }
}
