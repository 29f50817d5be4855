//! Progress state shared between pipeline stages and the notifier.
//!
//! Stages push [`ProgressState`] snapshots into a bounded channel; the
//! notifier subscribes on the receiving end. Percentage and ETA are never
//! stored — they are derived from bytes/rate at render time.

use tokio::sync::mpsc;

/// Pipeline stage a job is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Fetching,
    Transcoding,
    Delivering,
}

impl ProgressPhase {
    pub fn label(&self) -> &'static str {
        match self {
            ProgressPhase::Fetching => "Fetching",
            ProgressPhase::Transcoding => "Transcoding",
            ProgressPhase::Delivering => "Delivering",
        }
    }
}

/// Point-in-time snapshot of a job's progress.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub phase: ProgressPhase,
    pub bytes_done: u64,
    /// Unknown until the source reports a size.
    pub bytes_total: Option<u64>,
    /// Throughput in bytes per second. Zero while not yet measurable.
    pub rate: f64,
}

impl ProgressState {
    pub fn new(phase: ProgressPhase) -> Self {
        Self {
            phase,
            bytes_done: 0,
            bytes_total: None,
            rate: 0.0,
        }
    }

    /// Completion percentage, clamped to 0..=100. `None` when the total is
    /// unknown (indeterminate).
    pub fn percent(&self) -> Option<f64> {
        let total = self.bytes_total?;
        if total == 0 {
            return Some(100.0);
        }
        Some((self.bytes_done as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
    }

    /// Seconds remaining at the current rate. `None` while the rate is zero
    /// or the total is unknown.
    pub fn eta_secs(&self) -> Option<f64> {
        let total = self.bytes_total?;
        if self.rate <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.bytes_done);
        Some(remaining as f64 / self.rate)
    }
}

/// One progress snapshot, tagged with the owning job.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub requester_id: i64,
    pub state: ProgressState,
}

/// Sending half handed to pipeline stages.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    job_id: String,
    requester_id: i64,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(
        job_id: impl Into<String>,
        requester_id: i64,
        tx: mpsc::Sender<ProgressUpdate>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            requester_id,
            tx,
        }
    }

    /// Push one snapshot. Drops the update when the channel is full rather
    /// than stalling the byte stream.
    pub fn report(&self, state: ProgressState) {
        let update = ProgressUpdate {
            job_id: self.job_id.clone(),
            requester_id: self.requester_id,
            state,
        };
        let _ = self.tx.try_send(update);
    }
}

/// Bounded progress channel. 64 in-flight snapshots is plenty at the
/// notifier's emission cadence.
pub fn progress_channel() -> (mpsc::Sender<ProgressUpdate>, mpsc::Receiver<ProgressUpdate>) {
    mpsc::channel(64)
}
