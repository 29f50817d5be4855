//! Progress notifier: per-job emission rate limiting and message formatting.
//!
//! `should_emit` keeps one timestamp per job in a [`DashMap`], so jobs never
//! contend with each other. Formatting is stateless: percentage and ETA are
//! recomputed from the snapshot on every emission.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::progress::ProgressState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Minimum seconds between emissions for one job.
    pub min_interval_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { min_interval_secs: 3 }
    }
}

/// Rate limiter plus formatter for status updates.
pub struct ProgressNotifier {
    min_interval: Duration,
    last_emitted: DashMap<String, Instant>,
}

impl ProgressNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            min_interval: Duration::from_secs(config.min_interval_secs),
            last_emitted: DashMap::new(),
        }
    }

    /// True at most once per minimum interval per job. The first call for a
    /// job always passes.
    pub fn should_emit(&self, job_id: &str, now: Instant) -> bool {
        match self.last_emitted.entry(job_id.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if now.duration_since(*slot.get()) >= self.min_interval {
                    slot.insert(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Drop per-job state once a job reaches a terminal state.
    pub fn forget(&self, job_id: &str) {
        self.last_emitted.remove(job_id);
    }

    /// Render one snapshot as a status line.
    pub fn format(state: &ProgressState) -> String {
        let phase = state.phase.label();

        let percent = match state.percent() {
            Some(p) => format!("{p:.1}%"),
            None => "--%".to_string(),
        };

        let rate = if state.rate > 0.0 {
            format!("{}/s", format_bytes(state.rate as u64))
        } else {
            "--".to_string()
        };

        let eta = match state.eta_secs() {
            Some(secs) => format_duration(secs),
            None => "calculating".to_string(),
        };

        format!(
            "{phase}: {percent} ({} / {}) | {rate} | ETA {eta}",
            format_bytes(state.bytes_done),
            state
                .bytes_total
                .map(format_bytes)
                .unwrap_or_else(|| "?".to_string()),
        )
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

pub fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
