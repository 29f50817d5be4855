//! Process configuration loaded from environment variables.
//!
//! `dotenvy` is invoked by `main` before [`Settings::from_env`]; everything
//! here reads plain `std::env` so tests can set variables directly.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::delivery::dispatcher::DispatcherConfig;
use crate::pipeline::governor::GovernorConfig;
use crate::pipeline::job_queue::JobQueueConfig;
use crate::pipeline::notifier::NotifierConfig;
use crate::pipeline::worker_pool::WorkerPoolConfig;
use crate::{Error, Result};

/// Default SQLite URL (created on first run).
pub const DEFAULT_DATABASE_URL: &str = "sqlite:rehostd.db?mode=rwc";

/// Complete process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// SQLite URL for the job queue and fingerprint store.
    pub database_url: String,
    /// Media locator service endpoint (queried as `GET <url>?url=<link>`).
    pub locator_api_url: String,
    /// Delivery transport base URL (store/relay/status endpoints).
    pub delivery_api_url: String,
    /// Scratch directory for fetched artifacts.
    pub download_dir: PathBuf,
    /// ffmpeg binary to invoke for the fetch/transcode stage.
    pub ffmpeg_path: String,
    /// Ordered delivery credential handles, rotated by the dispatcher.
    pub delivery_identities: Vec<String>,
    /// The single identity all user-facing relays originate from.
    pub canonical_identity: String,
    /// Log file directory.
    pub log_dir: PathBuf,

    pub queue: JobQueueConfig,
    pub governor: GovernorConfig,
    pub worker: WorkerPoolConfig,
    pub dispatcher: DispatcherConfig,
    pub notifier: NotifierConfig,
}

impl Settings {
    /// Load settings from the environment.
    ///
    /// Fails on missing required variables (locator endpoint, identities) or
    /// unparseable values; numeric knobs fall back to component defaults.
    pub fn from_env() -> Result<Self> {
        let locator_api_url = require("LOCATOR_API_URL")?;
        let delivery_api_url = require("DELIVERY_API_URL")?;
        let canonical_identity = require("CANONICAL_IDENTITY")?;

        let delivery_identities: Vec<String> = require("DELIVERY_IDENTITIES")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if delivery_identities.is_empty() {
            return Err(Error::config("DELIVERY_IDENTITIES must list at least one identity"));
        }

        let mut queue = JobQueueConfig::default();
        queue.max_attempts = env_parse("MAX_ATTEMPTS", queue.max_attempts)?;
        queue.visibility_timeout_secs =
            env_parse("VISIBILITY_TIMEOUT_SECS", queue.visibility_timeout_secs)?;
        queue.poll_interval_ms = env_parse("POLL_INTERVAL_MS", queue.poll_interval_ms)?;

        let mut governor = GovernorConfig::default();
        governor.max_workers = env_parse("MAX_WORKERS", governor.max_workers)?;
        governor.cpu_threshold_percent =
            env_parse("CPU_THRESHOLD_PERCENT", governor.cpu_threshold_percent)?;
        governor.sustain_secs = env_parse("GOVERNOR_SUSTAIN_SECS", governor.sustain_secs)?;
        governor.sample_interval_secs =
            env_parse("GOVERNOR_SAMPLE_INTERVAL_SECS", governor.sample_interval_secs)?;
        governor.reduction_factor =
            env_parse("GOVERNOR_REDUCTION_FACTOR", governor.reduction_factor)?;
        governor.validate()?;

        let mut worker = WorkerPoolConfig::default();
        worker.job_timeout_secs = env_parse("JOB_TIMEOUT_SECS", worker.job_timeout_secs)?;
        worker.poll_interval_ms = env_parse("WORKER_POLL_INTERVAL_MS", worker.poll_interval_ms)?;

        let mut notifier = NotifierConfig::default();
        notifier.min_interval_secs =
            env_parse("NOTIFY_MIN_INTERVAL_SECS", notifier.min_interval_secs)?;

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            locator_api_url,
            delivery_api_url,
            download_dir: std::env::var("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./downloads")),
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            delivery_identities,
            canonical_identity,
            log_dir: std::env::var("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./logs")),
            queue,
            governor,
            worker,
            dispatcher: DispatcherConfig::default(),
            notifier,
        })
    }
}

fn require(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::config(format!("missing required environment variable {key}")))
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid {key}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_identities() {
        let parsed: Vec<String> = " bot_a, bot_b ,,bot_c "
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(parsed, vec!["bot_a", "bot_b", "bot_c"]);
    }

    #[test]
    fn env_parse_uses_default_when_unset() {
        let value: u64 = env_parse("REHOSTD_TEST_UNSET_KNOB", 42u64).unwrap();
        assert_eq!(value, 42);
    }
}
