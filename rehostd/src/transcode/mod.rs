//! Transcode stage: ffmpeg in stream-copy mode with live progress.
//!
//! ffmpeg reads the time-limited streaming URL directly and remuxes it to a
//! local artifact with `-c copy` (no re-encode). `-progress pipe:1` gives a
//! machine-readable key=value stream on stdout, parsed by [`ffprogress`];
//! stderr is scanned once for the `Duration:` banner line to estimate
//! completion when the locator did not report a size.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use ffprogress::ProgressParser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::locator::{FetchError, MediaLocation};
use crate::pipeline::progress::{ProgressPhase, ProgressReporter, ProgressState};

/// A locally produced media file ready for delivery.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Produce a local artifact at `output_path`, pushing progress snapshots
    /// as bytes land. Honors `cancel` by killing the subprocess.
    async fn transcode(
        &self,
        location: &MediaLocation,
        output_path: &Path,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Artifact, FetchError>;
}

pub struct FfmpegTranscoder {
    ffmpeg_path: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

/// Estimate total output size from elapsed stream time when the upstream
/// size is unknown. Linear extrapolation over the probed duration.
fn estimate_total(bytes_done: u64, out_time_secs: f64, duration_secs: f64) -> Option<u64> {
    if out_time_secs <= 0.0 || duration_secs <= 0.0 || bytes_done == 0 {
        return None;
    }
    let fraction = (out_time_secs / duration_secs).min(1.0);
    Some((bytes_done as f64 / fraction) as u64)
}

/// Stat the finished output and reject empty results.
async fn finalize_artifact(path: &Path) -> Result<Artifact, FetchError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| FetchError::Permanent(format!("transcode produced no output: {e}")))?;
    if meta.len() == 0 {
        return Err(FetchError::Permanent("transcode produced a zero-byte result".into()));
    }
    Ok(Artifact {
        path: path.to_path_buf(),
        size_bytes: meta.len(),
    })
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        location: &MediaLocation,
        output_path: &Path,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Artifact, FetchError> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-y", "-i", &location.stream_url])
            .args(["-c", "copy", "-progress", "pipe:1", "-nostats"])
            .arg(output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::Permanent(format!("failed to spawn ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Permanent("ffmpeg stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::Permanent("ffmpeg stderr not captured".into()))?;

        // Drain stderr on its own task; publish the first Duration line so
        // the progress loop can estimate totals mid-stream.
        let probed_duration: Arc<OnceLock<f64>> = Arc::new(OnceLock::new());
        let probe = probed_duration.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if probe.get().is_none()
                    && let Some(duration) = ffprogress::parse_duration_line(&line)
                {
                    let _ = probe.set(duration);
                }
            }
        });

        let mut parser = ProgressParser::new();
        let mut lines = BufReader::new(stdout).lines();
        let mut last_sample: Option<(Instant, u64)> = None;
        let mut rate = 0.0f64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Transcode cancelled, killing ffmpeg");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(FetchError::Transient("transcode cancelled".into()));
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let Some(update) = parser.push_line(&line) else {
                                continue;
                            };
                            let bytes_done = update.total_size.unwrap_or(0);
                            let now = Instant::now();
                            if let Some((prev_at, prev_bytes)) = last_sample {
                                let dt = now.duration_since(prev_at).as_secs_f64();
                                if dt > 0.0 && bytes_done > prev_bytes {
                                    rate = (bytes_done - prev_bytes) as f64 / dt;
                                }
                            }
                            last_sample = Some((now, bytes_done));

                            let duration = location
                                .duration_secs
                                .or_else(|| probed_duration.get().copied());
                            let bytes_total = location.size_bytes.or_else(|| {
                                duration.and_then(|d| {
                                    let out_time = update.out_time_secs().unwrap_or(0.0);
                                    estimate_total(bytes_done, out_time, d)
                                })
                            });

                            reporter.report(ProgressState {
                                phase: ProgressPhase::Transcoding,
                                bytes_done,
                                bytes_total,
                                rate,
                            });

                            if update.end {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Failed reading ffmpeg progress stream: {e}");
                            break;
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FetchError::Transient(format!("ffmpeg wait failed: {e}")))?;
        let _ = stderr_task.await;

        if !status.success() {
            // Stream URLs are short-lived; a mid-stream abort is worth a retry.
            return Err(FetchError::Transient(format!("ffmpeg exited with {status}")));
        }

        finalize_artifact(output_path).await
    }
}
