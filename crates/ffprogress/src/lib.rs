//! Parser for the ffmpeg `-progress pipe:1` key/value stream.
//!
//! ffmpeg emits progress as repeating blocks of `key=value` lines terminated
//! by a `progress=continue` (or `progress=end`) line. The total media
//! duration is not part of that stream; it is printed once on stderr as
//! `Duration: HH:MM:SS.cc` and must be probed separately with
//! [`parse_duration_line`].

/// One completed progress block.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FfmpegUpdate {
    /// Media time processed so far, in microseconds (`out_time_ms` /
    /// `out_time_us`; despite the name, ffmpeg reports microseconds for both).
    pub out_time_us: Option<u64>,
    /// Bytes written so far (`total_size`).
    pub total_size: Option<u64>,
    /// True for the final `progress=end` block.
    pub end: bool,
}

impl FfmpegUpdate {
    /// Media time processed so far in seconds.
    pub fn out_time_secs(&self) -> Option<f64> {
        self.out_time_us.map(|us| us as f64 / 1_000_000.0)
    }
}

/// Accumulates `key=value` lines into [`FfmpegUpdate`]s.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: FfmpegUpdate,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line from the progress stream. Returns a completed update
    /// when the line closes a block (`progress=...`), `None` otherwise.
    pub fn push_line(&mut self, line: &str) -> Option<FfmpegUpdate> {
        let line = line.trim();
        let (key, value) = line.split_once('=')?;
        let (key, value) = (key.trim(), value.trim());

        match key {
            // out_time_us supersedes out_time_ms when both are present
            "out_time_us" => self.current.out_time_us = value.parse().ok(),
            "out_time_ms" => {
                if self.current.out_time_us.is_none() {
                    self.current.out_time_us = value.parse().ok();
                }
            }
            "total_size" => self.current.total_size = value.parse().ok(),
            "progress" => {
                let mut done = std::mem::take(&mut self.current);
                done.end = value == "end";
                return Some(done);
            }
            _ => {}
        }
        None
    }
}

/// Probe the media duration from an ffmpeg stderr line.
///
/// Matches the `Duration: HH:MM:SS.cc` header ffmpeg prints once per input.
/// Returns the duration in seconds.
pub fn parse_duration_line(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("Duration:")?.trim_start();

    // N/A for live sources without a known duration
    if rest.starts_with("N/A") {
        return None;
    }

    let clock = rest.split([',', ' ']).next()?;
    let mut parts = clock.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(0.0..60.0).contains(&minutes) || !(0.0..60.0).contains(&seconds)
    {
        return None;
    }

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
