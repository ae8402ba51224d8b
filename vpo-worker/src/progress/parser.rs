//! ffmpeg progress parsing.
//!
//! Handles both the machine-readable `-progress pipe:1` stream, where a block
//! of `key=value` lines is closed by `progress=continue|end`, and the classic
//! single-line stats ffmpeg prints to stderr:
//!
//! ```text
//! frame=  120 fps= 30 q=28.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.5x
//! ```

use std::sync::LazyLock;

use regex::Regex;

use super::{ProgressSnapshot, ProgressUnit};

/// Percent is held below this until ffmpeg reports `progress=end`.
const MAX_RUNNING_PERCENT: f64 = 99.9;

static STATS_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-z_]+)=\s*(\S+)").unwrap());

#[derive(Debug, Default, Clone)]
struct Accumulator {
    frame: Option<u64>,
    fps: Option<f64>,
    bitrate_kbps: Option<f64>,
    total_size: Option<u64>,
    out_time_us: Option<u64>,
    speed: Option<f64>,
}

/// Stateful parser for one encoder run.
#[derive(Debug, Default)]
pub struct FfmpegProgressParser {
    duration_secs: Option<f64>,
    current: Accumulator,
}

impl FfmpegProgressParser {
    /// `duration_secs` is the source duration; without it percent stays 0
    /// until the run ends.
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| d.is_finite() && *d > 0.0),
            current: Accumulator::default(),
        }
    }

    /// Feed one line. Returns a snapshot when the line completes one.
    pub fn parse_line(&mut self, line: &str) -> Option<ProgressSnapshot> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line.starts_with("frame=") && line.contains("time=") {
            return self.parse_stats_line(line);
        }

        let (key, value) = line.split_once('=')?;
        let value = value.trim();

        match key.trim() {
            "progress" => match value {
                "continue" => Some(self.snapshot(false)),
                "end" => Some(self.snapshot(true)),
                _ => None,
            },
            key => {
                self.apply(key, value);
                None
            }
        }
    }

    fn parse_stats_line(&mut self, line: &str) -> Option<ProgressSnapshot> {
        let mut matched = false;
        for caps in STATS_FIELD.captures_iter(line) {
            let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let key = match key.as_str() {
                "time" => "out_time",
                "size" | "Lsize" => "total_size",
                other => other,
            };
            matched |= self.apply(key, value.as_str());
        }
        matched.then(|| self.snapshot(false))
    }

    /// Record one field. Returns whether it was understood.
    fn apply(&mut self, key: &str, value: &str) -> bool {
        if value.eq_ignore_ascii_case("N/A") {
            return false;
        }

        let acc = &mut self.current;
        match key {
            "frame" => set(&mut acc.frame, value.parse().ok()),
            "fps" => set(&mut acc.fps, parse_f64(value)),
            "bitrate" => set(&mut acc.bitrate_kbps, parse_f64(value.trim_end_matches("kbits/s"))),
            "total_size" => set(&mut acc.total_size, parse_size(value)),
            "out_time_us" => set(&mut acc.out_time_us, value.parse().ok()),
            // ffmpeg reports out_time_ms in microseconds as well.
            "out_time_ms" => {
                if acc.out_time_us.is_some() {
                    return true;
                }
                set(&mut acc.out_time_us, value.parse().ok())
            }
            "out_time" => set(&mut acc.out_time_us, parse_timestamp_us(value)),
            "speed" => set(&mut acc.speed, parse_f64(value.trim_end_matches('x'))),
            _ => false,
        }
    }

    fn snapshot(&self, finished: bool) -> ProgressSnapshot {
        let acc = &self.current;
        let mut snapshot = ProgressSnapshot::new(ProgressUnit::Frames);

        let out_secs = acc.out_time_us.map(|us| us as f64 / 1_000_000.0);

        snapshot.percent = if finished {
            100.0
        } else {
            match (out_secs, self.duration_secs) {
                (Some(out), Some(duration)) => {
                    (out / duration * 100.0).clamp(0.0, MAX_RUNNING_PERCENT)
                }
                _ => 0.0,
            }
        };

        snapshot.frame = acc.frame;
        snapshot.processed = acc.frame;
        snapshot.fps = acc.fps;
        snapshot.speed = acc.speed;
        snapshot.rate = acc.speed;
        snapshot.bitrate_kbps = acc.bitrate_kbps;
        snapshot.total_size = acc.total_size;
        snapshot.out_time_ms = acc.out_time_us.map(|us| us / 1_000);

        if let (Some(duration), Some(fps)) = (self.duration_secs, acc.fps)
            && fps > 0.0
        {
            snapshot.total = Some((duration * fps).round() as u64);
        }

        if let (Some(duration), Some(out), Some(speed)) = (self.duration_secs, out_secs, acc.speed)
            && speed > 0.0
        {
            snapshot.eta_secs = Some(if finished {
                0.0
            } else {
                (duration - out).max(0.0) / speed
            });
        }

        snapshot
    }
}

fn set<T>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(v) => {
            *slot = Some(v);
            true
        }
        None => false,
    }
}

fn parse_f64(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// `1024kB` (stats line) or plain bytes (progress stream).
fn parse_size(value: &str) -> Option<u64> {
    let lower = value.to_ascii_lowercase();
    if let Some(kb) = lower.strip_suffix("kib").or_else(|| lower.strip_suffix("kb")) {
        return kb.trim().parse::<u64>().ok().map(|v| v * 1024);
    }
    if let Some(mb) = lower.strip_suffix("mib").or_else(|| lower.strip_suffix("mb")) {
        return mb.trim().parse::<u64>().ok().map(|v| v * 1024 * 1024);
    }
    lower.strip_suffix('b').unwrap_or(&lower).parse().ok()
}

/// `HH:MM:SS(.fraction)` to microseconds. Negative timestamps, which ffmpeg
/// prints before the first packet, are rejected.
fn parse_timestamp_us(value: &str) -> Option<u64> {
    if value.starts_with('-') {
        return None;
    }
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let whole = hours
        .checked_mul(3600)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_mul(1_000_000)?;
    let fraction = (seconds * 1_000_000.0).round();
    if fraction >= u64::MAX as f64 {
        return None;
    }
    whole.checked_add(fraction as u64)
}
