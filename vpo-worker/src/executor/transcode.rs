//! Transcode executor: re-encode video to a target codec and resolution cap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::command::run_ffmpeg_with_progress;
use super::move_file::{MoveExecutor, RelocateOptions};
use super::probe::{FfprobeProbe, MediaInfo, MediaProbe};
use super::resource::{DiskSpace, DiskSpaceStatus, SystemDiskSpace, estimate_transcode_bytes, parse_bitrate_bps};
use super::template::{TemplateContext, render_path};
use super::{ExecutionContext, ExecutionOutcome, Executor};
use crate::database::models::JobType;
use crate::jobs::Job;
use crate::safety::SafetyManager;
use crate::utils::filename::EMPTY_COMPONENT;
use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Reason recorded when a source already meets the target.
pub const SKIP_ALREADY_COMPLIANT: &str = "already compliant";

/// Target video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VideoCodec {
    #[serde(alias = "h265", alias = "x265")]
    Hevc,
    #[serde(alias = "avc", alias = "x264")]
    H264,
    Vp9,
    Av1,
}

impl VideoCodec {
    /// Names a probed codec may carry for this family.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Hevc => &["hevc", "h265", "x265"],
            Self::H264 => &["h264", "avc", "x264"],
            Self::Vp9 => &["vp9", "vp09"],
            Self::Av1 => &["av1", "av01"],
        }
    }

    /// Whether a probed codec name belongs to this family.
    pub fn matches(&self, codec: &str) -> bool {
        let codec = codec.to_ascii_lowercase();
        self.aliases().iter().any(|alias| codec.contains(alias))
    }

    pub fn encoder(&self) -> &'static str {
        match self {
            Self::Hevc => "libx265",
            Self::H264 => "libx264",
            Self::Vp9 => "libvpx-vp9",
            Self::Av1 => "libaom-av1",
        }
    }

    pub fn default_crf(&self) -> u8 {
        match self {
            Self::Hevc => 28,
            Self::H264 => 23,
            Self::Vp9 => 31,
            Self::Av1 => 30,
        }
    }

    /// Family for a codec name or alias.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        [Self::Hevc, Self::H264, Self::Vp9, Self::Av1]
            .into_iter()
            .find(|codec| codec.aliases().contains(&name.as_str()))
    }

    fn takes_preset(&self) -> bool {
        matches!(self, Self::Hevc | Self::H264)
    }
}

/// Named resolution caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxResolution {
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "4k", alias = "4K", alias = "2160p")]
    K4,
    #[serde(rename = "8k", alias = "8K", alias = "4320p")]
    K8,
}

impl MaxResolution {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::P480 => (854, 480),
            Self::P720 => (1280, 720),
            Self::P1080 => (1920, 1080),
            Self::P1440 => (2560, 1440),
            Self::K4 => (3840, 2160),
            Self::K8 => (7680, 4320),
        }
    }
}

/// Extra conditions under which a source is left alone. Every condition
/// that is set must hold. A value the probe could not determine passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipConditions {
    /// Probed codec matches one of these names or their family.
    #[serde(default)]
    pub codec_matches: Option<Vec<String>>,
    /// Probed resolution fits inside this cap.
    #[serde(default)]
    pub resolution_within: Option<MaxResolution>,
    /// Probed bitrate is below this value, e.g. `"10M"`.
    #[serde(default)]
    pub bitrate_under: Option<String>,
}

impl SkipConditions {
    pub fn validate(&self) -> Result<()> {
        if self.codec_matches.is_none()
            && self.resolution_within.is_none()
            && self.bitrate_under.is_none()
        {
            return Err(Error::validation(
                "skip_if needs at least one of codec_matches, resolution_within or bitrate_under",
            ));
        }
        if let Some(bitrate) = &self.bitrate_under
            && parse_bitrate_bps(bitrate).is_none()
        {
            return Err(Error::validation(format!("invalid skip_if.bitrate_under: {}", bitrate)));
        }
        Ok(())
    }

    /// Reason to skip `info`, or `None` when some condition fails.
    pub fn evaluate(&self, info: &MediaInfo) -> Option<String> {
        let mut reasons = Vec::new();

        if let Some(names) = &self.codec_matches {
            let codec = info.video_codec.as_deref()?;
            let matched = names.iter().any(|name| match VideoCodec::from_name(name) {
                Some(family) => family.matches(codec),
                None => name.eq_ignore_ascii_case(codec),
            });
            if !matched {
                return None;
            }
            reasons.push(format!("codec is {}", codec));
        }

        if let Some(cap) = self.resolution_within {
            let (max_w, max_h) = cap.dimensions();
            if let (Some(w), Some(h)) = (info.width, info.height) {
                if w > max_w || h > max_h {
                    return None;
                }
                reasons.push(format!("resolution {}x{} within cap", w, h));
            }
        }

        if let Some(threshold) = &self.bitrate_under {
            let limit = parse_bitrate_bps(threshold)?;
            if let Some(bitrate) = info.bitrate {
                if bitrate >= limit {
                    return None;
                }
                reasons.push(format!("bitrate under {}", threshold));
            }
        }

        Some(if reasons.is_empty() {
            "skip conditions met".to_string()
        } else {
            format!("{}: {}", SKIP_ALREADY_COMPLIANT, reasons.join(", "))
        })
    }
}

fn default_codec() -> VideoCodec {
    VideoCodec::Hevc
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

fn default_true() -> bool {
    true
}

/// Configuration of a transcode job, read from `policy_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    #[serde(default = "default_codec")]
    pub target_video_codec: VideoCodec,

    /// Constant rate factor, 0 to 51. Takes precedence over `target_bitrate`.
    #[serde(default)]
    pub target_crf: Option<u8>,

    /// Target video bitrate, e.g. `"5M"`.
    #[serde(default)]
    pub target_bitrate: Option<String>,

    #[serde(default)]
    pub max_resolution: Option<MaxResolution>,
    #[serde(default)]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub max_height: Option<u32>,

    /// Audio codecs copied as-is. Empty means every track is copied.
    #[serde(default)]
    pub audio_preserve_codecs: Vec<String>,
    #[serde(default = "default_audio_codec")]
    pub audio_transcode_to: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_transcode_bitrate: String,

    #[serde(default)]
    pub preset: Option<String>,

    #[serde(default = "default_true")]
    pub backup_original: bool,

    /// Where the result goes. Defaults to replacing the source.
    #[serde(default)]
    pub output_path: Option<PathBuf>,

    /// Pre-probed source info; skips the probe when present.
    #[serde(default)]
    pub source: Option<MediaInfo>,

    #[serde(default)]
    pub skip_if: Option<SkipConditions>,

    /// Directory template the finished output is moved into, e.g.
    /// `"{year}/{title}"`. Relative to `destination_base`, or to the
    /// source's directory.
    #[serde(default, alias = "destination_template")]
    pub destination: Option<String>,
    #[serde(default)]
    pub destination_base: Option<PathBuf>,
    #[serde(default = "default_destination_fallback")]
    pub destination_fallback: String,
    /// Placeholder values for `destination`.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_destination_fallback() -> String {
    EMPTY_COMPONENT.to_string()
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            target_video_codec: default_codec(),
            target_crf: None,
            target_bitrate: None,
            max_resolution: None,
            max_width: None,
            max_height: None,
            audio_preserve_codecs: Vec::new(),
            audio_transcode_to: default_audio_codec(),
            audio_transcode_bitrate: default_audio_bitrate(),
            preset: None,
            backup_original: true,
            output_path: None,
            source: None,
            skip_if: None,
            destination: None,
            destination_base: None,
            destination_fallback: default_destination_fallback(),
            metadata: HashMap::new(),
        }
    }
}

impl TranscodeConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(crf) = self.target_crf
            && crf > 51
        {
            return Err(Error::validation(format!(
                "target_crf must be between 0 and 51, got {}",
                crf
            )));
        }
        if let Some(bitrate) = &self.target_bitrate
            && parse_bitrate_bps(bitrate).is_none()
        {
            return Err(Error::validation(format!("invalid target_bitrate: {}", bitrate)));
        }
        if self.max_width == Some(0) || self.max_height == Some(0) {
            return Err(Error::validation("max_width and max_height must be positive"));
        }
        if self.audio_transcode_to.trim().is_empty() {
            return Err(Error::validation("audio_transcode_to must not be empty"));
        }
        if let Some(skip_if) = &self.skip_if {
            skip_if.validate()?;
        }
        Ok(())
    }

    /// Directory the output is moved into, if a destination is configured.
    pub fn destination_dir(&self, source: &Path) -> Option<PathBuf> {
        let template = self.destination.as_deref().filter(|t| !t.trim().is_empty())?;
        let fallbacks = HashMap::new();
        let ctx = TemplateContext {
            metadata: &self.metadata,
            fallbacks: &fallbacks,
            fallback: &self.destination_fallback,
        };
        let base = match &self.destination_base {
            Some(base) => base.clone(),
            None => source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        Some(base.join(render_path(template, &ctx)))
    }

    /// Resolution cap, from `max_resolution` or the explicit bounds.
    pub fn max_dimensions(&self) -> Option<(u32, u32)> {
        if let Some(resolution) = self.max_resolution {
            return Some(resolution.dimensions());
        }
        match (self.max_width, self.max_height) {
            (None, None) => None,
            (w, h) => Some((w.unwrap_or(u32::MAX), h.unwrap_or(u32::MAX))),
        }
    }

    fn preserves_audio(&self, codec: &str) -> bool {
        self.audio_preserve_codecs.is_empty()
            || self
                .audio_preserve_codecs
                .iter()
                .any(|c| c.eq_ignore_ascii_case(codec))
    }
}

/// What has to happen to the video stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPlan {
    pub codec_compliant: bool,
    /// Target dimensions when the source exceeds the cap.
    pub scale: Option<(u32, u32)>,
    /// Set when `skip_if` holds for the source.
    pub skip_reason: Option<String>,
}

impl VideoPlan {
    pub fn is_compliant(&self) -> bool {
        self.codec_compliant && self.scale.is_none()
    }

    /// Why the source is left untouched, if it is.
    pub fn skip(&self) -> Option<&str> {
        if self.is_compliant() {
            Some(SKIP_ALREADY_COMPLIANT)
        } else {
            self.skip_reason.as_deref()
        }
    }
}

/// Compare the source against the target.
pub fn plan_video(config: &TranscodeConfig, info: &MediaInfo) -> Result<VideoPlan> {
    let codec = info
        .video_codec
        .as_deref()
        .ok_or_else(|| Error::validation("source has no video stream"))?;

    let scale = match (config.max_dimensions(), info.width, info.height) {
        (Some((max_w, max_h)), Some(w), Some(h)) if w > 0 && h > 0 && (w > max_w || h > max_h) => {
            Some(scaled_dimensions(w, h, max_w, max_h))
        }
        _ => None,
    };

    Ok(VideoPlan {
        codec_compliant: config.target_video_codec.matches(codec),
        scale,
        skip_reason: config.skip_if.as_ref().and_then(|skip_if| skip_if.evaluate(info)),
    })
}

/// Fit `w`x`h` inside the cap keeping the aspect ratio, rounded down to even.
fn scaled_dimensions(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    let (w64, h64) = (u64::from(w), u64::from(h));
    let (max_w64, max_h64) = (u64::from(max_w), u64::from(max_h));

    let (tw, th) = if max_w64 * h64 <= max_h64 * w64 {
        (max_w64, h64 * max_w64 / w64)
    } else {
        (w64 * max_h64 / h64, max_h64)
    };

    let even = |v: u64| ((v - v % 2).max(2)) as u32;
    (even(tw), even(th))
}

/// Full ffmpeg argument list, output path last.
pub fn build_ffmpeg_args(
    source: &Path,
    output: &Path,
    config: &TranscodeConfig,
    info: &MediaInfo,
    plan: &VideoPlan,
    cpu_cores: Option<u32>,
) -> Vec<String> {
    let codec = config.target_video_codec;
    let mut args: Vec<String> = [
        "-y", "-hide_banner", "-nostats", "-loglevel", "error", "-progress", "pipe:1", "-i",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(source.to_string_lossy().into_owned());
    args.extend(["-map".to_string(), "0".to_string()]);

    args.extend(["-c:v".to_string(), codec.encoder().to_string()]);
    match (config.target_crf, &config.target_bitrate) {
        (Some(crf), _) => args.extend(["-crf".to_string(), crf.to_string()]),
        (None, Some(bitrate)) => args.extend(["-b:v".to_string(), bitrate.clone()]),
        (None, None) => args.extend(["-crf".to_string(), codec.default_crf().to_string()]),
    }
    if codec.takes_preset() {
        let preset = config.preset.as_deref().unwrap_or("medium");
        args.extend(["-preset".to_string(), preset.to_string()]);
    }
    if let Some((w, h)) = plan.scale {
        args.extend(["-vf".to_string(), format!("scale={}:{}", w, h)]);
    }

    if info.audio_tracks.is_empty() {
        args.extend(["-c:a".to_string(), "copy".to_string()]);
    }
    for track in &info.audio_tracks {
        let stream = track.index;
        if config.preserves_audio(&track.codec) {
            args.extend([format!("-c:a:{}", stream), "copy".to_string()]);
        } else {
            args.extend([
                format!("-c:a:{}", stream),
                config.audio_transcode_to.clone(),
                format!("-b:a:{}", stream),
                config.audio_transcode_bitrate.clone(),
            ]);
        }
    }

    args.extend(["-c:s".to_string(), "copy".to_string()]);
    if let Some(cores) = cpu_cores {
        args.extend(["-threads".to_string(), cores.to_string()]);
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

/// Re-encodes media with ffmpeg through a crash-safe temp output.
pub struct TranscodeExecutor {
    ffmpeg_path: PathBuf,
    probe: Arc<dyn MediaProbe>,
    disk_space: Arc<dyn DiskSpace>,
}

impl TranscodeExecutor {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            probe: Arc::new(FfprobeProbe::default()),
            disk_space: Arc::new(SystemDiskSpace),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn MediaProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_disk_space(mut self, disk_space: Arc<dyn DiskSpace>) -> Self {
        self.disk_space = disk_space;
        self
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg_path
    }

    /// Move a promoted output into `dir`, keeping its file name and never
    /// replacing an existing file.
    async fn relocate_output(
        &self,
        job_id: &str,
        output: &Path,
        dir: &Path,
        size: u64,
        ctx: &ExecutionContext,
    ) -> Result<PathBuf> {
        let file_name = output.file_name().ok_or_else(|| {
            Error::validation(format!("output has no file name: {}", output.display()))
        })?;
        let dest = dir.join(file_name);
        if dest == output {
            return Ok(dest);
        }
        let options = RelocateOptions {
            create_directories: true,
            overwrite: false,
        };
        let (dest, _) = MoveExecutor::new()
            .with_disk_space(self.disk_space.clone())
            .relocate(job_id, output, dest, size, options, ctx)
            .await?;
        Ok(dest)
    }
}

async fn validate_source(source: &Path) -> Result<u64> {
    let meta = match tokio::fs::metadata(source).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::validation(format!(
                "source file not found: {}",
                source.display()
            )));
        }
        Err(e) => return Err(io_error("reading metadata of", source, e)),
    };
    if !meta.is_file() {
        return Err(Error::validation(format!(
            "source is not a regular file: {}",
            source.display()
        )));
    }
    tokio::fs::File::open(source)
        .await
        .map_err(|e| io_error("opening", source, e))?;
    Ok(meta.len())
}

#[async_trait]
impl Executor for TranscodeExecutor {
    fn job_type(&self) -> JobType {
        JobType::Transcode
    }

    fn name(&self) -> &'static str {
        "transcode"
    }

    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<ExecutionOutcome> {
        let config: TranscodeConfig = job.config()?;
        config.validate()?;

        let source = job.file_path.as_path();
        let input_size = validate_source(source).await?;

        let info = match &config.source {
            Some(info) => info.clone(),
            None => self.probe.probe(source).await?,
        };
        let plan = plan_video(&config, &info)?;

        if let Some(reason) = plan.skip() {
            info!(
                job_id = %job.id,
                codec = info.video_codec.as_deref().unwrap_or_default(),
                reason,
                "Source already compliant, skipping"
            );
            return Ok(ExecutionOutcome::skipped(
                reason,
                json!({
                    "skipped": reason,
                    "video_codec": info.video_codec,
                    "width": info.width,
                    "height": info.height,
                    "bitrate": info.bitrate,
                }),
            ));
        }

        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let final_path = config
            .output_path
            .clone()
            .unwrap_or_else(|| source.to_path_buf());
        let safety = SafetyManager::new(ctx.temp_root.clone());
        let temp = safety.with_temp_output(&job.id, source, &final_path).await?;

        let target_bps = config.target_bitrate.as_deref().and_then(parse_bitrate_bps);
        let required = estimate_transcode_bytes(
            info.duration_secs,
            target_bps,
            input_size,
            &config.target_video_codec.to_string(),
        );
        if let DiskSpaceStatus::InsufficientSpace {
            available_bytes,
            required_bytes,
        } = self.disk_space.check(temp.temp_dir(), required)
        {
            return Err(Error::resource(format!(
                "insufficient disk space for transcode: {} bytes required, {} available",
                required_bytes, available_bytes
            )));
        }

        let args = build_ffmpeg_args(source, temp.path(), &config, &info, &plan, ctx.cpu_cores);
        info!(
            job_id = %job.id,
            source = %source.display(),
            codec = %config.target_video_codec,
            scale = ?plan.scale,
            "Starting transcode"
        );

        let run = run_ffmpeg_with_progress(
            &self.ffmpeg_path,
            &args,
            info.duration_secs,
            &ctx.progress,
            &ctx.cancel,
        )
        .await?;

        if !run.status.success() {
            return Err(Error::execution(run.failure_message("ffmpeg")));
        }

        let output_size = match tokio::fs::metadata(temp.path()).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            Ok(_) => return Err(Error::execution("encoder produced an empty output file")),
            Err(e) => {
                return Err(Error::execution(format!(
                    "encoder output missing at {}: {}",
                    temp.path().display(),
                    e
                )));
            }
        };

        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let promoted = temp.promote(config.backup_original).await?;
        debug!(job_id = %job.id, ?promoted, "Transcode promoted");

        let mut summary = json!({
            "from_codec": info.video_codec,
            "to_codec": config.target_video_codec.to_string(),
            "scale": plan.scale.map(|(w, h)| format!("{}x{}", w, h)),
            "input_bytes": input_size,
            "output_bytes": output_size,
            "elapsed_secs": run.elapsed.as_secs_f64(),
        });

        let mut output_path = promoted.output_path;
        if let Some(dir) = config.destination_dir(source) {
            match self
                .relocate_output(&job.id, &output_path, &dir, output_size, ctx)
                .await
            {
                Ok(moved) => {
                    info!(job_id = %job.id, destination = %moved.display(), "Moved output to destination");
                    summary["moved_from"] = json!(output_path.display().to_string());
                    output_path = moved;
                }
                // The encode itself succeeded; the output stays where it is.
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, output = %output_path.display(), "Destination move failed");
                    summary["destination_error"] = json!(e.to_string());
                }
            }
        }

        Ok(ExecutionOutcome {
            output_path: Some(output_path),
            backup_path: promoted.backup_path,
            skipped: None,
            summary,
        })
    }
}
