//! Source media inspection.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use process_utils::tokio_command;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// One audio stream of the source, numbered among audio streams only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub index: u32,
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
}

/// What the transcode executor needs to know about a source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    /// Overall bitrate in bits per second.
    #[serde(default)]
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub audio_tracks: Vec<AudioTrack>,
}

/// Source of [`MediaInfo`]. Swappable so tests do not need ffprobe.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;
}

/// `ffprobe -print_format json` backed probe.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe_path: PathBuf,
}

impl FfprobeProbe {
    pub fn new(ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        debug!(file = %path.display(), "Probing source");
        let output = tokio_command(&self.ffprobe_path)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::resource(format!(
                        "ffprobe not found: {}",
                        self.ffprobe_path.display()
                    ))
                } else {
                    Error::execution(format!("failed to run ffprobe: {}", e))
                }
            })?;

        if !output.status.success() {
            return Err(Error::execution(format!(
                "ffprobe failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_ffprobe_json(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    channels: Option<u32>,
    #[serde(default)]
    disposition: Option<ProbeDisposition>,
}

#[derive(Deserialize)]
struct ProbeDisposition {
    #[serde(default)]
    attached_pic: u8,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

/// Parse `ffprobe -show_format -show_streams` JSON.
pub fn parse_ffprobe_json(json: &str) -> Result<MediaInfo> {
    let parsed: ProbeOutput = serde_json::from_str(json)?;
    let mut info = MediaInfo::default();

    let mut audio_index = 0;
    for stream in parsed.streams {
        match stream.codec_type.as_deref() {
            Some("video") if info.video_codec.is_none() => {
                // Cover art shows up as a video stream; skip it.
                if stream.disposition.is_some_and(|d| d.attached_pic == 1) {
                    continue;
                }
                info.video_codec = stream.codec_name;
                info.width = stream.width;
                info.height = stream.height;
            }
            Some("audio") => {
                info.audio_tracks.push(AudioTrack {
                    index: audio_index,
                    codec: stream.codec_name.unwrap_or_default(),
                    channels: stream.channels,
                });
                audio_index += 1;
            }
            _ => {}
        }
    }

    if let Some(format) = parsed.format {
        info.duration_secs = format
            .duration
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0);
        info.bitrate = format.bit_rate.and_then(|b| b.parse().ok());
    }

    Ok(info)
}
