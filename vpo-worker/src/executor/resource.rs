//! Disk space pre-flight checks.

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::{debug, warn};

/// Headroom applied to every size estimate.
pub const SAFETY_MARGIN: f64 = 1.2;

/// Result of a disk space check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSpaceStatus {
    /// Sufficient space available.
    Ok { available_bytes: u64 },
    /// Insufficient space.
    InsufficientSpace {
        available_bytes: u64,
        required_bytes: u64,
    },
    /// Could not determine disk space. Does not block the job.
    Unknown,
}

impl DiskSpaceStatus {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, DiskSpaceStatus::InsufficientSpace { .. })
    }
}

/// Free-space lookup, swappable for tests.
pub trait DiskSpace: Send + Sync {
    /// Available bytes on the filesystem holding `path`, if known.
    fn available_bytes(&self, path: &Path) -> Option<u64>;

    fn check(&self, path: &Path, required_bytes: u64) -> DiskSpaceStatus {
        match self.available_bytes(path) {
            Some(available_bytes) if available_bytes >= required_bytes => {
                debug!(
                    available_bytes,
                    required_bytes,
                    path = %path.display(),
                    "Disk space OK"
                );
                DiskSpaceStatus::Ok { available_bytes }
            }
            Some(available_bytes) => {
                warn!(
                    available_bytes,
                    required_bytes,
                    path = %path.display(),
                    "Insufficient disk space"
                );
                DiskSpaceStatus::InsufficientSpace {
                    available_bytes,
                    required_bytes,
                }
            }
            None => {
                warn!(path = %path.display(), "Could not determine disk space");
                DiskSpaceStatus::Unknown
            }
        }
    }
}

/// `sysinfo` backed lookup: the disk with the longest mount point that
/// contains the path wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskSpace;

impl DiskSpace for SystemDiskSpace {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let path = existing_ancestor(path);
        let disks = Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Nearest existing ancestor, canonicalized, so not-yet-created temp
/// directories resolve to the disk they will live on.
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if let Ok(resolved) = std::fs::canonicalize(candidate) {
            return resolved;
        }
        current = candidate.parent();
    }
    path.to_path_buf()
}

/// Parse an ffmpeg-style bitrate: `"5M"`, `"800k"`, `"2.5m"`, `"128000"`.
pub fn parse_bitrate_bps(value: &str) -> Option<u64> {
    let value = value.trim();
    let (number, multiplier) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 1_000.0),
        'm' | 'M' => (&value[..value.len() - 1], 1_000_000.0),
        'g' | 'G' => (&value[..value.len() - 1], 1_000_000_000.0),
        _ => (value, 1.0),
    };
    let parsed: f64 = number.trim().parse().ok()?;
    (parsed.is_finite() && parsed > 0.0).then(|| (parsed * multiplier).round() as u64)
}

/// Expected output size of a transcode, with headroom.
///
/// Prefers `duration × bitrate`; otherwise scales the input size by how well
/// the target codec compresses.
pub fn estimate_transcode_bytes(
    duration_secs: Option<f64>,
    target_bitrate_bps: Option<u64>,
    input_size: u64,
    target_codec: &str,
) -> u64 {
    if let (Some(duration), Some(bps)) = (duration_secs, target_bitrate_bps)
        && duration > 0.0
    {
        return (duration * bps as f64 / 8.0 * SAFETY_MARGIN).ceil() as u64;
    }

    let ratio = match target_codec {
        "hevc" | "av1" => 0.5,
        _ => 0.8,
    };
    (input_size as f64 * ratio * SAFETY_MARGIN).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<u64>);

    impl DiskSpace for Fixed {
        fn available_bytes(&self, _path: &Path) -> Option<u64> {
            self.0
        }
    }

    #[test]
    fn test_check_statuses() {
        let path = Path::new("/data");
        assert_eq!(
            Fixed(Some(100)).check(path, 50),
            DiskSpaceStatus::Ok {
                available_bytes: 100
            }
        );
        assert!(Fixed(Some(10)).check(path, 50).is_insufficient());
        assert_eq!(Fixed(None).check(path, 50), DiskSpaceStatus::Unknown);
    }

    #[test]
    fn test_parse_bitrate() {
        assert_eq!(parse_bitrate_bps("5M"), Some(5_000_000));
        assert_eq!(parse_bitrate_bps("800k"), Some(800_000));
        assert_eq!(parse_bitrate_bps("2.5m"), Some(2_500_000));
        assert_eq!(parse_bitrate_bps("128000"), Some(128_000));
        assert_eq!(parse_bitrate_bps(""), None);
        assert_eq!(parse_bitrate_bps("fast"), None);
        assert_eq!(parse_bitrate_bps("-1M"), None);
    }

    #[test]
    fn test_estimate_from_bitrate() {
        // 100 s at 8 Mbit/s = 100 MB, plus 20%.
        assert_eq!(
            estimate_transcode_bytes(Some(100.0), Some(8_000_000), 0, "hevc"),
            120_000_000
        );
    }

    #[test]
    fn test_estimate_from_input_size() {
        assert_eq!(estimate_transcode_bytes(None, None, 1_000, "hevc"), 600);
        assert_eq!(estimate_transcode_bytes(None, None, 1_000, "h264"), 960);
        assert_eq!(
            estimate_transcode_bytes(Some(100.0), None, 1_000, "av1"),
            600
        );
    }

    #[test]
    fn test_system_disk_space_for_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let not_yet_created = dir.path().join("a/b/c");
        // Most CI hosts report mounts; when none match the lookup is None.
        if let Some(bytes) = SystemDiskSpace.available_bytes(&not_yet_created) {
            assert!(bytes > 0);
        }
    }
}
