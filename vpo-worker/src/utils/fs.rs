//! Filesystem helpers shared by the safety manager and executors.
//!
//! These helpers attach operation + path context to IO errors and classify
//! errno values so job errors say *why* a move or promote failed.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::{Error, Result};

/// Highest `(N)` suffix tried before giving up on a unique name.
pub const MAX_UNIQUE_ATTEMPTS: u32 = 10_000;

/// Coarse classification of filesystem failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCategory {
    DiskFull,
    PermissionDenied,
    NotFound,
    CrossDevice,
    ReadOnly,
    Io,
}

impl IoCategory {
    pub fn of(err: &io::Error) -> Self {
        if let Some(category) = err.raw_os_error().and_then(errno_category) {
            return category;
        }
        match err.kind() {
            io::ErrorKind::StorageFull => Self::DiskFull,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::CrossesDevices => Self::CrossDevice,
            io::ErrorKind::ReadOnlyFilesystem => Self::ReadOnly,
            _ => Self::Io,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DiskFull => "disk full",
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "not found",
            Self::CrossDevice => "cross-device",
            Self::ReadOnly => "read-only filesystem",
            Self::Io => "I/O error",
        }
    }
}

impl fmt::Display for IoCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(unix)]
fn errno_category(code: i32) -> Option<IoCategory> {
    // Values shared by Linux and the BSDs; EDQUOT differs.
    const EDQUOT: i32 = if cfg!(target_os = "linux") { 122 } else { 69 };
    match code {
        28 | EDQUOT => Some(IoCategory::DiskFull),
        1 | 13 => Some(IoCategory::PermissionDenied),
        2 => Some(IoCategory::NotFound),
        18 => Some(IoCategory::CrossDevice),
        30 => Some(IoCategory::ReadOnly),
        5 => Some(IoCategory::Io),
        _ => None,
    }
}

#[cfg(windows)]
fn errno_category(code: i32) -> Option<IoCategory> {
    // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL, ERROR_NOT_SAME_DEVICE
    match code {
        39 | 112 => Some(IoCategory::DiskFull),
        17 => Some(IoCategory::CrossDevice),
        _ => None,
    }
}

#[cfg(not(any(unix, windows)))]
fn errno_category(_code: i32) -> Option<IoCategory> {
    None
}

/// Whether a rename failed because source and target are on different filesystems.
pub fn is_cross_device(err: &io::Error) -> bool {
    IoCategory::of(err) == IoCategory::CrossDevice
}

/// Convert an IO error into an application error with operation + path context.
///
/// Out-of-space errors become [`Error::Resource`]; everything else keeps the
/// IO source and is prefixed with its category.
pub fn io_error(op: &'static str, path: &Path, source: io::Error) -> Error {
    let category = IoCategory::of(&source);
    match category {
        IoCategory::DiskFull => Error::resource(format!(
            "{} while {} {}: {}",
            category,
            op,
            path.display(),
            source
        )),
        _ => Error::io_path(op, path, io::Error::new(source.kind(), format!("{category}: {source}"))),
    }
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| io_error("creating directory", path, e))
}

/// Blocking variant of [`ensure_dir_all`], for startup code outside the runtime.
pub fn ensure_dir_all_sync(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error("creating directory", path, e))
}

/// `Ok(true)` if something exists at `path` (without following a final symlink).
pub async fn path_exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error("checking", path, e)),
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error("removing file", path, e)),
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub async fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error("removing directory", path, e)),
    }
}

/// Copy `src` to `dst` and check the byte count matches the source size.
/// A short copy is removed before returning the error.
pub async fn copy_verified(src: &Path, dst: &Path) -> Result<u64> {
    let expected = fs::metadata(src)
        .await
        .map_err(|e| io_error("reading metadata of", src, e))?
        .len();

    let copied = match fs::copy(src, dst).await {
        Ok(n) => n,
        Err(e) => {
            let _ = fs::remove_file(dst).await;
            return Err(io_error("copying to", dst, e));
        }
    };

    let actual = fs::metadata(dst)
        .await
        .map_err(|e| io_error("reading metadata of", dst, e))?
        .len();

    if copied != expected || actual != expected {
        let _ = fs::remove_file(dst).await;
        return Err(Error::execution(format!(
            "integrity check failed for {}: expected {} bytes, found {}",
            dst.display(),
            expected,
            actual
        )));
    }
    Ok(actual)
}

/// Rename `from` to `to`, failing with `AlreadyExists` instead of replacing
/// an existing `to`.
///
/// Implemented as hard link plus unlink. Filesystems without hard links get an
/// existence check followed by a plain rename.
pub async fn rename_no_replace(from: &Path, to: &Path) -> io::Result<()> {
    match fs::hard_link(from, to).await {
        Ok(()) => fs::remove_file(from).await,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists || is_cross_device(&e) => Err(e),
        Err(_) => {
            if fs::try_exists(to).await? {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            fs::rename(from, to).await
        }
    }
}

/// Insert `suffix` between the file stem and the extension.
pub fn with_stem_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    };
    path.with_file_name(name)
}

/// First free path among `path`, `name (1).ext`, `name (2).ext`, ...
pub async fn unique_path(path: &Path) -> Result<PathBuf> {
    if !path_exists(path).await? {
        return Ok(path.to_path_buf());
    }
    for n in 1..=MAX_UNIQUE_ATTEMPTS {
        let candidate = with_stem_suffix(path, &format!(" ({n})"));
        if !path_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(Error::resource(format!(
        "no free name for {} after {} attempts",
        path.display(),
        MAX_UNIQUE_ATTEMPTS
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_rename_no_replace_keeps_existing_target() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a.mkv");
        let to = dir.path().join("b.mkv");
        std::fs::write(&from, b"new").unwrap();
        std::fs::write(&to, b"existing").unwrap();

        let err = rename_no_replace(&from, &to).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&to).unwrap(), b"existing");
        assert_eq!(std::fs::read(&from).unwrap(), b"new");

        std::fs::remove_file(&to).unwrap();
        rename_no_replace(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"new");
    }

    #[test]
    fn test_io_category_from_kind() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(IoCategory::of(&err), IoCategory::PermissionDenied);
        let err = io::Error::new(io::ErrorKind::Other, "?");
        assert_eq!(IoCategory::of(&err), IoCategory::Io);
    }

    #[cfg(unix)]
    #[test]
    fn test_io_category_from_errno() {
        assert_eq!(
            IoCategory::of(&io::Error::from_raw_os_error(28)),
            IoCategory::DiskFull
        );
        assert_eq!(
            IoCategory::of(&io::Error::from_raw_os_error(18)),
            IoCategory::CrossDevice
        );
        assert_eq!(
            IoCategory::of(&io::Error::from_raw_os_error(30)),
            IoCategory::ReadOnly
        );
        assert!(is_cross_device(&io::Error::from_raw_os_error(18)));
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_full_becomes_resource_error() {
        let err = io_error("writing", Path::new("/x"), io::Error::from_raw_os_error(28));
        assert!(matches!(err, Error::Resource(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_io_error_mentions_category() {
        let err = io_error(
            "renaming",
            Path::new("/x"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("renaming"));
    }

    #[test]
    fn test_with_stem_suffix() {
        assert_eq!(
            with_stem_suffix(Path::new("/m/movie.mkv"), ".original"),
            PathBuf::from("/m/movie.original.mkv")
        );
        assert_eq!(
            with_stem_suffix(Path::new("/m/README"), " (2)"),
            PathBuf::from("/m/README (2)")
        );
    }

    #[tokio::test]
    async fn test_unique_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.mkv");
        assert_eq!(unique_path(&path).await.unwrap(), path);

        std::fs::write(&path, b"a").unwrap();
        std::fs::write(dir.path().join("movie (1).mkv"), b"b").unwrap();
        assert_eq!(
            unique_path(&path).await.unwrap(),
            dir.path().join("movie (2).mkv")
        );
    }

    #[tokio::test]
    async fn test_copy_verified() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.bin");
        let dst = dir.path().join("b.bin");
        std::fs::write(&src, vec![7u8; 4096]).unwrap();

        assert_eq!(copy_verified(&src, &dst).await.unwrap(), 4096);
        assert_eq!(std::fs::read(&dst).unwrap(), vec![7u8; 4096]);
    }

    #[tokio::test]
    async fn test_remove_helpers_ignore_missing() {
        let dir = TempDir::new().unwrap();
        remove_file_if_exists(&dir.path().join("missing")).await.unwrap();
        remove_dir_all_if_exists(&dir.path().join("missing-dir"))
            .await
            .unwrap();
    }
}
