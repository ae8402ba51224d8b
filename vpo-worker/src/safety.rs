//! Crash-safe output handling.
//!
//! Executors never write to a final path directly. They write into a
//! job-scoped temp directory and, only after the output is verified, promote
//! it: the existing file is renamed to a backup, the temp file is renamed into
//! place, and the backup is restored if that rename fails. A guard that is
//! dropped without being promoted deletes its temp directory, so the original
//! file is untouched on any error or cancellation.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::utils::fs::{
    copy_verified, ensure_dir_all, io_error, is_cross_device, path_exists,
    remove_dir_all_if_exists, rename_no_replace, with_stem_suffix, MAX_UNIQUE_ATTEMPTS,
};
use crate::{Error, Result};

const TEMP_DIR_PREFIX: &str = ".vpo-tmp-";
const TEMP_FILE_PREFIX: &str = ".vpo_temp_";
const BACKUP_SUFFIX: &str = ".original";

/// Where a promoted output ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promoted {
    pub output_path: PathBuf,
    pub backup_path: Option<PathBuf>,
}

/// Allocates job-scoped temp outputs.
#[derive(Debug, Clone, Default)]
pub struct SafetyManager {
    temp_root: Option<PathBuf>,
}

impl SafetyManager {
    /// `temp_root` of `None` puts temp directories next to the final output,
    /// which keeps the promote rename on one filesystem.
    pub fn new(temp_root: Option<PathBuf>) -> Self {
        Self { temp_root }
    }

    pub fn temp_root(&self) -> Option<&Path> {
        self.temp_root.as_deref()
    }

    /// Temp directory for `job_id` when writing towards `final_path`.
    pub fn job_temp_dir(&self, job_id: &str, final_path: &Path) -> PathBuf {
        let base = match &self.temp_root {
            Some(root) => root.clone(),
            None => final_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        base.join(format!("{TEMP_DIR_PREFIX}{job_id}"))
    }

    /// Remove leftovers of an earlier, crashed attempt of the same job,
    /// including a cross-device copy staged next to the final path.
    /// Returns whether anything was removed.
    pub async fn cleanup_stale(&self, job_id: &str, final_path: &Path) -> Result<bool> {
        let mut dirs = vec![self.job_temp_dir(job_id, final_path)];
        let staging = staging_dir(job_id, final_path);
        if !dirs.contains(&staging) {
            dirs.push(staging);
        }

        let mut removed = false;
        for dir in dirs {
            if !path_exists(&dir).await? {
                continue;
            }
            remove_dir_all_if_exists(&dir).await?;
            info!(job_id, dir = %dir.display(), "Removed stale temp directory");
            removed = true;
        }
        Ok(removed)
    }

    /// Prepare a fresh temp output for `final_path`.
    pub async fn with_temp_output(
        &self,
        job_id: &str,
        source: &Path,
        final_path: &Path,
    ) -> Result<TempOutput> {
        let file_name = final_path.file_name().ok_or_else(|| {
            Error::validation(format!("output path has no file name: {}", final_path.display()))
        })?;

        self.cleanup_stale(job_id, final_path).await?;

        let temp_dir = self.job_temp_dir(job_id, final_path);
        ensure_dir_all(&temp_dir).await?;

        let temp_path = temp_dir.join(format!(
            "{}{}",
            TEMP_FILE_PREFIX,
            file_name.to_string_lossy()
        ));
        debug!(job_id, temp = %temp_path.display(), "Allocated temp output");

        Ok(TempOutput {
            job_id: job_id.to_string(),
            source: source.to_path_buf(),
            final_path: final_path.to_path_buf(),
            temp_dir,
            temp_path,
            finished: false,
        })
    }
}

/// Scoped temp output. Deleted on drop unless promoted.
#[derive(Debug)]
pub struct TempOutput {
    job_id: String,
    source: PathBuf,
    final_path: PathBuf,
    temp_dir: PathBuf,
    temp_path: PathBuf,
    finished: bool,
}

impl TempOutput {
    /// Path the executor writes to.
    pub fn path(&self) -> &Path {
        &self.temp_path
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Move the temp file onto the final path, backing up whatever is there
    /// first when `backup` is set.
    pub async fn promote(mut self, backup: bool) -> Result<Promoted> {
        let meta = tokio::fs::metadata(&self.temp_path)
            .await
            .map_err(|e| io_error("reading temp output", &self.temp_path, e))?;
        if !meta.is_file() {
            return Err(Error::execution(format!(
                "temp output is not a file: {}",
                self.temp_path.display()
            )));
        }

        let backup_path = if backup && path_exists(&self.final_path).await? {
            let backup_path = free_backup_path(&self.final_path).await?;
            tokio::fs::rename(&self.final_path, &backup_path)
                .await
                .map_err(|e| io_error("backing up", &self.final_path, e))?;
            debug!(
                job_id = %self.job_id,
                backup = %backup_path.display(),
                "Backed up original"
            );
            Some(backup_path)
        } else {
            None
        };

        if let Err(e) = self.move_into_place().await {
            if let Some(backup_path) = &backup_path
                && let Err(restore_err) = tokio::fs::rename(backup_path, &self.final_path).await
            {
                warn!(
                    job_id = %self.job_id,
                    backup = %backup_path.display(),
                    error = %restore_err,
                    "Failed to restore backup after promote failure"
                );
            }
            return Err(e);
        }

        self.finished = true;
        if let Err(e) = remove_dir_all_if_exists(&self.temp_dir).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to remove temp directory");
        }

        info!(
            job_id = %self.job_id,
            output = %self.final_path.display(),
            "Promoted output"
        );
        Ok(Promoted {
            output_path: self.final_path.clone(),
            backup_path,
        })
    }

    /// Move the temp file onto the final path only if nothing is there yet.
    /// A file that appeared at the final path in the meantime is left alone
    /// and the promote fails.
    pub async fn promote_no_replace(mut self) -> Result<Promoted> {
        rename_no_replace(&self.temp_path, &self.final_path)
            .await
            .map_err(|e| io_error("renaming into place", &self.final_path, e))?;

        self.finished = true;
        if let Err(e) = remove_dir_all_if_exists(&self.temp_dir).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to remove temp directory");
        }
        info!(
            job_id = %self.job_id,
            output = %self.final_path.display(),
            "Promoted output"
        );
        Ok(Promoted {
            output_path: self.final_path.clone(),
            backup_path: None,
        })
    }

    async fn move_into_place(&self) -> Result<()> {
        match tokio::fs::rename(&self.temp_path, &self.final_path).await {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device(&e) => self.stage_across_devices().await,
            Err(e) => Err(io_error("renaming into place", &self.final_path, e)),
        }
    }

    /// Copy into a job temp dir on the destination filesystem, then rename,
    /// so the final step is still atomic.
    async fn stage_across_devices(&self) -> Result<()> {
        let staging = staging_dir(&self.job_id, &self.final_path);
        if staging == self.temp_dir {
            return Err(Error::execution(format!(
                "cannot stage {} onto its own temp directory",
                self.final_path.display()
            )));
        }
        ensure_dir_all(&staging).await?;
        let staged = staging.join(
            self.temp_path
                .file_name()
                .unwrap_or_else(|| OsStr::new(".vpo_temp_output")),
        );

        let result = async {
            copy_verified(&self.temp_path, &staged).await?;
            tokio::fs::rename(&staged, &self.final_path)
                .await
                .map_err(|e| io_error("renaming into place", &self.final_path, e))
        }
        .await;

        if let Err(e) = remove_dir_all_if_exists(&staging).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to remove staging directory");
        }
        result
    }

    /// Delete the temp output. The final path is not touched.
    pub async fn discard(mut self) -> Result<()> {
        self.finished = true;
        remove_dir_all_if_exists(&self.temp_dir).await
    }
}

impl Drop for TempOutput {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match std::fs::remove_dir_all(&self.temp_dir) {
            Ok(()) => debug!(job_id = %self.job_id, "Discarded temp output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                job_id = %self.job_id,
                dir = %self.temp_dir.display(),
                error = %e,
                "Failed to remove temp directory"
            ),
        }
    }
}

/// Job temp dir beside `final_path`, on the destination filesystem.
fn staging_dir(job_id: &str, final_path: &Path) -> PathBuf {
    SafetyManager::new(None).job_temp_dir(job_id, final_path)
}

/// `<stem>.original<.ext>`, then `<stem>.original.N<.ext>` on collision.
async fn free_backup_path(final_path: &Path) -> Result<PathBuf> {
    let first = with_stem_suffix(final_path, BACKUP_SUFFIX);
    if !path_exists(&first).await? {
        return Ok(first);
    }
    for n in 1..=MAX_UNIQUE_ATTEMPTS {
        let candidate = with_stem_suffix(final_path, &format!("{BACKUP_SUFFIX}.{n}"));
        if !path_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(Error::resource(format!(
        "no free backup name for {}",
        final_path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_promote_with_backup() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("movie.mkv");
        std::fs::write(&final_path, b"original").unwrap();

        let safety = SafetyManager::new(None);
        let temp = safety
            .with_temp_output("job1", &final_path, &final_path)
            .await
            .unwrap();
        assert_eq!(
            temp.temp_dir(),
            dir.path().join(".vpo-tmp-job1").as_path()
        );
        assert_eq!(
            temp.path().file_name().unwrap().to_string_lossy(),
            ".vpo_temp_movie.mkv"
        );
        std::fs::write(temp.path(), b"encoded").unwrap();
        let temp_dir = temp.temp_dir().to_path_buf();

        let promoted = temp.promote(true).await.unwrap();
        assert_eq!(promoted.output_path, final_path);
        assert_eq!(
            promoted.backup_path.as_deref(),
            Some(dir.path().join("movie.original.mkv").as_path())
        );
        assert_eq!(std::fs::read(&final_path).unwrap(), b"encoded");
        assert_eq!(
            std::fs::read(dir.path().join("movie.original.mkv")).unwrap(),
            b"original"
        );
        assert!(!temp_dir.exists());
    }

    #[tokio::test]
    async fn test_backup_name_collision() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("movie.mkv");
        std::fs::write(&final_path, b"v2").unwrap();
        std::fs::write(dir.path().join("movie.original.mkv"), b"v1").unwrap();

        let safety = SafetyManager::new(None);
        let temp = safety
            .with_temp_output("job1", &final_path, &final_path)
            .await
            .unwrap();
        std::fs::write(temp.path(), b"v3").unwrap();

        let promoted = temp.promote(true).await.unwrap();
        assert_eq!(
            promoted.backup_path.unwrap(),
            dir.path().join("movie.original.1.mkv")
        );
        assert_eq!(
            std::fs::read(dir.path().join("movie.original.mkv")).unwrap(),
            b"v1"
        );
    }

    #[tokio::test]
    async fn test_promote_without_backup_replaces() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("movie.mkv");
        std::fs::write(&final_path, b"old").unwrap();

        let temp = SafetyManager::new(None)
            .with_temp_output("job1", &final_path, &final_path)
            .await
            .unwrap();
        std::fs::write(temp.path(), b"new").unwrap();

        let promoted = temp.promote(false).await.unwrap();
        assert!(promoted.backup_path.is_none());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_promote_missing_temp_keeps_original() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("movie.mkv");
        std::fs::write(&final_path, b"original").unwrap();

        let temp = SafetyManager::new(None)
            .with_temp_output("job1", &final_path, &final_path)
            .await
            .unwrap();
        let temp_dir = temp.temp_dir().to_path_buf();

        assert!(temp.promote(true).await.is_err());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"original");
        assert!(!dir.path().join("movie.original.mkv").exists());
        assert!(!temp_dir.exists());
    }

    #[tokio::test]
    async fn test_drop_discards_temp() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tmp");
        let final_path = dir.path().join("movie.mkv");
        std::fs::write(&final_path, b"original").unwrap();

        let safety = SafetyManager::new(Some(root.clone()));
        let temp_dir = {
            let temp = safety
                .with_temp_output("job1", &final_path, &final_path)
                .await
                .unwrap();
            std::fs::write(temp.path(), b"partial").unwrap();
            temp.temp_dir().to_path_buf()
        };

        assert!(temp_dir.starts_with(&root));
        assert!(!temp_dir.exists());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_cleanup_stale() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("movie.mkv");
        let safety = SafetyManager::new(None);

        let leftover = safety.job_temp_dir("job1", &final_path);
        std::fs::create_dir_all(&leftover).unwrap();
        std::fs::write(leftover.join(".vpo_temp_movie.mkv"), b"half").unwrap();

        assert!(safety.cleanup_stale("job1", &final_path).await.unwrap());
        assert!(!leftover.exists());
        assert!(!safety.cleanup_stale("job1", &final_path).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_stale_finds_staged_copy_beside_destination() {
        let root = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let final_path = dest.path().join("movie.mkv");
        let safety = SafetyManager::new(Some(root.path().to_path_buf()));

        let scratch = safety.job_temp_dir("job1", &final_path);
        let staged = staging_dir("job1", &final_path);
        assert!(scratch.starts_with(root.path()));
        assert_eq!(staged, dest.path().join(".vpo-tmp-job1"));
        for dir in [&scratch, &staged] {
            std::fs::create_dir_all(dir).unwrap();
            std::fs::write(dir.join(".vpo_temp_movie.mkv"), b"half").unwrap();
        }

        assert!(safety.cleanup_stale("job1", &final_path).await.unwrap());
        assert!(!scratch.exists());
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_staged_copy_lands_and_leaves_nothing_behind() {
        let root = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let final_path = dest.path().join("movie.mkv");
        let safety = SafetyManager::new(Some(root.path().to_path_buf()));

        let temp = safety
            .with_temp_output("job1", &final_path, &final_path)
            .await
            .unwrap();
        std::fs::write(temp.path(), b"encoded").unwrap();

        temp.stage_across_devices().await.unwrap();
        assert_eq!(std::fs::read(&final_path).unwrap(), b"encoded");
        let leftovers: Vec<_> = std::fs::read_dir(dest.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".vpo"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_promote_no_replace_leaves_newcomer() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("movie.mkv");
        let safety = SafetyManager::new(None);

        let temp = safety
            .with_temp_output("job1", &final_path, &final_path)
            .await
            .unwrap();
        std::fs::write(temp.path(), b"moved").unwrap();
        let temp_dir = temp.temp_dir().to_path_buf();
        std::fs::write(&final_path, b"someone else").unwrap();

        assert!(temp.promote_no_replace().await.is_err());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"someone else");
        assert!(!temp_dir.exists());
    }
}
