//! Move executor: relocate a file to a templated destination.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::fs;
use tracing::{debug, info};

use super::resource::{DiskSpace, DiskSpaceStatus, SystemDiskSpace};
use super::template::{TemplateContext, render_component, render_path};
use super::{ExecutionContext, ExecutionOutcome, Executor};
use crate::database::models::JobType;
use crate::jobs::Job;
use crate::progress::ProgressSnapshot;
use crate::safety::SafetyManager;
use crate::utils::filename::EMPTY_COMPONENT;
use crate::utils::fs::{
    MAX_UNIQUE_ATTEMPTS, copy_verified, ensure_dir_all, io_error, is_cross_device, path_exists,
    remove_file_if_exists, rename_no_replace, unique_path,
};
use crate::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_fallback() -> String {
    EMPTY_COMPONENT.to_string()
}

/// Configuration of a move job, read from `policy_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveConfig {
    /// Directory template, e.g. `"{year}/{title}"`.
    #[serde(default)]
    pub destination_template: String,

    /// Base directory for the rendered template. Defaults to the source's
    /// directory.
    #[serde(default)]
    pub destination_root: Option<PathBuf>,

    /// Renders the file stem instead of reusing the source file name.
    #[serde(default)]
    pub destination_filename_template: Option<String>,

    /// Placeholder values, as supplied by the metadata parser.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    #[serde(default = "default_fallback")]
    pub fallback: String,

    /// Per-placeholder fallbacks, checked before `fallback`.
    #[serde(default)]
    pub fallbacks: HashMap<String, String>,

    #[serde(default = "default_true")]
    pub create_directories: bool,

    /// Replace an existing destination instead of picking `name (N).ext`.
    #[serde(default)]
    pub overwrite: bool,

    /// Append the source extension to a rendered file name.
    #[serde(default = "default_true")]
    pub keep_extension: bool,
}

impl Default for MoveConfig {
    fn default() -> Self {
        Self {
            destination_template: String::new(),
            destination_root: None,
            destination_filename_template: None,
            metadata: HashMap::new(),
            fallback: default_fallback(),
            fallbacks: HashMap::new(),
            create_directories: true,
            overwrite: false,
            keep_extension: true,
        }
    }
}

impl MoveConfig {
    fn template_context(&self) -> TemplateContext<'_> {
        TemplateContext {
            metadata: &self.metadata,
            fallbacks: &self.fallbacks,
            fallback: &self.fallback,
        }
    }

    /// Destination path for `source`, before collision handling.
    pub fn destination_for(&self, source: &Path) -> Result<PathBuf> {
        let ctx = self.template_context();
        let root = match &self.destination_root {
            Some(root) => root.clone(),
            None => source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let dir = root.join(render_path(&self.destination_template, &ctx));

        let file_name = match &self.destination_filename_template {
            Some(template) => {
                let stem = render_component(template, &ctx);
                match source.extension() {
                    Some(ext) if self.keep_extension => {
                        format!("{}.{}", stem, ext.to_string_lossy())
                    }
                    _ => stem,
                }
            }
            None => source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    Error::validation(format!("source has no file name: {}", source.display()))
                })?,
        };
        Ok(dir.join(file_name))
    }
}

/// How the file got to its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MoveMethod {
    Rename,
    Copy,
}

impl MoveMethod {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Rename => "rename",
            Self::Copy => "copy",
        }
    }
}

/// Relocates files by rename, falling back to a verified copy across
/// filesystems.
pub struct MoveExecutor {
    disk_space: Arc<dyn DiskSpace>,
}

impl MoveExecutor {
    pub fn new() -> Self {
        Self {
            disk_space: Arc::new(SystemDiskSpace),
        }
    }

    pub fn with_disk_space(mut self, disk_space: Arc<dyn DiskSpace>) -> Self {
        self.disk_space = disk_space;
        self
    }

    /// Copy `source` onto the destination filesystem through a job temp
    /// file, then remove the source.
    async fn move_across_devices(
        &self,
        job_id: &str,
        source: &Path,
        dest: &Path,
        size: u64,
        overwrite: bool,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let dest_dir = dest.parent().unwrap_or(Path::new("."));
        if let DiskSpaceStatus::InsufficientSpace {
            available_bytes,
            required_bytes,
        } = self.disk_space.check(dest_dir, size)
        {
            return Err(Error::resource(format!(
                "insufficient disk space at {}: {} bytes required, {} available",
                dest_dir.display(),
                required_bytes,
                available_bytes
            )));
        }

        // No temp_root here: the temp file must share the destination's
        // filesystem for the final rename.
        let temp = SafetyManager::new(None)
            .with_temp_output(job_id, source, dest)
            .await?;
        copy_verified(source, temp.path()).await?;

        if ctx.cancel.is_cancelled() {
            temp.discard().await?;
            return Err(Error::Cancelled);
        }

        if overwrite {
            temp.promote(false).await?;
        } else {
            temp.promote_no_replace().await?;
        }
        remove_file_if_exists(source).await
    }
}

/// Directory and collision handling for [`MoveExecutor::relocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelocateOptions {
    pub create_directories: bool,
    pub overwrite: bool,
}

impl MoveExecutor {
    /// Move `source` to `dest`, creating the parent directory if allowed.
    /// Without `overwrite` an existing file is never replaced and the next
    /// free `name (N).ext` is used. Returns where the file ended up.
    pub(crate) async fn relocate(
        &self,
        job_id: &str,
        source: &Path,
        dest: PathBuf,
        size: u64,
        options: RelocateOptions,
        ctx: &ExecutionContext,
    ) -> Result<(PathBuf, MoveMethod)> {
        let dest_dir = dest.parent().map(Path::to_path_buf).unwrap_or_default();
        if options.create_directories {
            ensure_dir_all(&dest_dir).await?;
        } else if !path_exists(&dest_dir).await? {
            return Err(Error::validation(format!(
                "destination directory does not exist: {}",
                dest_dir.display()
            )));
        }

        let mut dest = if options.overwrite {
            dest
        } else {
            unique_path(&dest).await?
        };

        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        info!(
            job_id,
            source = %source.display(),
            destination = %dest.display(),
            "Moving file"
        );

        let method = if options.overwrite {
            match fs::rename(source, &dest).await {
                Ok(()) => MoveMethod::Rename,
                Err(e) if is_cross_device(&e) => {
                    debug!(job_id, "Cross-device move, copying");
                    self.move_across_devices(job_id, source, &dest, size, true, ctx)
                        .await?;
                    MoveMethod::Copy
                }
                Err(e) => return Err(io_error("moving to", &dest, e)),
            }
        } else {
            self.move_no_replace(job_id, source, &mut dest, size, ctx)
                .await?
        };
        Ok((dest, method))
    }

    /// Move without ever replacing a file. A name taken between choosing
    /// `dest` and the move is skipped for the next free one.
    async fn move_no_replace(
        &self,
        job_id: &str,
        source: &Path,
        dest: &mut PathBuf,
        size: u64,
        ctx: &ExecutionContext,
    ) -> Result<MoveMethod> {
        for _ in 0..MAX_UNIQUE_ATTEMPTS {
            match rename_no_replace(source, dest).await {
                Ok(()) => return Ok(MoveMethod::Rename),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(job_id, destination = %dest.display(), "Destination taken, picking another name");
                    *dest = unique_path(dest).await?;
                }
                Err(e) if is_cross_device(&e) => {
                    debug!(job_id, "Cross-device move, copying");
                    self.move_across_devices(job_id, source, dest, size, false, ctx)
                        .await?;
                    return Ok(MoveMethod::Copy);
                }
                Err(e) => return Err(io_error("moving to", dest, e)),
            }
        }
        Err(Error::resource(format!(
            "no free name for {} after {} attempts",
            dest.display(),
            MAX_UNIQUE_ATTEMPTS
        )))
    }
}

impl Default for MoveExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for MoveExecutor {
    fn job_type(&self) -> JobType {
        JobType::Move
    }

    fn name(&self) -> &'static str {
        "move"
    }

    async fn execute(&self, job: &Job, ctx: &ExecutionContext) -> Result<ExecutionOutcome> {
        let config: MoveConfig = job.config()?;
        let source = job.file_path.as_path();

        let meta = match fs::metadata(source).await {
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
        let size = meta.len();

        let dest = config.destination_for(source)?;
        if dest == source {
            info!(job_id = %job.id, file = %source.display(), "File already at destination");
            return Ok(ExecutionOutcome {
                output_path: Some(dest),
                skipped: Some("already at destination".to_string()),
                summary: json!({
                    "source": source.display().to_string(),
                    "destination": source.display().to_string(),
                    "bytes": size,
                }),
                ..Default::default()
            });
        }

        let options = RelocateOptions {
            create_directories: config.create_directories,
            overwrite: config.overwrite,
        };
        let (dest, method) = self
            .relocate(&job.id, source, dest, size, options, ctx)
            .await?;

        ctx.progress.report(ProgressSnapshot::bytes(size, size));

        Ok(ExecutionOutcome {
            output_path: Some(dest.clone()),
            backup_path: None,
            skipped: None,
            summary: json!({
                "source": source.display().to_string(),
                "destination": dest.display().to_string(),
                "bytes": size,
                "method": method.as_str(),
            }),
        })
    }
}
