//! Running ffmpeg with progress streaming and cooperative cancellation.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use process_utils::{Termination, terminate_child, tokio_command};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::progress::{FfmpegProgressParser, ProgressReporter};
use crate::{Error, Result};

/// stderr lines kept for failure messages.
pub const STDERR_TAIL_LINES: usize = 20;

/// How long a cancelled encoder gets to exit after `q` before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Result of an encoder run that was not cancelled.
#[derive(Debug)]
pub struct CommandRun {
    pub status: ExitStatus,
    pub elapsed: Duration,
    /// Last lines of stderr, oldest first.
    pub stderr_tail: Vec<String>,
}

impl CommandRun {
    /// Exit code plus the stderr tail, for job error messages.
    pub fn failure_message(&self, program: &str) -> String {
        let code = self
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        if self.stderr_tail.is_empty() {
            format!("{} exited with {}", program, code)
        } else {
            format!(
                "{} exited with {}:\n{}",
                program,
                code,
                self.stderr_tail.join("\n")
            )
        }
    }
}

#[derive(Clone, Default)]
struct StderrTail(Arc<Mutex<VecDeque<String>>>);

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.0.lock();
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().iter().cloned().collect()
    }
}

/// Spawn `program args`, feed stdout through the progress parser and report
/// snapshots until the process exits.
///
/// The token is checked before spawning and while waiting on every line; a
/// cancelled run is asked to quit, killed after [`TERMINATE_GRACE`], and
/// reported as [`Error::Cancelled`].
pub async fn run_ffmpeg_with_progress(
    program: &Path,
    args: &[String],
    duration_secs: Option<f64>,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<CommandRun> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let start = Instant::now();
    let mut cmd = tokio_command(program);
    cmd.args(args)
        .env("LC_ALL", "C")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(program = %program.display(), ?args, "Spawning encoder");
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::resource(format!("encoder not found: {}", program.display()))
        } else {
            Error::execution(format!("failed to spawn {}: {}", program.display(), e))
        }
    })?;

    let tail = StderrTail::default();
    let stderr_task = child.stderr.take().map(|stderr| {
        let tail = tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("ffmpeg stderr: {}", line);
                tail.push(line);
            }
        })
    });

    let mut parser = FfmpegProgressParser::new(duration_secs);
    let mut cancelled = false;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(snapshot) = parser.parse_line(&line) {
                            progress.report(snapshot);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to read encoder progress");
                        break;
                    }
                },
            }
        }
    }

    let status = if cancelled {
        None
    } else {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status.map_err(|e| {
                Error::execution(format!("failed to wait for {}: {}", program.display(), e))
            })?),
        }
    };

    let Some(status) = status else {
        match terminate_child(&mut child, TERMINATE_GRACE).await {
            Ok(Termination::Graceful) => debug!("Encoder exited after quit request"),
            Ok(Termination::Killed) => warn!("Encoder ignored quit request and was killed"),
            Err(e) => warn!(error = %e, "Failed to terminate encoder"),
        }
        if let Some(task) = stderr_task {
            task.abort();
        }
        return Err(Error::Cancelled);
    };

    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    Ok(CommandRun {
        status,
        elapsed: start.elapsed(),
        stderr_tail: tail.snapshot(),
    })
}
