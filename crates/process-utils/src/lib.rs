//! Process helpers for spawning and stopping external tools.
//!
//! The worker drives long-running encoders. These helpers keep spawning
//! consistent across platforms and give children a chance to exit cleanly
//! before they are killed.

#[cfg(feature = "tokio")]
use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Suppress the console window a child would otherwise open on Windows.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` that never opens a console window.
///
/// The child is killed if its handle is dropped, so an abandoned encoder
/// never outlives the task that owns it.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// How a child ended after [`terminate_child`].
#[cfg(feature = "tokio")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The child exited on its own within the grace period.
    Graceful,
    /// The child ignored the quit request and was killed.
    Killed,
}

/// Ask a child to quit, then kill it once `grace` has elapsed.
///
/// The quit request is a `q` written to the child's stdin, which ffmpeg
/// treats as "finish up and exit". Children spawned without a piped stdin
/// skip straight to the grace wait.
#[cfg(feature = "tokio")]
pub async fn terminate_child(
    child: &mut tokio::process::Child,
    grace: std::time::Duration,
) -> std::io::Result<Termination> {
    use tokio::io::AsyncWriteExt;

    if let Some(mut stdin) = child.stdin.take() {
        // A closed pipe means the child is already on its way out.
        let _ = stdin.write_all(b"q").await;
        let _ = stdin.flush().await;
        drop(stdin);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            status?;
            Ok(Termination::Graceful)
        }
        Err(_) => {
            child.kill().await?;
            Ok(Termination::Killed)
        }
    }
}
