//! OS signal handling for the worker binary.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Cancel `token` on Ctrl-C or, on unix, SIGTERM.
///
/// The SIGTERM handler is installed before this returns, so a signal sent
/// right after the call is already caught.
pub fn spawn_signal_listener(token: CancellationToken) -> JoinHandle<()> {
    #[cfg(unix)]
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                None
            }
        };

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match sigterm.as_mut() {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => warn!("Ctrl-C received, stopping after the current job is cancelled"),
            _ = terminate => warn!("SIGTERM received, stopping after the current job is cancelled"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    })
}
