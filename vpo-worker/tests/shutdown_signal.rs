#![cfg(unix)]

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vpo_worker::worker::spawn_signal_listener;

#[tokio::test]
async fn sigterm_trips_the_shutdown_token() {
    let token = CancellationToken::new();
    let listener = spawn_signal_listener(token.clone());

    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(std::process::id().to_string())
        .status()
        .unwrap();
    assert!(status.success());

    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("SIGTERM did not cancel the shutdown token");
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn listener_exits_when_token_is_cancelled_elsewhere() {
    let token = CancellationToken::new();
    let listener = spawn_signal_listener(token.clone());
    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap();
}
