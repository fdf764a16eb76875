//! End-to-end tests against a fake bridge executable
//!
//! A small shell script stands in for the real binary so the process
//! plumbing (spawning, output scraping, kills, stream tracking) runs for
//! real without a device attached.

#![cfg(unix)]

use sideload_core::{
    BridgeError, BridgePushExecutor, ConnectionState, DeviceBridge, DeviceMonitor,
    DeviceTransition, PushExecutor, PushOutcome,
};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

const DEVICE: &str = "R58M123ABCD";

fn fake_bridge(dir: &TempDir, body: &str) -> DeviceBridge {
    let path = dir.path().join("fake-adb");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    DeviceBridge::new(path)
}

fn staged_file(dir: &TempDir, name: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, b"payload").unwrap();
    path
}

async fn run_push(
    executor: &BridgePushExecutor,
    source: &Path,
    destination: &str,
) -> (PushOutcome, Vec<u8>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = executor.push(DEVICE, source, destination, tx).await;
    let mut seen = Vec::new();
    while let Ok(percent) = rx.try_recv() {
        seen.push(percent);
    }
    (outcome, seen)
}

async fn next_transition(rx: &mut mpsc::UnboundedReceiver<DeviceTransition>) -> DeviceTransition {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a device transition")
        .expect("transition stream closed early")
}

#[tokio::test]
async fn test_push_scrapes_progress_and_verifies() {
    let dir = TempDir::new().unwrap();
    let bridge = fake_bridge(
        &dir,
        r#"case "$3" in
  push)
    printf '[  5%%] %s\r' "$5"
    printf '[ 55%%] %s\r' "$5"
    printf '[ 55%%] %s\r' "$5"
    printf '[100%%] %s\r' "$5"
    printf '%s: 1 file pushed. 4.2 MB/s\n' "$4"
    ;;
  shell)
    echo "$5"
    ;;
esac"#,
    );
    let source = staged_file(&dir, "a.jpg");
    let executor = BridgePushExecutor::new(bridge);

    let (outcome, progress) =
        run_push(&executor, &source, "/sdcard/sideload/imagery/a.jpg").await;
    assert!(outcome.success, "push failed: {:?}", outcome.detail);
    assert_eq!(progress, vec![5, 55, 100]);
}

#[tokio::test]
async fn test_push_failure_carries_bridge_diagnostics() {
    let dir = TempDir::new().unwrap();
    let bridge = fake_bridge(
        &dir,
        r#"case "$3" in
  push)
    printf '[ 12%%] %s\r' "$5"
    echo 'adb: error: failed to copy: remote write failed' >&2
    exit 1
    ;;
esac"#,
    );
    let source = staged_file(&dir, "a.jpg");
    let executor = BridgePushExecutor::new(bridge);

    let (outcome, progress) =
        run_push(&executor, &source, "/sdcard/sideload/imagery/a.jpg").await;
    assert!(!outcome.success);
    assert_eq!(progress, vec![12]);
    let detail = outcome.detail.unwrap();
    assert!(detail.contains("failed to copy"), "detail: {}", detail);
}

#[tokio::test]
async fn test_push_fails_when_file_missing_on_device() {
    let dir = TempDir::new().unwrap();
    let bridge = fake_bridge(
        &dir,
        r#"case "$3" in
  push)
    printf '[100%%] %s\r' "$5"
    echo '1 file pushed'
    ;;
  shell)
    printf 'ls: %s: No such file or directory\n' "$5"
    exit 1
    ;;
esac"#,
    );
    let source = staged_file(&dir, "b.p12");
    let executor = BridgePushExecutor::new(bridge);

    let (outcome, _) = run_push(&executor, &source, "/sdcard/sideload/certs/b.p12").await;
    assert!(!outcome.success);
    assert!(outcome.detail.unwrap().contains("missing on device"));
}

#[tokio::test]
async fn test_silent_push_is_killed_after_idle_timeout() {
    let dir = TempDir::new().unwrap();
    let bridge = fake_bridge(
        &dir,
        r#"case "$3" in
  push)
    exec sleep 30
    ;;
esac"#,
    );
    let source = staged_file(&dir, "c.zip");
    let executor =
        BridgePushExecutor::new(bridge).with_idle_timeout(Duration::from_millis(200));

    let (outcome, progress) =
        run_push(&executor, &source, "/sdcard/sideload/packages/c.zip").await;
    assert!(!outcome.success);
    assert!(progress.is_empty());
    assert!(outcome.detail.unwrap().contains("no push output"));
}

#[tokio::test]
async fn test_kill_device_terminates_in_flight_push() {
    let dir = TempDir::new().unwrap();
    let bridge = fake_bridge(
        &dir,
        r#"case "$3" in
  push)
    printf '[ 30%%] %s\r' "$5"
    exec sleep 30
    ;;
esac"#,
    );
    let source = staged_file(&dir, "c.zip");
    let executor = Arc::new(BridgePushExecutor::new(bridge));

    let pushing = executor.clone();
    let handle = tokio::spawn(async move {
        let (tx, _rx) = mpsc::unbounded_channel();
        pushing
            .push(DEVICE, &source, "/sdcard/sideload/packages/c.zip", tx)
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(executor.kill_device(DEVICE).await, 1);

    let outcome = timeout(Duration::from_secs(5), handle)
        .await
        .expect("push did not return after kill")
        .unwrap();
    assert!(!outcome.success);
    assert!(outcome.detail.unwrap().contains("push terminated"));

    // Nothing left to kill
    assert_eq!(executor.kill_all().await, 0);
}

#[tokio::test]
async fn test_missing_bridge_binary_fails_the_push() {
    let dir = TempDir::new().unwrap();
    let source = staged_file(&dir, "a.jpg");
    let executor =
        BridgePushExecutor::new(DeviceBridge::new("/nonexistent/sideload-test-bridge"));

    let (outcome, _) = run_push(&executor, &source, "/sdcard/sideload/imagery/a.jpg").await;
    assert!(!outcome.success);
    assert!(outcome.detail.unwrap().contains("not found"));
}

#[tokio::test]
async fn test_monitor_streams_parsed_deduplicated_transitions() {
    let dir = TempDir::new().unwrap();
    let bridge = fake_bridge(
        &dir,
        r#"case "$1" in
  track-devices)
    echo 'List of devices attached'
    printf '0016R58M123ABCD\tdevice\n'
    printf '0016R58M123ABCD\tdevice\n'
    printf 'ce061716a8f2\tunauthorized\n'
    echo '* daemon started successfully *'
    printf 'ce061716a8f2\tdevice\n'
    ;;
esac"#,
    );
    let monitor = DeviceMonitor::new(bridge);
    let mut rx = monitor.start().await.unwrap();

    let first = next_transition(&mut rx).await;
    assert_eq!(first.device_id, "R58M123ABCD");
    assert_eq!(first.state, ConnectionState::Device);

    let second = next_transition(&mut rx).await;
    assert_eq!(second.device_id, "ce061716a8f2");
    assert_eq!(second.state, ConnectionState::Unauthorized);

    let third = next_transition(&mut rx).await;
    assert_eq!(third.device_id, "ce061716a8f2");
    assert_eq!(third.state, ConnectionState::Device);

    // Script exits: the stream ends and the channel closes
    let end = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert!(end.is_none());
    monitor.stop().await;
}

#[tokio::test]
async fn test_monitor_stop_ends_stream_and_allows_restart() {
    let dir = TempDir::new().unwrap();
    let bridge = fake_bridge(
        &dir,
        r#"case "$1" in
  track-devices)
    printf 'R58M123ABCD\tdevice\n'
    exec sleep 30
    ;;
esac"#,
    );
    let monitor = DeviceMonitor::new(bridge);

    let mut rx = monitor.start().await.unwrap();
    assert!(monitor.is_running().await);
    let first = next_transition(&mut rx).await;
    assert_eq!(first.device_id, "R58M123ABCD");

    monitor.stop().await;
    assert!(!monitor.is_running().await);
    let end = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert!(end.is_none());

    // A stopped monitor can be started again
    let mut rx = monitor.start().await.unwrap();
    let first = next_transition(&mut rx).await;
    assert_eq!(first.device_id, "R58M123ABCD");
    monitor.stop().await;
}

#[tokio::test]
async fn test_monitor_rejects_second_start() {
    let dir = TempDir::new().unwrap();
    let bridge = fake_bridge(
        &dir,
        r#"case "$1" in
  track-devices)
    exec sleep 30
    ;;
esac"#,
    );
    let monitor = DeviceMonitor::new(bridge);

    let _rx = monitor.start().await.unwrap();
    let again = monitor.start().await;
    assert!(matches!(again, Err(BridgeError::Monitor(_))));
    monitor.stop().await;
}
