//! Log health monitor tests with short real-time windows.

use std::time::Duration;

use tokio::sync::watch;

use super::{LogHealthMonitor, WatchOutcome};

fn monitor(path: &std::path::Path, patterns: &[&str]) -> LogHealthMonitor {
    let patterns: Vec<String> = patterns.iter().map(ToString::to_string).collect();
    LogHealthMonitor::new(path, &patterns, Duration::from_millis(20))
}

fn cancel_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[tokio::test]
async fn clean_window_without_matches() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("device.log");
    std::fs::write(&log, "boot ok\n").unwrap();

    let (_tx, cancel) = cancel_pair();
    let outcome = monitor(&log, &["PANIC"])
        .watch(Duration::from_millis(150), cancel)
        .await;

    assert_eq!(outcome, WatchOutcome::Clean);
}

#[tokio::test]
async fn match_short_circuits_before_the_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("device.log");
    std::fs::write(&log, "").unwrap();

    let mon = monitor(&log, &["PANIC", "FATAL"]);
    let (_tx, cancel) = cancel_pair();
    let log_writer = log.clone();
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::write(&log_writer, "pump started\nkernel panic: oops\n").unwrap();
    });

    let started = std::time::Instant::now();
    let outcome = mon.watch(Duration::from_secs(10), cancel).await;
    writer.await.unwrap();

    // Matched well before the 10s deadline, case-insensitively.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        outcome,
        WatchOutcome::Matched { pattern, .. } if pattern == "panic"
    ));
}

#[tokio::test]
async fn lines_written_before_window_start_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("device.log");
    std::fs::write(&log, "old PANIC from last week\n").unwrap();

    let (_tx, cancel) = cancel_pair();
    let outcome = monitor(&log, &["PANIC"])
        .watch(Duration::from_millis(150), cancel)
        .await;

    assert_eq!(outcome, WatchOutcome::Clean);
}

#[tokio::test]
async fn unreadable_source_for_the_whole_window_escalates() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("never-created.log");

    let (_tx, cancel) = cancel_pair();
    let outcome = monitor(&log, &["PANIC"])
        .watch(Duration::from_millis(150), cancel)
        .await;

    assert!(matches!(outcome, WatchOutcome::MonitorFailed(_)));
}

#[tokio::test]
async fn transient_read_failure_does_not_escalate() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("late.log");

    let mon = monitor(&log, &["PANIC"]);
    let (_tx, cancel) = cancel_pair();
    let log_writer = log.clone();
    // The log source appears partway through the window.
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::write(&log_writer, "all good\n").unwrap();
    });

    let outcome = mon.watch(Duration::from_millis(200), cancel).await;
    writer.await.unwrap();

    assert_eq!(outcome, WatchOutcome::Clean);
}

#[tokio::test]
async fn cancellation_is_observed_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("device.log");
    std::fs::write(&log, "").unwrap();

    let mon = monitor(&log, &["PANIC"]);
    let (tx, cancel) = cancel_pair();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(true).ok();
    });

    let started = std::time::Instant::now();
    let outcome = mon.watch(Duration::from_secs(30), cancel).await;

    assert_eq!(outcome, WatchOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn dropped_cancel_sender_ends_the_watch() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("device.log");
    std::fs::write(&log, "").unwrap();

    let mon = monitor(&log, &["PANIC"]);
    let (tx, cancel) = cancel_pair();
    drop(tx);

    let started = std::time::Instant::now();
    let outcome = mon.watch(Duration::from_secs(30), cancel).await;

    assert_eq!(outcome, WatchOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}
