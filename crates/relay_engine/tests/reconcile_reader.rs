mod support;

use std::sync::atomic::Ordering;

use pretty_assertions::assert_eq;
use relay_engine::{ReconcileError, ReconciliationReader};

use support::{fast_settings, init_logging, row, RecordingBackend};

#[tokio::test]
async fn empty_reads_are_retried() {
    init_logging();
    let backend = RecordingBackend::new();
    backend.empty_reads.store(2, Ordering::SeqCst);
    *backend.rows.lock().unwrap() = vec![row("https://x/a", "completed", 1.0, None)];
    let reader = ReconciliationReader::new(&fast_settings());

    let report = reader.read(&backend, "s1", "/tmp").await.unwrap();

    assert_eq!(backend.count("read:s1"), 3);
    assert_eq!(report.total(), 1);
    assert_eq!(report.completed, 1);
    assert!(report.failed_items.is_empty());
}

#[tokio::test]
async fn attempts_are_bounded() {
    init_logging();
    let backend = RecordingBackend::new();
    backend.empty_reads.store(10, Ordering::SeqCst);
    let reader = ReconciliationReader::new(&fast_settings());

    let rows = reader.read_rows(&backend, "s1", "/tmp").await.unwrap();

    assert!(rows.is_empty());
    assert_eq!(backend.count("read:s1"), 3);
}

#[tokio::test]
async fn persistent_failure_is_an_error() {
    init_logging();
    let backend = RecordingBackend::new();
    backend.read_fails.store(true, Ordering::SeqCst);
    let reader = ReconciliationReader::new(&fast_settings());

    let err = reader.read(&backend, "s1", "/tmp").await.unwrap_err();

    let ReconcileError::Read {
        session_id,
        attempts,
        ..
    } = err;
    assert_eq!(session_id, "s1");
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn failure_policy_comes_from_settings() {
    init_logging();
    let backend = RecordingBackend::new();
    *backend.rows.lock().unwrap() = vec![
        row("https://x/a", "stalled", 0.5, None),
        row("https://x/b", "downloading", 0.5, None),
    ];
    let reader = ReconciliationReader::new(&fast_settings());

    let report = reader.read(&backend, "s1", "/tmp").await.unwrap();

    assert_eq!(reader.policy().in_flight.len(), 6);
    assert_eq!(report.failed_items.len(), 1);
    assert_eq!(report.failed_items[0].url, "https://x/a");
}
