mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use relay_core::{AppSignal, DownloadItem, PendingCommand, Phase, ProgressStatus, RejectReason};
use relay_engine::{EngineSettings, SyncEngine};
use serde_json::json;
use tokio::sync::broadcast;

use support::{eventually, fast_settings, init_logging, row, RecordingBackend};

const URL: &str = "https://x/a.bin";

fn engine() -> (SyncEngine, Arc<RecordingBackend>) {
    engine_with(fast_settings())
}

fn engine_with(settings: EngineSettings) -> (SyncEngine, Arc<RecordingBackend>) {
    init_logging();
    let backend = Arc::new(RecordingBackend::new());
    let engine = SyncEngine::new(backend.clone(), settings);
    (engine, backend)
}

async fn running(engine: &SyncEngine, urls: &[&str]) {
    let items = urls.iter().map(|url| DownloadItem::new(*url)).collect();
    engine.start_download(items, "/tmp").unwrap();
    assert!(eventually(|| engine.phase() == Phase::Running).await);
}

fn drain(rx: &mut broadcast::Receiver<AppSignal>) -> Vec<AppSignal> {
    let mut signals = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        signals.push(signal);
    }
    signals
}

fn toast_count(signals: &[AppSignal]) -> usize {
    signals
        .iter()
        .filter(|signal| matches!(signal, AppSignal::ToastRequest { .. }))
        .count()
}

#[tokio::test]
async fn single_download_completes_and_card_is_pruned() {
    let (engine, backend) = engine();
    let mut signals = engine.subscribe();
    running(&engine, &[URL]).await;

    assert_eq!(backend.calls()[0], "start:/tmp:1");
    let cards = engine.cards();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].session_id.as_deref(), Some("s1"));
    assert_eq!(cards[0].filename, "a.bin");

    engine.ingest_raw("download_item_started", json!({ "url": URL }));
    engine.ingest_raw(
        "download_progress",
        json!({ "url": URL, "progress": 0.5, "downloaded": 50, "total": 100, "speed": 10.0 }),
    );
    engine.ingest_raw("download_item_completed", json!({ "url": URL, "size": 100 }));
    // Buffered until the flush window closes.
    assert_eq!(engine.progress(URL), None);

    assert!(eventually(|| engine.progress(URL).is_some()).await);
    let record = engine.progress(URL).unwrap();
    assert_eq!(record.status, ProgressStatus::Completed);
    assert_eq!(record.progress, Some(1.0));
    assert!(engine.cards().is_empty());

    let signals = drain(&mut signals);
    assert!(signals.contains(&AppSignal::CardCompleted {
        url: URL.to_string()
    }));
    assert!(signals.contains(&AppSignal::CardRemoved {
        url: URL.to_string()
    }));
    engine.shutdown();
}

#[tokio::test]
async fn bursts_reach_subscribers_as_one_update() {
    let (engine, _backend) = engine();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    engine.add_progress_subscriber(move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for step in 1..=10u64 {
        engine.ingest_raw(
            "download_progress",
            json!({ "url": URL, "progress": step as f64 / 20.0, "downloaded": step }),
        );
    }

    assert!(eventually(|| calls.load(Ordering::SeqCst) > 0).await);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.progress(URL).unwrap().downloaded, 10);
}

#[tokio::test]
async fn malformed_events_are_dropped() {
    let (engine, _backend) = engine();
    engine.ingest_raw("download_progress", json!({ "url": URL }));
    engine.ingest_raw("no_such_event", json!({}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.all_progress().is_empty());
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let (engine, backend) = engine();
    running(&engine, &[URL]).await;
    let pointer = engine.lifecycle().active_session().cloned();

    assert_eq!(
        engine.start_download(vec![DownloadItem::new("https://x/b.bin")], "/tmp"),
        Err(RejectReason::SessionActive)
    );
    assert_eq!(
        engine.open_scrape("gallery", "https://site", json!({}), false),
        Err(RejectReason::SessionActive)
    );
    assert_eq!(engine.lifecycle().active_session().cloned(), pointer);
    assert_eq!(backend.count("start:"), 1);
    assert_eq!(backend.count("run_script"), 0);
    engine.shutdown();
}

#[tokio::test]
async fn unconfirmed_pause_reverts_with_one_toast() {
    let (engine, backend) = engine();
    running(&engine, &[URL]).await;
    let mut signals = engine.subscribe();

    engine.pause().unwrap();
    assert_eq!(engine.pause(), Err(RejectReason::CommandInFlight("pause")));
    assert!(eventually(|| engine.lifecycle().pending_command().is_none()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(engine.phase(), Phase::Running);
    assert_eq!(backend.count("pause:s1"), 1);
    assert_eq!(toast_count(&drain(&mut signals)), 1);
    engine.shutdown();
}

#[tokio::test]
async fn failed_pause_command_raises_one_toast() {
    let (engine, backend) = engine();
    *backend.pause_error.lock().unwrap() = Some(relay_engine::BackendError::Unavailable);
    running(&engine, &[URL]).await;
    let mut signals = engine.subscribe();

    engine.pause().unwrap();
    assert!(eventually(|| engine.lifecycle().pending_command().is_none()).await);
    // The armed timeout finds nothing pending.
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(engine.phase(), Phase::Running);
    assert_eq!(toast_count(&drain(&mut signals)), 1);
    engine.shutdown();
}

#[tokio::test]
async fn confirmed_pause_and_resume_commit() {
    let (engine, _backend) = engine();
    running(&engine, &[URL]).await;
    let mut signals = engine.subscribe();

    engine.pause().unwrap();
    engine.ingest_raw("download_session_paused", json!({ "session_id": "s1" }));
    assert_eq!(engine.phase(), Phase::Paused);

    engine.resume().unwrap();
    engine.ingest_raw("download_session_resumed", json!({ "sessionId": "s1" }));
    assert_eq!(engine.phase(), Phase::Running);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(toast_count(&drain(&mut signals)), 0);
    engine.shutdown();
}

#[tokio::test]
async fn timeout_of_a_confirmed_pause_spares_the_next_one() {
    let (engine, _backend) = engine_with(EngineSettings {
        pause_timeout: Duration::from_millis(300),
        ..fast_settings()
    });
    running(&engine, &[URL]).await;
    let mut signals = engine.subscribe();

    engine.pause().unwrap();
    engine.ingest_raw("download_session_paused", json!({ "session_id": "s1" }));
    engine.resume().unwrap();
    engine.ingest_raw("download_session_resumed", json!({ "session_id": "s1" }));
    tokio::time::sleep(Duration::from_millis(200)).await;

    engine.pause().unwrap();
    // The first two timers fire here; the new pause keeps waiting.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        engine.lifecycle().pending_command(),
        Some(PendingCommand::Pause)
    );
    assert_eq!(toast_count(&drain(&mut signals)), 0);

    let mut toasts = 0;
    assert!(
        eventually(|| {
            toasts += toast_count(&drain(&mut signals));
            toasts == 1
        })
        .await
    );
    assert_eq!(engine.lifecycle().pending_command(), None);
    engine.shutdown();
}

#[tokio::test]
async fn cancel_falls_back_to_soft_cancel() {
    let (engine, backend) = engine();
    backend.force_cancel_fails.store(true, Ordering::SeqCst);
    *backend.rows.lock().unwrap() = vec![row(URL, "cancelled", 0.4, None)];
    running(&engine, &[URL]).await;

    engine.cancel().unwrap();
    assert!(eventually(|| engine.summary().is_some()).await);

    assert_eq!(engine.phase(), Phase::Cancelled);
    assert_eq!(backend.count("force_cancel:s1"), 1);
    assert_eq!(backend.count("cancel:s1"), 1);
    let summary = engine.summary().unwrap();
    assert!(summary.authoritative);
    assert_eq!(summary.failed_items.len(), 1);
}

#[tokio::test]
async fn cancel_that_fails_twice_keeps_the_session() {
    let (engine, backend) = engine();
    backend.force_cancel_fails.store(true, Ordering::SeqCst);
    backend.cancel_fails.store(true, Ordering::SeqCst);
    running(&engine, &[URL]).await;
    let mut signals = engine.subscribe();

    engine.cancel().unwrap();
    assert!(eventually(|| backend.count("cancel:s1") == 1).await);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(engine.phase(), Phase::Running);
    assert_eq!(toast_count(&drain(&mut signals)), 1);
    engine.shutdown();
}

#[tokio::test]
async fn reconciliation_wins_over_push_events() {
    let (engine, backend) = engine();
    let other = "https://x/b.bin";
    running(&engine, &[URL, other]).await;

    engine.ingest_raw("download_item_completed", json!({ "url": URL }));
    engine.ingest_raw("download_item_completed", json!({ "url": other }));
    *backend.rows.lock().unwrap() = vec![
        row(URL, "completed", 1.0, None),
        row(other, "failed", 0.9, Some("checksum mismatch")),
    ];
    engine.ingest_raw("download_session_finished", json!({ "session_id": "s1" }));

    assert!(eventually(|| engine.summary().is_some()).await);
    let summary = engine.summary().unwrap();
    assert!(summary.authoritative);
    assert_eq!(summary.phase, Phase::Completed);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed_items.len(), 1);
    assert_eq!(summary.failed_items[0].url, other);

    let record = engine.progress(other).unwrap();
    assert_eq!(record.status, ProgressStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("checksum mismatch"));
}

#[tokio::test]
async fn unreadable_record_gives_a_provisional_summary() {
    let (engine, backend) = engine();
    running(&engine, &[URL]).await;
    backend.read_fails.store(true, Ordering::SeqCst);
    let mut signals = engine.subscribe();

    engine.ingest_raw("download_session_finished", json!({ "session_id": "s1" }));
    assert!(eventually(|| engine.summary().is_some()).await);

    assert!(!engine.summary().unwrap().authoritative);
    assert_eq!(toast_count(&drain(&mut signals)), 0);
}

#[tokio::test]
async fn closing_the_summary_releases_the_session() {
    let (engine, backend) = engine();
    *backend.rows.lock().unwrap() = vec![row(URL, "downloading", 0.3, None)];
    running(&engine, &[URL]).await;
    engine.ingest_raw(
        "download_progress",
        json!({ "url": URL, "progress": 0.3, "downloaded": 3 }),
    );
    engine.flush();
    engine.ingest_raw("download_session_cancelled", json!({ "session_id": "s1" }));
    assert!(eventually(|| engine.summary().is_some()).await);
    assert!(engine.lifecycle().session_badge_done());

    engine.close_summary().unwrap();

    assert_eq!(engine.phase(), Phase::Closed);
    assert!(!engine.has_active_session());
    assert_eq!(engine.resume_target(), None);
    assert_eq!(engine.progress(URL), None);
    assert!(engine.cards().is_empty());
}

#[tokio::test]
async fn start_failure_is_surfaced_once() {
    let (engine, backend) = engine();
    *backend.start_error.lock().unwrap() = Some(relay_engine::BackendError::Rejected {
        command: "start_download_session",
        message: "destination not writable".to_string(),
    });
    let mut signals = engine.subscribe();

    engine
        .start_download(vec![DownloadItem::new(URL)], "/readonly")
        .unwrap();
    assert!(eventually(|| engine.phase() == Phase::Failed).await);
    assert_eq!(toast_count(&drain(&mut signals)), 1);

    engine.close_summary().unwrap();
    assert!(engine.cards().is_empty());
}

#[tokio::test]
async fn purge_closes_the_session() {
    let (engine, _backend) = engine();
    running(&engine, &[URL]).await;
    engine.ingest_raw("download_session_purged", json!({}));
    assert_eq!(engine.phase(), Phase::Closed);
    assert!(engine.cards().is_empty());
}

#[tokio::test]
async fn ticker_keeps_progress_live_without_events() {
    let (engine, backend) = engine();
    *backend.rows.lock().unwrap() = vec![row(URL, "downloading", 0.6, None)];
    running(&engine, &[URL]).await;

    assert!(eventually(|| engine.progress(URL).is_some_and(|r| r.progress == Some(0.6))).await);
    assert_eq!(engine.cards()[0].progress, 0.6);

    engine.shutdown();
    let reads = backend.count("read:s1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.count("read:s1"), reads);
}

#[tokio::test]
async fn ticks_keep_buffered_fields_the_record_lacks() {
    let (engine, backend) = engine_with(EngineSettings {
        flush_interval: Duration::from_millis(300),
        ..fast_settings()
    });
    *backend.rows.lock().unwrap() = vec![row(URL, "downloading", 0.6, None)];
    running(&engine, &[URL]).await;

    engine.ingest_raw(
        "download_progress",
        json!({ "url": URL, "progress": 0.2, "downloaded": 20, "speed": 1234.0, "eta": 7 }),
    );
    assert!(eventually(|| engine.progress(URL).is_some_and(|r| r.speed == 1234.0)).await);
    // Let a few more ticks land after the flush.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let record = engine.progress(URL).unwrap();
    assert_eq!(record.speed, 1234.0);
    assert_eq!(record.eta, Some(7));
    assert_eq!(record.progress, Some(0.6));
    engine.shutdown();
}

#[tokio::test]
async fn direct_flush_keeps_the_timer_window() {
    let (engine, _backend) = engine_with(EngineSettings {
        flush_interval: Duration::from_millis(200),
        ..fast_settings()
    });
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    engine.add_progress_subscriber(move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let progress = |value: f64| json!({ "url": URL, "progress": value, "downloaded": 1 });

    engine.ingest_raw("download_progress", progress(0.1));
    engine.flush();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Still inside the first window: no second timer is armed.
    engine.ingest_raw("download_progress", progress(0.2));
    tokio::time::sleep(Duration::from_millis(190)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    engine.ingest_raw("download_progress", progress(0.3));
    tokio::time::sleep(Duration::from_millis(90)).await;
    assert_eq!(engine.progress(URL).unwrap().progress, Some(0.2));
    assert!(eventually(|| engine.progress(URL).unwrap().progress == Some(0.3)).await);
}

#[tokio::test]
async fn new_start_releases_the_finished_session_it_replaces() {
    let (engine, backend) = engine();
    let other = "https://x/b.bin";
    *backend.rows.lock().unwrap() = vec![row(URL, "failed", 0.4, Some("disk full"))];
    running(&engine, &[URL]).await;
    engine.ingest_raw("download_session_finished", json!({ "session_id": "s1" }));
    assert!(eventually(|| engine.summary().is_some()).await);
    assert_eq!(engine.progress(URL).unwrap().status, ProgressStatus::Failed);

    *backend.session_id.lock().unwrap() = "s2".to_string();
    *backend.rows.lock().unwrap() = vec![row(other, "completed", 1.0, None)];
    running(&engine, &[other]).await;
    assert_eq!(engine.progress(URL), None);
    assert!(engine.cards().iter().all(|card| card.url == other));

    engine.ingest_raw("download_session_finished", json!({ "session_id": "s2" }));
    assert!(eventually(|| engine.summary().is_some()).await);
    engine.close_summary().unwrap();

    assert!(engine.cards().is_empty());
    assert!(engine.all_progress().is_empty());
}

#[test]
fn commands_outside_a_runtime_fail_instead_of_panicking() {
    init_logging();
    let backend = Arc::new(RecordingBackend::new());
    let engine = SyncEngine::new(backend.clone(), fast_settings());

    engine.ingest_raw(
        "download_progress",
        json!({ "url": URL, "progress": 0.5, "downloaded": 5 }),
    );
    assert_eq!(engine.progress(URL).unwrap().progress, Some(0.5));

    engine.start_download(vec![DownloadItem::new(URL)], "/tmp").unwrap();
    assert_eq!(engine.phase(), Phase::Failed);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn explicit_reconcile_returns_merged_records() {
    let (engine, backend) = engine();
    backend.empty_reads.store(1, Ordering::SeqCst);
    *backend.rows.lock().unwrap() = vec![row(URL, "completed", 1.0, None)];

    let records = engine.reconcile("s9", "/tmp").await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[URL].status, ProgressStatus::Completed);
    assert_eq!(engine.progress(URL).unwrap().status, ProgressStatus::Completed);
}
