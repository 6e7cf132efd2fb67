#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

use relay_core::{DownloadItem, ScrapeDone, SessionKey, SessionRow};
use relay_engine::{Backend, BackendError, EngineSettings};
use serde_json::Value;
use tokio::sync::Notify;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(relay_logging::initialize_for_tests);
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        flush_interval: Duration::from_millis(20),
        pause_timeout: Duration::from_millis(80),
        reconcile_interval: Duration::from_millis(30),
        reconcile_attempts: 3,
        reconcile_retry_delay: Duration::from_millis(5),
        ..EngineSettings::default()
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn row(url: &str, status: &str, progress: f64, error: Option<&str>) -> SessionRow {
    serde_json::from_value(serde_json::json!({
        "url": url,
        "status": status,
        "progress": progress,
        "error": error,
    }))
    .unwrap()
}

/// Backend double: records every command and answers from scripted state.
/// It never pushes events; tests inject those through the engine.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<String>>,
    pub session_id: Mutex<String>,
    pub start_error: Mutex<Option<BackendError>>,
    pub pause_error: Mutex<Option<BackendError>>,
    pub force_cancel_fails: AtomicBool,
    pub cancel_fails: AtomicBool,
    /// Durable rows returned by `read_download_session`.
    pub rows: Mutex<Vec<SessionRow>>,
    /// Reads that come back empty before `rows` is served.
    pub empty_reads: AtomicUsize,
    pub read_fails: AtomicBool,
    pub scrape_rows: Mutex<Vec<DownloadItem>>,
    pub script_result: Mutex<Option<Result<ScrapeDone, BackendError>>>,
    /// When set, `run_script` waits for `script_release`.
    pub hold_script: AtomicBool,
    pub script_release: Notify,
    pub started_items: Mutex<Vec<DownloadItem>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        *backend.session_id.lock().unwrap() = "s1".to_string();
        backend
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn failure(command: &'static str) -> BackendError {
        BackendError::Command {
            command,
            message: "scripted failure".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Backend for RecordingBackend {
    async fn start_download_session(
        &self,
        items: &[DownloadItem],
        destination: &str,
    ) -> Result<String, BackendError> {
        self.record(format!("start:{destination}:{}", items.len()));
        *self.started_items.lock().unwrap() = items.to_vec();
        if let Some(err) = self.start_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.session_id.lock().unwrap().clone())
    }

    async fn pause_download_session(&self, session_id: &str) -> Result<(), BackendError> {
        self.record(format!("pause:{session_id}"));
        match self.pause_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn resume_download_session(&self, session_id: &str) -> Result<(), BackendError> {
        self.record(format!("resume:{session_id}"));
        Ok(())
    }

    async fn cancel_download_session(&self, session_id: &str) -> Result<(), BackendError> {
        self.record(format!("cancel:{session_id}"));
        if self.cancel_fails.load(Ordering::SeqCst) {
            return Err(Self::failure("cancel_download_session"));
        }
        Ok(())
    }

    async fn force_cancel_download_session(&self, session_id: &str) -> Result<(), BackendError> {
        self.record(format!("force_cancel:{session_id}"));
        if self.force_cancel_fails.load(Ordering::SeqCst) {
            return Err(Self::failure("force_cancel_download_session"));
        }
        Ok(())
    }

    async fn read_download_session(
        &self,
        session_id: &str,
        _destination: &str,
    ) -> Result<Vec<SessionRow>, BackendError> {
        self.record(format!("read:{session_id}"));
        if self.read_fails.load(Ordering::SeqCst) {
            return Err(Self::failure("read_download_session"));
        }
        let skipped = self
            .empty_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if skipped {
            return Ok(Vec::new());
        }
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn read_scrape_session(
        &self,
        key: &SessionKey,
    ) -> Result<Vec<DownloadItem>, BackendError> {
        self.record(format!("read_scrape:{key}"));
        Ok(self.scrape_rows.lock().unwrap().clone())
    }

    async fn run_script(
        &self,
        script_name: &str,
        options: &Value,
    ) -> Result<ScrapeDone, BackendError> {
        let input = options
            .get("inputUrl")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.record(format!("run_script:{script_name}:{input}"));
        if self.hold_script.load(Ordering::SeqCst) {
            self.script_release.notified().await;
        }
        self.script_result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Ok(ScrapeDone::default()))
    }
}
