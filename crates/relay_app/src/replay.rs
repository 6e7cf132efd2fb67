//! Headless host: drives the engine from a recorded session.
//!
//! A recording is JSON lines, one step per line:
//!
//! ```text
//! {"action":"start_download","items":[{"url":"https://x/a.bin"}],"destination":"/tmp"}
//! {"action":"event","name":"download_session_started","payload":{"session_id":"$session"}}
//! {"action":"wait","ms":600}
//! ```
//!
//! The string `"$session"` anywhere in a payload stands for the id the
//! replay backend handed out for the current download session.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use relay_core::{
    BackendEvent, DownloadEvent, DownloadItem, ScrapeDone, ScrapeEvent, SessionKey, SessionRow,
};
use relay_engine::{Backend, BackendError, SyncEngine};
use relay_logging::{relay_debug, relay_info, relay_warn};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

pub const SESSION_PLACEHOLDER: &str = "$session";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("cannot read recording: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReplayStep {
    /// A backend event, delivered to the engine as if pushed.
    Event {
        name: String,
        #[serde(default)]
        payload: Value,
    },
    StartDownload {
        items: Vec<DownloadItem>,
        destination: String,
    },
    OpenScrape {
        script: String,
        url: String,
        #[serde(default)]
        options: Value,
        #[serde(default)]
        force_new: bool,
    },
    /// Download the selected items of a scrape.
    ContinueScrape {
        script: String,
        url: String,
        destination: String,
    },
    Pause,
    Resume,
    Cancel,
    CloseSummary,
    Flush,
    Wait {
        ms: u64,
    },
}

/// Parse a JSON-lines recording. Blank lines and `#` comments are skipped.
pub fn parse_recording(text: &str) -> Result<Vec<ReplayStep>, ReplayError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|source| ReplayError::Parse {
                line: index + 1,
                source,
            })
        })
        .collect()
}

pub fn load_recording(path: &Path) -> Result<Vec<ReplayStep>, ReplayError> {
    parse_recording(&std::fs::read_to_string(path)?)
}

/// Stands in for the real backend during a replay.
///
/// It keeps the durable record the real backend would write: pushed
/// download events update per-session rows, scrape items are remembered,
/// and `run_script` returns once the recording delivers `scrape_done`.
#[derive(Default)]
pub struct ReplayBackend {
    state: Mutex<ReplayState>,
    script_done: Notify,
}

#[derive(Default)]
struct ReplayState {
    current_session: Option<String>,
    rows: BTreeMap<String, BTreeMap<String, SessionRow>>,
    scrape_items: Vec<DownloadItem>,
    scrape_result: Option<ScrapeDone>,
}

impl ReplayBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_session(&self) -> Option<String> {
        self.state().current_session.clone()
    }

    /// Record what the real backend would persist for `event`.
    pub fn observe(&self, event: &BackendEvent) {
        let mut state = self.state();
        match event {
            BackendEvent::Download(event) => {
                let Some(session) = state.current_session.clone() else {
                    return;
                };
                let rows = state.rows.entry(session).or_default();
                let row = rows
                    .entry(event.url().to_string())
                    .or_insert_with(|| empty_row(event.url()));
                apply_to_row(row, event);
            }
            BackendEvent::Scrape(ScrapeEvent::Item(item)) => {
                state.scrape_items.push(item.clone());
            }
            BackendEvent::Scrape(ScrapeEvent::Done(done)) => {
                state.scrape_result = Some(done.clone());
                drop(state);
                self.script_done.notify_one();
            }
            BackendEvent::Session(_) => {}
        }
    }

    fn state(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn empty_row(url: &str) -> SessionRow {
    SessionRow {
        url: url.to_string(),
        filename: None,
        progress: None,
        downloaded: 0,
        total: None,
        speed: None,
        eta: None,
        status: "queued".to_string(),
        error: None,
        updated_at: None,
    }
}

fn apply_to_row(row: &mut SessionRow, event: &DownloadEvent) {
    match event {
        DownloadEvent::Progress(payload) => {
            row.progress = payload.progress.or(row.progress);
            row.downloaded = payload.downloaded;
            row.total = payload.total.or(row.total);
            row.speed = Some(payload.speed);
            row.eta = payload.eta;
            if let Some(status) = payload.status.as_ref() {
                row.status = status.clone();
            } else if row.status == "queued" {
                row.status = "downloading".to_string();
            }
        }
        DownloadEvent::ItemQueued(_) => row.status = "queued".to_string(),
        DownloadEvent::ItemStarted(_) | DownloadEvent::ItemResumed(_) => {
            row.status = "downloading".to_string();
        }
        DownloadEvent::ItemPaused(_) => row.status = "paused".to_string(),
        DownloadEvent::ItemCompleted(payload) => {
            row.status = "completed".to_string();
            row.progress = Some(1.0);
            if let Some(size) = payload.downloaded {
                row.downloaded = size;
            }
        }
        DownloadEvent::ItemError(payload) => {
            row.status = "failed".to_string();
            row.error = payload.error.clone().or_else(|| Some("download failed".to_string()));
        }
    }
}

#[async_trait::async_trait]
impl Backend for ReplayBackend {
    async fn start_download_session(
        &self,
        items: &[DownloadItem],
        destination: &str,
    ) -> Result<String, BackendError> {
        let session_id = Uuid::new_v4().to_string();
        let mut state = self.state();
        let rows = items
            .iter()
            .map(|item| {
                let mut row = empty_row(&item.url);
                row.filename = item.filename.clone();
                (item.url.clone(), row)
            })
            .collect();
        state.rows.insert(session_id.clone(), rows);
        state.current_session = Some(session_id.clone());
        relay_info!(
            "replay session {} started: {} item(s) into {}",
            session_id,
            items.len(),
            destination
        );
        Ok(session_id)
    }

    async fn pause_download_session(&self, session_id: &str) -> Result<(), BackendError> {
        relay_debug!("replay pause {}", session_id);
        Ok(())
    }

    async fn resume_download_session(&self, session_id: &str) -> Result<(), BackendError> {
        relay_debug!("replay resume {}", session_id);
        Ok(())
    }

    async fn cancel_download_session(&self, session_id: &str) -> Result<(), BackendError> {
        relay_debug!("replay cancel {}", session_id);
        Ok(())
    }

    async fn force_cancel_download_session(&self, session_id: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        let Some(rows) = state.rows.get_mut(session_id) else {
            return Err(BackendError::Rejected {
                command: "force_cancel_download_session",
                message: format!("unknown session {session_id}"),
            });
        };
        for row in rows.values_mut().filter(|row| row.status != "completed") {
            row.status = "cancelled".to_string();
        }
        Ok(())
    }

    async fn read_download_session(
        &self,
        session_id: &str,
        _destination: &str,
    ) -> Result<Vec<SessionRow>, BackendError> {
        Ok(self
            .state()
            .rows
            .get(session_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn read_scrape_session(
        &self,
        _key: &SessionKey,
    ) -> Result<Vec<DownloadItem>, BackendError> {
        Ok(self.state().scrape_items.clone())
    }

    async fn run_script(
        &self,
        script_name: &str,
        _options: &Value,
    ) -> Result<ScrapeDone, BackendError> {
        relay_info!("replay script {} running", script_name);
        self.state().scrape_items.clear();
        loop {
            let done = self.state().scrape_result.take();
            if let Some(done) = done {
                return Ok(done);
            }
            self.script_done.notified().await;
        }
    }
}

/// What a replay did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub steps: usize,
    pub rejected: Vec<String>,
}

/// Feed `steps` through `engine`, in order.
pub async fn run(
    engine: &SyncEngine,
    backend: &ReplayBackend,
    steps: Vec<ReplayStep>,
) -> ReplayOutcome {
    let mut outcome = ReplayOutcome::default();
    for step in steps {
        outcome.steps += 1;
        let result = match step {
            ReplayStep::Event { name, mut payload } => {
                if let Some(session) = backend.current_session() {
                    substitute_session(&mut payload, &session);
                }
                match BackendEvent::parse(&name, payload) {
                    Ok(event) => {
                        backend.observe(&event);
                        engine.ingest(event);
                    }
                    Err(err) => relay_warn!("replay step {}: {}", outcome.steps, err),
                }
                Ok(())
            }
            ReplayStep::StartDownload { items, destination } => {
                let result = engine.start_download(items, &destination);
                // Let the start command land before the next pushed event.
                settle().await;
                result
            }
            ReplayStep::OpenScrape {
                script,
                url,
                options,
                force_new,
            } => {
                let options = if options.is_null() {
                    Value::Object(Default::default())
                } else {
                    options
                };
                let result = engine.open_scrape(&script, &url, options, force_new).map(|_| ());
                settle().await;
                result
            }
            ReplayStep::ContinueScrape {
                script,
                url,
                destination,
            } => {
                let key = SessionKey::new(&script, &url);
                let result = engine.start_download_from_selection(&key, &destination);
                settle().await;
                result
            }
            ReplayStep::Pause => engine.pause(),
            ReplayStep::Resume => engine.resume(),
            ReplayStep::Cancel => {
                let result = engine.cancel();
                settle().await;
                result
            }
            ReplayStep::CloseSummary => engine.close_summary(),
            ReplayStep::Flush => {
                engine.flush();
                Ok(())
            }
            ReplayStep::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
        };
        if let Err(reason) = result {
            relay_info!("replay step {} rejected: {}", outcome.steps, reason);
            outcome.rejected.push(reason.to_string());
        }
    }
    engine.flush();
    outcome
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn substitute_session(value: &mut Value, session: &str) {
    match value {
        Value::String(text) if text == SESSION_PLACEHOLDER => *text = session.to_string(),
        Value::Array(values) => values
            .iter_mut()
            .for_each(|value| substitute_session(value, session)),
        Value::Object(map) => map
            .values_mut()
            .for_each(|value| substitute_session(value, session)),
        _ => {}
    }
}
