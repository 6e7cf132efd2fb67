use serde_json::Value;

use crate::{DownloadItem, ReconcileReport, SessionKey};

/// A pause or resume waiting for the backend's confirming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCommand {
    Pause,
    Resume,
}

impl PendingCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            PendingCommand::Pause => "pause",
            PendingCommand::Resume => "resume",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    /// User started a scrape and the store has no resumable record for it.
    ScrapeRequested { key: SessionKey, options: Value },
    /// User started a download session.
    DownloadRequested {
        items: Vec<DownloadItem>,
        destination: String,
    },
    PauseRequested,
    ResumeRequested,
    CancelRequested,
    /// User closed the session summary.
    SummaryClosed,
    /// The active scrape reported a discovered item.
    ScrapeItemSeen,
    /// The scraper finished, via `scrape_done` or the `run_script` result.
    ScrapeFinished { key: SessionKey, items: usize },
    ScriptRunFailed { key: SessionKey, error: String },
    /// `start_download_session` returned or `download_session_started` arrived.
    SessionStarted { session_id: String },
    StartFailed { error: String },
    SessionPaused { session_id: String },
    SessionResumed { session_id: String },
    /// No confirming event arrived within the bounded wait for `request`.
    ConfirmTimedOut {
        session_id: String,
        command: PendingCommand,
        request: u64,
    },
    CommandFailed {
        command: PendingCommand,
        request: u64,
        error: String,
    },
    /// A cancel command succeeded.
    CancelAcknowledged { session_id: String },
    CancelFailed { error: String },
    SessionCancelled { session_id: String },
    SessionFinished { session_id: String },
    Reconciled {
        session_id: String,
        report: ReconcileReport,
    },
    ReconcileFailed { session_id: String, error: String },
    /// Backend dropped the session; `None` means every session.
    SessionPurged { session_id: Option<String> },
    NoOp,
}
