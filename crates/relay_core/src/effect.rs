use serde_json::Value;

use crate::{AppSignal, DownloadItem, PendingCommand, SessionKey};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    RunScript {
        key: SessionKey,
        options: Value,
    },
    StartDownloadSession {
        items: Vec<DownloadItem>,
        destination: String,
    },
    PauseSession {
        session_id: String,
        request: u64,
    },
    ResumeSession {
        session_id: String,
        request: u64,
    },
    /// Schedule a [`crate::Msg::ConfirmTimedOut`] after the bounded wait.
    ArmConfirmTimeout {
        session_id: String,
        command: PendingCommand,
        request: u64,
    },
    /// Forceful cancel first, softer cancel as fallback.
    CancelSession {
        session_id: String,
    },
    BindSession {
        url: String,
        session_id: String,
    },
    Reconcile {
        session_id: String,
        destination: String,
    },
    StartReconcileTicker {
        session_id: String,
        destination: String,
    },
    StopReconcileTicker,
    /// Destroy everything held for a closed session.
    Release(SessionRelease),
    Toast {
        message: String,
    },
    Notify(AppSignal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRelease {
    Download {
        session_id: Option<String>,
        urls: Vec<String>,
    },
    Scrape {
        key: SessionKey,
    },
}
