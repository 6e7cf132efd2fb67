use std::fmt;

use serde::Serialize;

use crate::{DownloadItem, FailedItem, PendingCommand, RejectReason, SessionKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Scrape,
    Download,
}

/// Lifecycle of the one logical session the coordinator tracks.
///
/// `Idle -> Starting -> Running <-> Paused -> {Completed | Failed | Cancelled} -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Closed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Paused => "paused",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
            Phase::Closed => "closed",
        }
    }

    /// Starting, running or paused.
    pub fn is_live(self) -> bool {
        matches!(self, Phase::Starting | Phase::Running | Phase::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single globally tracked session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSessionPointer {
    pub kind: SessionKind,
    pub url: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadSessionStatus {
    #[default]
    Queued,
    Downloading,
    Paused,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadSessionRecord {
    /// Known once the backend acknowledged the start.
    pub session_id: Option<String>,
    pub items: Vec<DownloadItem>,
    pub destination: String,
    pub status: DownloadSessionStatus,
    /// Filled from the reconciliation read after a terminal event.
    pub failed_items: Vec<FailedItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub kind: SessionKind,
    pub session_id: Option<String>,
    pub phase: Phase,
    pub total: usize,
    pub completed: usize,
    pub failed_items: Vec<FailedItem>,
    /// `false` when the durable record could not be read.
    pub authoritative: bool,
    pub error: Option<String>,
}

/// Where "resume active session" should navigate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationTarget {
    Scrape {
        key: SessionKey,
    },
    Download {
        session_id: Option<String>,
        destination: String,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LifecycleState {
    pub(crate) phase: Phase,
    pub(crate) pointer: Option<ActiveSessionPointer>,
    pub(crate) script_lock: bool,
    /// The command waiting for confirmation and its request number.
    pub(crate) pending: Option<(PendingCommand, u64)>,
    pub(crate) requests: u64,
    pub(crate) cancel_in_flight: bool,
    pub(crate) reconciling: bool,
    pub(crate) download: Option<DownloadSessionRecord>,
    pub(crate) scrape: Option<SessionKey>,
    pub(crate) summary: Option<SessionSummary>,
    pub(crate) rejection: Option<RejectReason>,
    pub(crate) dirty: bool,
}

impl LifecycleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn active_session(&self) -> Option<&ActiveSessionPointer> {
        self.pointer.as_ref()
    }

    /// A session is starting, running or paused.
    pub fn has_active_session(&self) -> bool {
        self.pointer.is_some() && self.phase.is_live()
    }

    /// The tracked session reached a terminal phase but is not closed yet.
    pub fn session_badge_done(&self) -> bool {
        self.pointer.is_some() && self.phase.is_terminal()
    }

    pub fn script_locked(&self) -> bool {
        self.script_lock
    }

    pub fn pending_command(&self) -> Option<PendingCommand> {
        self.pending.map(|(command, _)| command)
    }

    /// Number of the pause/resume request still waiting for its event.
    pub fn pending_request(&self) -> Option<u64> {
        self.pending.map(|(_, request)| request)
    }

    pub fn is_reconciling(&self) -> bool {
        self.reconciling
    }

    pub fn download(&self) -> Option<&DownloadSessionRecord> {
        self.download.as_ref()
    }

    pub fn scrape_key(&self) -> Option<&SessionKey> {
        self.scrape.as_ref()
    }

    pub fn summary(&self) -> Option<&SessionSummary> {
        self.summary.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.pointer
            .as_ref()
            .and_then(|pointer| pointer.session_id.as_deref())
    }

    pub fn resume_target(&self) -> Option<NavigationTarget> {
        let pointer = self.pointer.as_ref()?;
        match pointer.kind {
            SessionKind::Scrape => self
                .scrape
                .clone()
                .map(|key| NavigationTarget::Scrape { key }),
            SessionKind::Download => Some(NavigationTarget::Download {
                session_id: pointer.session_id.clone(),
                destination: self
                    .download
                    .as_ref()
                    .map(|record| record.destination.clone())
                    .unwrap_or_default(),
            }),
        }
    }

    /// The reason the last request was refused, if any.
    pub fn take_rejection(&mut self) -> Option<RejectReason> {
        self.rejection.take()
    }

    pub fn consume_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn kind(&self) -> Option<SessionKind> {
        self.pointer.as_ref().map(|pointer| pointer.kind)
    }

    /// `true` if `session_id` is the tracked download session.
    pub(crate) fn is_current(&self, session_id: &str) -> bool {
        self.session_id() == Some(session_id)
    }

    pub(crate) fn destination(&self) -> String {
        self.download
            .as_ref()
            .map(|record| record.destination.clone())
            .unwrap_or_default()
    }
}
