use std::collections::BTreeMap;
use std::fmt;

use relay_logging::relay_trace;
use serde::{Deserialize, Serialize};

use crate::filename_from_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressStatus {
    /// Parse a backend status label. Unknown labels yield `None`.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" => Some(ProgressStatus::Queued),
            "downloading" | "started" | "running" | "resumed" => Some(ProgressStatus::Downloading),
            "paused" => Some(ProgressStatus::Paused),
            "completed" | "complete" | "done" => Some(ProgressStatus::Completed),
            "failed" | "error" => Some(ProgressStatus::Failed),
            "cancelled" | "canceled" => Some(ProgressStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Queued => "queued",
            ProgressStatus::Downloading => "downloading",
            ProgressStatus::Paused => "paused",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
            ProgressStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::Cancelled
        )
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical download progress for one source URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub url: String,
    pub filename: String,
    pub status: ProgressStatus,
    /// Fraction in `[0, 1]`; `None` until the first event.
    pub progress: Option<f64>,
    pub downloaded: u64,
    /// `None` for chunked transfers.
    pub total: Option<u64>,
    /// Bytes per second.
    pub speed: f64,
    /// Seconds remaining.
    pub eta: Option<u64>,
    /// Only set while `status` is `Failed`.
    pub error: Option<String>,
    pub items_downloaded: u32,
    pub items_skipped: u32,
    pub items_failed: u32,
}

impl ProgressRecord {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            filename: filename_from_url(&url),
            url,
            status: ProgressStatus::Queued,
            progress: None,
            downloaded: 0,
            total: None,
            speed: 0.0,
            eta: None,
            error: None,
            items_downloaded: 0,
            items_skipped: 0,
            items_failed: 0,
        }
    }

    /// Merge `patch` into the record and restore the record invariants.
    ///
    /// Returns a notice when the merge moved the record into `Completed` or
    /// `Failed`. A repeated patch never produces a second notice, and the
    /// failure counter moves only on that transition.
    pub(crate) fn apply(&mut self, patch: &ProgressPatch) -> Option<TerminalNotice> {
        let previous = self.status;

        if let Some(filename) = patch.filename.as_ref().filter(|name| !name.is_empty()) {
            self.filename = filename.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress.filter(|p| p.is_finite()) {
            self.progress = Some(progress.clamp(0.0, 1.0));
        }
        if let Some(downloaded) = patch.downloaded {
            self.downloaded = downloaded;
        }
        if patch.total.is_some() {
            self.total = patch.total;
        }
        if let Some(speed) = patch.speed.filter(|s| s.is_finite()) {
            self.speed = speed.max(0.0);
        }
        if patch.eta.is_some() {
            self.eta = patch.eta;
        }
        if let Some(error) = patch.error.as_ref() {
            self.error = Some(error.clone());
        }
        if let Some(count) = patch.items_downloaded {
            self.items_downloaded = count;
        }
        if let Some(count) = patch.items_skipped {
            self.items_skipped = count;
        }
        if let Some(count) = patch.items_failed {
            self.items_failed = self.items_failed.max(count);
        }

        // A full ratio means completed unless the item ended some other way.
        // A pause racing the last chunk still counts as done.
        if self.progress.is_some_and(|p| p >= 1.0)
            && matches!(
                self.status,
                ProgressStatus::Queued | ProgressStatus::Downloading | ProgressStatus::Paused
            )
        {
            self.status = ProgressStatus::Completed;
        }

        match self.status {
            ProgressStatus::Completed => {
                self.progress = Some(1.0);
                self.eta = None;
                self.error = None;
                if let Some(total) = self.total {
                    self.downloaded = self.downloaded.max(total);
                }
            }
            ProgressStatus::Failed => {
                if self.error.as_deref().map_or(true, str::is_empty) {
                    self.error = Some("download failed".to_string());
                }
            }
            _ => self.error = None,
        }

        if self.status == previous {
            return None;
        }
        match self.status {
            ProgressStatus::Completed => Some(TerminalNotice {
                url: self.url.clone(),
                status: ProgressStatus::Completed,
                error: None,
            }),
            ProgressStatus::Failed => {
                if patch.items_failed.is_none() {
                    self.items_failed = self.items_failed.saturating_add(1);
                }
                Some(TerminalNotice {
                    url: self.url.clone(),
                    status: ProgressStatus::Failed,
                    error: self.error.clone(),
                })
            }
            _ => None,
        }
    }
}

/// A partial update. `None` fields leave the record untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressPatch {
    pub filename: Option<String>,
    pub status: Option<ProgressStatus>,
    pub progress: Option<f64>,
    pub downloaded: Option<u64>,
    pub total: Option<u64>,
    pub speed: Option<f64>,
    pub eta: Option<u64>,
    pub error: Option<String>,
    pub items_downloaded: Option<u32>,
    pub items_skipped: Option<u32>,
    pub items_failed: Option<u32>,
}

impl ProgressPatch {
    pub fn status(status: ProgressStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Coalesce a later patch on top of this one: every field the later
    /// patch sets wins.
    pub fn merge(&mut self, later: ProgressPatch) {
        fn take<T>(slot: &mut Option<T>, later: Option<T>) {
            if later.is_some() {
                *slot = later;
            }
        }
        take(&mut self.filename, later.filename);
        take(&mut self.status, later.status);
        take(&mut self.progress, later.progress);
        take(&mut self.downloaded, later.downloaded);
        take(&mut self.total, later.total);
        take(&mut self.speed, later.speed);
        take(&mut self.eta, later.eta);
        take(&mut self.error, later.error);
        take(&mut self.items_downloaded, later.items_downloaded);
        take(&mut self.items_skipped, later.items_skipped);
        take(&mut self.items_failed, later.items_failed);
        // An error only describes a failure; a later non-failed status drops it.
        if self
            .status
            .is_some_and(|status| status != ProgressStatus::Failed)
        {
            self.error = None;
        }
    }

    /// Drop every field `authoritative` sets, keeping the rest.
    pub fn yield_to(&mut self, authoritative: &ProgressPatch) {
        fn clear<T>(slot: &mut Option<T>, other: &Option<T>) {
            if other.is_some() {
                *slot = None;
            }
        }
        clear(&mut self.filename, &authoritative.filename);
        clear(&mut self.status, &authoritative.status);
        clear(&mut self.progress, &authoritative.progress);
        clear(&mut self.downloaded, &authoritative.downloaded);
        clear(&mut self.total, &authoritative.total);
        clear(&mut self.speed, &authoritative.speed);
        clear(&mut self.eta, &authoritative.eta);
        clear(&mut self.error, &authoritative.error);
        clear(&mut self.items_downloaded, &authoritative.items_downloaded);
        clear(&mut self.items_skipped, &authoritative.items_skipped);
        clear(&mut self.items_failed, &authoritative.items_failed);
        // A buffered error belongs to a buffered failed status.
        if self.status.is_none() {
            self.error = None;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Secondary notification raised when a record becomes completed or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalNotice {
    pub url: String,
    pub status: ProgressStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type ProgressMap = BTreeMap<String, ProgressRecord>;

type Subscriber = Box<dyn FnMut(&str, &ProgressRecord, &ProgressMap) + Send>;
type TerminalListener = Box<dyn FnMut(&TerminalNotice) + Send>;

/// Single source of UI-visible download progress.
///
/// Subscribers run synchronously inside [`ProgressBus::update_progress`], in
/// subscription order.
#[derive(Default)]
pub struct ProgressBus {
    records: ProgressMap,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    terminal_listeners: Vec<(SubscriptionId, TerminalListener)>,
    next_id: u64,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `patch` into the record for `url` (creating it if absent) and
    /// notify subscribers with the merged record and a full snapshot.
    pub fn update_progress(&mut self, url: &str, patch: &ProgressPatch) -> Option<TerminalNotice> {
        let record = self
            .records
            .entry(url.to_string())
            .or_insert_with(|| ProgressRecord::new(url));
        let notice = record.apply(patch);
        relay_trace!(
            "progress {} -> {} {:?}",
            url,
            record.status,
            record.progress
        );

        if let Some(record) = self.records.get(url) {
            for (_, subscriber) in self.subscribers.iter_mut() {
                subscriber(url, record, &self.records);
            }
        }
        if let Some(notice) = notice.as_ref() {
            for (_, listener) in self.terminal_listeners.iter_mut() {
                listener(notice);
            }
        }
        notice
    }

    pub fn get_progress(&self, url: &str) -> Option<&ProgressRecord> {
        self.records.get(url)
    }

    /// A copy of every record.
    pub fn get_all_progress(&self) -> ProgressMap {
        self.records.clone()
    }

    pub fn add_subscriber<F>(&mut self, subscriber: F) -> SubscriptionId
    where
        F: FnMut(&str, &ProgressRecord, &ProgressMap) + Send + 'static,
    {
        let id = self.allocate_id();
        self.subscribers.push((id, Box::new(subscriber)));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn remove_subscriber(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(existing, _)| *existing != id);
        self.subscribers.len() != before
    }

    pub fn add_terminal_listener<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&TerminalNotice) + Send + 'static,
    {
        let id = self.allocate_id();
        self.terminal_listeners.push((id, Box::new(listener)));
        id
    }

    /// Drop records for a closed session. Subscribers are not notified.
    pub fn forget<'a>(&mut self, urls: impl IntoIterator<Item = &'a str>) -> usize {
        urls.into_iter()
            .filter(|url| self.records.remove(*url).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn allocate_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }
}

impl fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressBus")
            .field("records", &self.records)
            .field("subscribers", &self.subscribers.len())
            .field("terminal_listeners", &self.terminal_listeners.len())
            .finish()
    }
}
