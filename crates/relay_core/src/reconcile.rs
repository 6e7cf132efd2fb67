//! Reconciliation against the backend's durable per-session record.

use serde::{Deserialize, Serialize};

use crate::{ProgressPatch, ProgressStatus};

/// One authoritative row from `read_download_session`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionRow {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub downloaded: u64,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub eta: Option<u64>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

impl SessionRow {
    /// Patch carrying every field the row provides; these win over push data.
    pub fn to_patch(&self) -> ProgressPatch {
        let status = ProgressStatus::parse(&self.status);
        ProgressPatch {
            filename: self.filename.clone().filter(|name| !name.is_empty()),
            status,
            progress: self.progress,
            downloaded: Some(self.downloaded),
            total: self.total,
            speed: self.speed,
            eta: self.eta,
            error: match status {
                Some(ProgressStatus::Failed) => self.error.clone(),
                _ => None,
            },
            ..ProgressPatch::default()
        }
    }
}

/// Policy for deciding that a reconciled item failed.
///
/// The fallback rule (incomplete progress with an unrecognized status) is a
/// heuristic and may flag slow items; tune it here instead of in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    /// Lowercase status labels that count as alive or finished.
    pub in_flight: Vec<String>,
    /// Lowercase substrings marking a failure or cancellation.
    pub failure_patterns: Vec<String>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            in_flight: ["queued", "downloading", "paused", "starting", "running", "completed"]
                .into_iter()
                .map(String::from)
                .collect(),
            failure_patterns: ["fail", "error", "cancel", "abort"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl FailurePolicy {
    pub fn is_failed(&self, row: &SessionRow) -> bool {
        if row.error.as_deref().is_some_and(|e| !e.trim().is_empty()) {
            return true;
        }
        let status = row.status.trim().to_ascii_lowercase();
        if self
            .failure_patterns
            .iter()
            .any(|pattern| status.contains(pattern.as_str()))
        {
            return true;
        }
        let incomplete = row.progress.map_or(true, |p| p < 1.0);
        incomplete && !self.in_flight.iter().any(|label| *label == status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub url: String,
    pub filename: Option<String>,
    pub status: String,
    pub error: Option<String>,
}

/// Result of one reconciliation read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub rows: Vec<SessionRow>,
    pub failed_items: Vec<FailedItem>,
    pub completed: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.rows.len()
    }
}

pub fn summarize(rows: Vec<SessionRow>, policy: &FailurePolicy) -> ReconcileReport {
    let failed_items = rows
        .iter()
        .filter(|row| policy.is_failed(row))
        .map(|row| FailedItem {
            url: row.url.clone(),
            filename: row.filename.clone(),
            status: row.status.clone(),
            error: row.error.clone(),
        })
        .collect();
    let completed = rows
        .iter()
        .filter(|row| ProgressStatus::parse(&row.status) == Some(ProgressStatus::Completed))
        .count();
    ReconcileReport {
        rows,
        failed_items,
        completed,
    }
}
