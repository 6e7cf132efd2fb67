use std::collections::BTreeMap;

use relay_logging::relay_debug;

use crate::{DownloadEvent, ProgressBus, ProgressPatch, ProgressStatus, TerminalNotice};

/// Write-behind buffer between raw download events and the [`ProgressBus`].
///
/// Events for the same URL coalesce into one patch; the engine flushes the
/// buffer at most once per flush interval.
#[derive(Debug, Default)]
pub struct IngestBuffer {
    pending: BTreeMap<String, ProgressPatch>,
}

impl IngestBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an event. Returns `true` when the buffer was empty before,
    /// i.e. the caller has to schedule a flush.
    pub fn push(&mut self, event: &DownloadEvent) -> bool {
        let was_empty = self.pending.is_empty();
        let patch = patch_for_event(event);
        self.pending
            .entry(event.url().to_string())
            .or_default()
            .merge(patch);
        was_empty
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of URLs with a pending update.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Apply every pending patch to `bus`, one merged update per URL.
    pub fn flush_into(&mut self, bus: &mut ProgressBus) -> Vec<TerminalNotice> {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            relay_debug!("flushing {} buffered progress update(s)", pending.len());
        }
        pending
            .into_iter()
            .filter_map(|(url, patch)| bus.update_progress(&url, &patch))
            .collect()
    }

    /// Keep only the buffered fields `authoritative` does not provide for
    /// `url`; durable data owns the rest.
    pub fn yield_to(&mut self, url: &str, authoritative: &ProgressPatch) {
        if let Some(patch) = self.pending.get_mut(url) {
            patch.yield_to(authoritative);
            if patch.is_empty() {
                self.pending.remove(url);
            }
        }
    }

    /// Drop buffered updates for URLs that belong to a closed session.
    pub fn discard<'a>(&mut self, urls: impl IntoIterator<Item = &'a str>) {
        for url in urls {
            self.pending.remove(url);
        }
    }
}

/// Translate one raw event into the patch it contributes.
pub fn patch_for_event(event: &DownloadEvent) -> ProgressPatch {
    match event {
        DownloadEvent::Progress(payload) => {
            let status = payload.status.as_deref().and_then(|label| {
                let parsed = ProgressStatus::parse(label);
                if parsed.is_none() {
                    relay_debug!("ignoring unknown status label {:?} for {}", label, payload.url);
                }
                parsed
            });
            let error = match status {
                Some(ProgressStatus::Failed) => payload.error.clone(),
                _ => None,
            };
            ProgressPatch {
                filename: payload.filename.clone(),
                status,
                progress: payload.progress,
                downloaded: Some(payload.downloaded),
                total: payload.total,
                speed: Some(payload.speed),
                eta: payload.eta,
                error,
                ..ProgressPatch::default()
            }
        }
        DownloadEvent::ItemQueued(payload) => ProgressPatch {
            filename: payload.filename.clone(),
            status: Some(ProgressStatus::Queued),
            ..ProgressPatch::default()
        },
        DownloadEvent::ItemStarted(payload) | DownloadEvent::ItemResumed(payload) => {
            ProgressPatch {
                filename: payload.filename.clone(),
                status: Some(ProgressStatus::Downloading),
                downloaded: payload.downloaded,
                total: payload.total,
                ..ProgressPatch::default()
            }
        }
        DownloadEvent::ItemPaused(payload) => ProgressPatch {
            filename: payload.filename.clone(),
            status: Some(ProgressStatus::Paused),
            ..ProgressPatch::default()
        },
        DownloadEvent::ItemCompleted(payload) => ProgressPatch {
            filename: payload.filename.clone(),
            status: Some(ProgressStatus::Completed),
            progress: Some(1.0),
            downloaded: payload.downloaded,
            total: payload.total,
            items_downloaded: payload.items_downloaded,
            items_skipped: payload.items_skipped,
            items_failed: payload.items_failed,
            ..ProgressPatch::default()
        },
        DownloadEvent::ItemError(payload) => ProgressPatch {
            filename: payload.filename.clone(),
            status: Some(ProgressStatus::Failed),
            error: Some(
                payload
                    .error
                    .clone()
                    .filter(|message| !message.is_empty())
                    .unwrap_or_else(|| "download failed".to_string()),
            ),
            downloaded: payload.downloaded,
            total: payload.total,
            items_downloaded: payload.items_downloaded,
            items_skipped: payload.items_skipped,
            items_failed: payload.items_failed,
            ..ProgressPatch::default()
        },
    }
}
