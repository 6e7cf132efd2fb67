use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use relay_logging::{relay_debug, relay_trace};
use serde::{Deserialize, Serialize};

use crate::DownloadItem;

/// Addresses one scrape run: `scriptName::inputUrl`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(script_name: &str, input_url: &str) -> Self {
        Self(format!("{script_name}::{input_url}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn script_name(&self) -> &str {
        self.0.split_once("::").map_or(self.0.as_str(), |(script, _)| script)
    }

    pub fn input_url(&self) -> &str {
        self.0.split_once("::").map_or("", |(_, url)| url)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScrapeStatus {
    pub label: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScrapeSessionRecord {
    /// Discovery order, unique by URL.
    pub items: Vec<DownloadItem>,
    pub selected: BTreeSet<String>,
    pub status: ScrapeStatus,
    /// Suggested destination, known once scraping completes.
    pub dir: Option<String>,
    /// Set once the backend scraper has been invoked for this key.
    pub started: bool,
}

impl ScrapeSessionRecord {
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    fn is_resumable(&self) -> bool {
        self.started || self.status.done
    }
}

/// What a newly mounted scrape view should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountPlan {
    /// Invoke the scraper.
    Run,
    /// Reuse existing discovery; do not invoke the scraper again.
    Resume(ScrapeSessionRecord),
}

#[derive(Debug, Default)]
struct LiveSession {
    record: ScrapeSessionRecord,
    seen: HashSet<String>,
}

impl LiveSession {
    fn from_record(record: ScrapeSessionRecord) -> Self {
        let seen = record.items.iter().map(|item| item.url.clone()).collect();
        Self { record, seen }
    }

    fn push(&mut self, item: DownloadItem, select: bool) -> bool {
        if item.url.is_empty() || !self.seen.insert(item.url.clone()) {
            return false;
        }
        if select {
            self.record.selected.insert(item.url.clone());
        }
        self.record.items.push(item);
        true
    }

    fn refresh_label(&mut self) {
        let count = self.record.items.len();
        self.record.status.label = if self.record.status.done {
            format!("Done: {count} item(s)")
        } else {
            format!("Scraping... {count} item(s) found")
        };
    }
}

/// Incremental, de-duplicated accumulation of scrape discoveries.
#[derive(Debug, Default)]
pub struct ScrapeSessionStore {
    live: HashMap<SessionKey, LiveSession>,
    handoff: HashMap<SessionKey, ScrapeSessionRecord>,
    select_all: bool,
}

impl ScrapeSessionStore {
    /// With `select_all`, every discovered item starts out selected.
    pub fn new(select_all: bool) -> Self {
        Self {
            select_all,
            ..Self::default()
        }
    }

    /// Current snapshot of the live record.
    pub fn hydrate(&self, key: &SessionKey) -> Option<ScrapeSessionRecord> {
        self.live.get(key).map(|session| session.record.clone())
    }

    /// Last point-in-time copy written by [`Self::persist_snapshot`].
    pub fn handoff(&self, key: &SessionKey) -> Option<ScrapeSessionRecord> {
        self.handoff.get(key).cloned()
    }

    /// Decide whether a mounting view must invoke the scraper.
    ///
    /// Only `force_new` restarts a key that is already started or done.
    /// Read-only: a forced restart is applied by [`Self::begin_run`].
    pub fn mount_plan(&self, key: &SessionKey, force_new: bool) -> MountPlan {
        if force_new {
            return MountPlan::Run;
        }
        if let Some(session) = self.live.get(key) {
            if session.record.is_resumable() {
                return MountPlan::Resume(session.record.clone());
            }
        }
        match self.handoff.get(key) {
            Some(snapshot) if snapshot.is_resumable() => MountPlan::Resume(snapshot.clone()),
            _ => MountPlan::Run,
        }
    }

    /// Reset `key` and mark it started, right before the scraper is invoked.
    pub fn begin_run(&mut self, key: &SessionKey) {
        self.handoff.remove(key);
        let mut session = LiveSession::default();
        session.record.started = true;
        session.record.status.label = "Starting...".to_string();
        self.live.insert(key.clone(), session);
        relay_debug!("scrape {} started", key);
    }

    /// Append a discovered item. No-op (returns `false`) for a URL already seen.
    pub fn append_item(&mut self, key: &SessionKey, item: DownloadItem) -> bool {
        let select = self.select_all;
        let session = self.live_entry(key);
        let added = session.push(item, select);
        if added {
            session.refresh_label();
            relay_trace!("scrape {} now has {} item(s)", key, session.record.items.len());
        }
        added
    }

    /// Merge the terminal payload and mark the session done.
    ///
    /// Items not streamed individually are appended; returns how many.
    pub fn finalize(
        &mut self,
        key: &SessionKey,
        items: Vec<DownloadItem>,
        dir: Option<String>,
    ) -> usize {
        let select = self.select_all;
        let session = self.live_entry(key);
        let added = items
            .into_iter()
            .filter(|item| session.push(item.clone(), select))
            .count();
        session.record.status.done = true;
        if dir.is_some() {
            session.record.dir = dir;
        }
        session.refresh_label();
        relay_debug!(
            "scrape {} done with {} item(s) ({} only in final payload)",
            key,
            session.record.items.len(),
            added
        );
        added
    }

    /// Merge items recovered from the backend's durable scrape record.
    /// Never changes `done`.
    pub fn merge_recovered(&mut self, key: &SessionKey, items: Vec<DownloadItem>) -> usize {
        let Some(session) = self.live.get_mut(key) else {
            return 0;
        };
        let select = self.select_all;
        let added = items
            .into_iter()
            .filter(|item| session.push(item.clone(), select))
            .count();
        if added > 0 {
            session.refresh_label();
        }
        added
    }

    /// Record a failed scraper run; a later mount may run it again.
    pub fn mark_failed(&mut self, key: &SessionKey, message: &str) {
        let session = self.live_entry(key);
        if session.record.status.done {
            return;
        }
        session.record.started = false;
        session.record.status.label = format!("Failed: {message}");
    }

    /// Write a point-in-time copy to the handoff slot.
    pub fn persist_snapshot(&mut self, key: &SessionKey) -> bool {
        match self.live.get(key) {
            Some(session) => {
                self.handoff.insert(key.clone(), session.record.clone());
                true
            }
            None => false,
        }
    }

    /// Flip selection of `url`. Returns the new state; unknown URLs stay unselected.
    pub fn toggle_selected(&mut self, key: &SessionKey, url: &str) -> bool {
        let Some(session) = self.live.get_mut(key) else {
            return false;
        };
        if !session.seen.contains(url) {
            return false;
        }
        if session.record.selected.remove(url) {
            false
        } else {
            session.record.selected.insert(url.to_string());
            true
        }
    }

    pub fn select_all_items(&mut self, key: &SessionKey) {
        if let Some(session) = self.live.get_mut(key) {
            session.record.selected = session.seen.iter().cloned().collect();
        }
    }

    pub fn clear_selection(&mut self, key: &SessionKey) {
        if let Some(session) = self.live.get_mut(key) {
            session.record.selected.clear();
        }
    }

    /// Selected items in discovery order.
    pub fn selected_items(&self, key: &SessionKey) -> Vec<DownloadItem> {
        self.live
            .get(key)
            .map(|session| {
                session
                    .record
                    .items
                    .iter()
                    .filter(|item| session.record.selected.contains(&item.url))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Destroy both the live record and the handoff snapshot.
    pub fn remove(&mut self, key: &SessionKey) -> Option<ScrapeSessionRecord> {
        self.handoff.remove(key);
        self.live.remove(key).map(|session| session.record)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.live.contains_key(key)
    }

    fn live_entry(&mut self, key: &SessionKey) -> &mut LiveSession {
        // Events for a key without a live record are seeded from the
        // handoff copy if there is one.
        let handoff = &self.handoff;
        self.live.entry(key.clone()).or_insert_with(|| {
            LiveSession::from_record(handoff.get(key).cloned().unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_splits_on_first_separator() {
        let key = SessionKey::new("gallery", "https://x/page::2");
        assert_eq!(key.as_str(), "gallery::https://x/page::2");
        assert_eq!(key.script_name(), "gallery");
        assert_eq!(key.input_url(), "https://x/page::2");
    }

    #[test]
    fn running_label_tracks_item_count() {
        let key = SessionKey::new("s", "u");
        let mut store = ScrapeSessionStore::new(false);
        store.begin_run(&key);
        store.append_item(&key, DownloadItem::new("https://x/1"));
        store.append_item(&key, DownloadItem::new("https://x/2"));
        assert_eq!(
            store.hydrate(&key).unwrap().status.label,
            "Scraping... 2 item(s) found"
        );
    }
}
