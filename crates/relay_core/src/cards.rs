use relay_logging::{relay_debug, relay_warn};
use serde::{Deserialize, Serialize};

use crate::{filename_from_url, ProgressRecord, ProgressStatus, ScrapeSessionRecord};

/// Dashboard row for one visible operation. A projection, never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverviewCard {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub destination: String,
    pub session_id: Option<String>,
    pub script_name: Option<String>,
    pub is_scrape: bool,
    pub status: String,
    pub progress: f64,
}

impl OverviewCard {
    pub fn download(
        id: impl Into<String>,
        url: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        let url = url.into();
        Self {
            id: id.into(),
            filename: filename_from_url(&url),
            url,
            destination: destination.into(),
            session_id: None,
            script_name: None,
            is_scrape: false,
            status: ProgressStatus::Queued.as_str().to_string(),
            progress: 0.0,
        }
    }

    pub fn scrape(
        id: impl Into<String>,
        input_url: impl Into<String>,
        script_name: impl Into<String>,
    ) -> Self {
        let url = input_url.into();
        Self {
            id: id.into(),
            filename: filename_from_url(&url),
            url,
            destination: String::new(),
            session_id: None,
            script_name: Some(script_name.into()),
            is_scrape: true,
            status: "Starting...".to_string(),
            progress: 0.0,
        }
    }

    fn same_slot(&self, other: &OverviewCard) -> bool {
        self.url == other.url && self.is_scrape == other.is_scrape
    }
}

/// Card as found on disk. Every field is optional so that entries written by
/// older versions still load; [`OverviewCardRegistry::load`] repairs them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredCard {
    pub id: Option<String>,
    pub url: Option<String>,
    #[serde(alias = "sourceUrl", alias = "inputUrl", alias = "source_url")]
    pub input_url: Option<String>,
    pub filename: Option<String>,
    #[serde(alias = "dir")]
    pub destination: Option<String>,
    #[serde(alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(alias = "scriptName")]
    pub script_name: Option<String>,
    #[serde(alias = "isScrape")]
    pub is_scrape: Option<bool>,
    pub status: Option<String>,
    pub progress: Option<f64>,
}

impl From<&OverviewCard> for StoredCard {
    fn from(card: &OverviewCard) -> Self {
        Self {
            id: Some(card.id.clone()),
            url: Some(card.url.clone()),
            input_url: None,
            filename: Some(card.filename.clone()),
            destination: Some(card.destination.clone()),
            session_id: card.session_id.clone(),
            script_name: card.script_name.clone(),
            is_scrape: Some(card.is_scrape),
            status: Some(card.status.clone()),
            progress: Some(card.progress),
        }
    }
}

impl StoredCard {
    /// Best-effort repair into a usable card; `None` when no URL can be found.
    fn repair(self) -> Option<OverviewCard> {
        let url = non_empty(self.url)
            .or_else(|| non_empty(self.input_url))
            .or_else(|| self.id.clone().filter(|id| id.contains("://")))?;
        let is_scrape = self.is_scrape.unwrap_or(self.script_name.is_some());
        let id = non_empty(self.id).unwrap_or_else(|| {
            let prefix = if is_scrape { "scrape" } else { "download" };
            format!("{prefix}:{url}")
        });
        Some(OverviewCard {
            id,
            filename: non_empty(self.filename).unwrap_or_else(|| filename_from_url(&url)),
            destination: self.destination.unwrap_or_default(),
            session_id: non_empty(self.session_id),
            script_name: non_empty(self.script_name),
            is_scrape,
            status: non_empty(self.status).unwrap_or_else(|| "queued".to_string()),
            progress: self
                .progress
                .filter(|p| p.is_finite())
                .map_or(0.0, |p| p.clamp(0.0, 1.0)),
            url,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Ordered list of overview cards, unique by `(url, is_scrape)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverviewCardRegistry {
    cards: Vec<OverviewCard>,
}

impl OverviewCardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted entries, repairing and de-duplicating them.
    pub fn load(stored: Vec<StoredCard>) -> Self {
        let total = stored.len();
        let mut registry = Self {
            cards: stored.into_iter().filter_map(StoredCard::repair).collect(),
        };
        let dropped = total - registry.cards.len();
        if dropped > 0 {
            relay_warn!("dropped {} persisted card(s) without a url", dropped);
        }
        registry.normalize();
        registry
    }

    /// Collapse duplicate slots. The first position survives with the data
    /// of the last duplicate. Returns how many cards were collapsed.
    pub fn normalize(&mut self) -> usize {
        let cards = std::mem::take(&mut self.cards);
        let before = cards.len();
        for card in cards {
            self.upsert(card);
        }
        let collapsed = before - self.cards.len();
        if collapsed > 0 {
            relay_debug!("normalize collapsed {} duplicate card(s)", collapsed);
        }
        collapsed
    }

    /// Insert or replace in place. Returns `true` if the card is new.
    pub fn upsert(&mut self, card: OverviewCard) -> bool {
        match self.cards.iter_mut().find(|existing| existing.same_slot(&card)) {
            Some(existing) => {
                *existing = card;
                false
            }
            None => {
                self.cards.push(card);
                true
            }
        }
    }

    pub fn remove<F>(&mut self, mut predicate: F) -> Vec<OverviewCard>
    where
        F: FnMut(&OverviewCard) -> bool,
    {
        let mut removed = Vec::new();
        self.cards.retain(|card| {
            if predicate(card) {
                removed.push(card.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Project a progress change onto the download card for `url`.
    pub fn apply_progress(&mut self, record: &ProgressRecord) -> bool {
        match self
            .cards
            .iter_mut()
            .find(|card| !card.is_scrape && card.url == record.url)
        {
            Some(card) => {
                card.status = record.status.as_str().to_string();
                card.progress = record.progress.unwrap_or(0.0);
                if !record.filename.is_empty() {
                    card.filename = record.filename.clone();
                }
                true
            }
            None => false,
        }
    }

    /// Auto-prune: a download card goes away once its record completes.
    /// Scrape cards are never pruned here.
    pub fn prune_completed(&mut self, url: &str) -> Vec<OverviewCard> {
        self.remove(|card| !card.is_scrape && card.url == url)
    }

    /// Project a scrape store change onto the scrape card for `input_url`.
    pub fn apply_scrape(&mut self, input_url: &str, record: &ScrapeSessionRecord) -> bool {
        match self
            .cards
            .iter_mut()
            .find(|card| card.is_scrape && card.url == input_url)
        {
            Some(card) => {
                card.status = record.status.label.clone();
                card.progress = if record.status.done { 1.0 } else { 0.0 };
                if let Some(dir) = record.dir.as_ref() {
                    card.destination = dir.clone();
                }
                true
            }
            None => false,
        }
    }

    /// Attach a backend session id to the download card for `url`.
    pub fn bind_session(&mut self, url: &str, session_id: &str) -> bool {
        match self
            .cards
            .iter_mut()
            .find(|card| !card.is_scrape && card.url == url)
        {
            Some(card) => {
                card.session_id = Some(session_id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn cards(&self) -> &[OverviewCard] {
        &self.cards
    }

    pub fn to_stored(&self) -> Vec<StoredCard> {
        self.cards.iter().map(StoredCard::from).collect()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}
