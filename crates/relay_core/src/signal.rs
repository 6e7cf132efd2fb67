use crate::SessionKey;

/// Named application events for other UI parts.
///
/// Payloads are deliberately minimal: a listener re-reads the canonical
/// store instead of trusting a copy of the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppSignal {
    SessionActiveChanged { session_id: Option<String> },
    ScrapeStoreUpdated { key: SessionKey },
    CardCompleted { url: String },
    CardRemoved { url: String },
    ToastRequest { message: String },
}

impl AppSignal {
    pub fn name(&self) -> &'static str {
        match self {
            AppSignal::SessionActiveChanged { .. } => "session-active-changed",
            AppSignal::ScrapeStoreUpdated { .. } => "scrape-store-updated",
            AppSignal::CardCompleted { .. } => "card-completed",
            AppSignal::CardRemoved { .. } => "card-removed",
            AppSignal::ToastRequest { .. } => "toast-request",
        }
    }
}
