//! Typed backend events.
//!
//! The backend emits named events with JSON payloads. [`BackendEvent::parse`]
//! narrows them into closed enums at the ingestion boundary so nothing
//! downstream handles raw JSON.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::{DownloadItem, EventError};

/// Payload of `download_progress`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressPayload {
    pub url: String,
    #[serde(default)]
    pub progress: Option<f64>,
    pub downloaded: u64,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub eta: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Payload shared by the per-item lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ItemPayload {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, alias = "size")]
    pub downloaded: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub items_downloaded: Option<u32>,
    #[serde(default)]
    pub items_skipped: Option<u32>,
    #[serde(default)]
    pub items_failed: Option<u32>,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Progress(ProgressPayload),
    ItemQueued(ItemPayload),
    ItemStarted(ItemPayload),
    ItemPaused(ItemPayload),
    ItemResumed(ItemPayload),
    ItemCompleted(ItemPayload),
    ItemError(ItemPayload),
}

impl DownloadEvent {
    pub fn url(&self) -> &str {
        match self {
            DownloadEvent::Progress(p) => &p.url,
            DownloadEvent::ItemQueued(p)
            | DownloadEvent::ItemStarted(p)
            | DownloadEvent::ItemPaused(p)
            | DownloadEvent::ItemResumed(p)
            | DownloadEvent::ItemCompleted(p)
            | DownloadEvent::ItemError(p) => &p.url,
        }
    }
}

/// Final scrape payload, from `scrape_done` or the `run_script` result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ScrapeDone {
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub items: Vec<DownloadItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeEvent {
    Item(DownloadItem),
    Done(ScrapeDone),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Started,
    Finished,
    Paused,
    Resumed,
    Cancelled,
    Cleanup,
    Purged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    /// Absent only for a global `purged`.
    pub session_id: Option<String>,
    pub count: Option<usize>,
    pub destination: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    #[serde(default, alias = "sessionId", alias = "session")]
    session_id: Option<String>,
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    destination: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Download(DownloadEvent),
    Scrape(ScrapeEvent),
    Session(SessionEvent),
}

impl BackendEvent {
    /// Narrow a named backend event into its typed form.
    pub fn parse(name: &str, payload: Value) -> Result<Self, EventError> {
        let event = match name {
            "download_progress" => BackendEvent::Download(DownloadEvent::Progress(decode(
                "download_progress",
                payload,
            )?)),
            "download_item_queued" => BackendEvent::Download(DownloadEvent::ItemQueued(decode(
                "download_item_queued",
                payload,
            )?)),
            "download_item_started" => BackendEvent::Download(DownloadEvent::ItemStarted(
                decode("download_item_started", payload)?,
            )),
            "download_item_paused" => BackendEvent::Download(DownloadEvent::ItemPaused(decode(
                "download_item_paused",
                payload,
            )?)),
            "download_item_resumed" => BackendEvent::Download(DownloadEvent::ItemResumed(
                decode("download_item_resumed", payload)?,
            )),
            "download_item_completed" => BackendEvent::Download(DownloadEvent::ItemCompleted(
                decode("download_item_completed", payload)?,
            )),
            "download_item_error" => BackendEvent::Download(DownloadEvent::ItemError(decode(
                "download_item_error",
                payload,
            )?)),
            "scrape_item" => {
                BackendEvent::Scrape(ScrapeEvent::Item(decode("scrape_item", payload)?))
            }
            "scrape_done" => {
                BackendEvent::Scrape(ScrapeEvent::Done(decode("scrape_done", payload)?))
            }
            "download_session_started" => {
                session("download_session_started", SessionEventKind::Started, payload)?
            }
            "download_session_finished" => {
                session("download_session_finished", SessionEventKind::Finished, payload)?
            }
            "download_session_paused" => {
                session("download_session_paused", SessionEventKind::Paused, payload)?
            }
            "download_session_resumed" => {
                session("download_session_resumed", SessionEventKind::Resumed, payload)?
            }
            "download_session_cancelled" => {
                session("download_session_cancelled", SessionEventKind::Cancelled, payload)?
            }
            "download_session_cleanup" => {
                session("download_session_cleanup", SessionEventKind::Cleanup, payload)?
            }
            "download_session_purged" => {
                session("download_session_purged", SessionEventKind::Purged, payload)?
            }
            other => return Err(EventError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendEvent::Download(DownloadEvent::Progress(_)) => "download_progress",
            BackendEvent::Download(DownloadEvent::ItemQueued(_)) => "download_item_queued",
            BackendEvent::Download(DownloadEvent::ItemStarted(_)) => "download_item_started",
            BackendEvent::Download(DownloadEvent::ItemPaused(_)) => "download_item_paused",
            BackendEvent::Download(DownloadEvent::ItemResumed(_)) => "download_item_resumed",
            BackendEvent::Download(DownloadEvent::ItemCompleted(_)) => "download_item_completed",
            BackendEvent::Download(DownloadEvent::ItemError(_)) => "download_item_error",
            BackendEvent::Scrape(ScrapeEvent::Item(_)) => "scrape_item",
            BackendEvent::Scrape(ScrapeEvent::Done(_)) => "scrape_done",
            BackendEvent::Session(event) => match event.kind {
                SessionEventKind::Started => "download_session_started",
                SessionEventKind::Finished => "download_session_finished",
                SessionEventKind::Paused => "download_session_paused",
                SessionEventKind::Resumed => "download_session_resumed",
                SessionEventKind::Cancelled => "download_session_cancelled",
                SessionEventKind::Cleanup => "download_session_cleanup",
                SessionEventKind::Purged => "download_session_purged",
            },
        }
    }
}

fn decode<T: DeserializeOwned>(event: &'static str, payload: Value) -> Result<T, EventError> {
    serde_json::from_value(payload).map_err(|source| EventError::Malformed { event, source })
}

fn session(
    event: &'static str,
    kind: SessionEventKind,
    payload: Value,
) -> Result<BackendEvent, EventError> {
    let payload: SessionPayload = decode(event, payload)?;
    let session_id = payload.session_id.filter(|id| !id.is_empty());
    if session_id.is_none() && kind != SessionEventKind::Purged {
        return Err(EventError::MissingField {
            event,
            field: "session_id",
        });
    }
    Ok(BackendEvent::Session(SessionEvent {
        kind,
        session_id,
        count: payload.count,
        destination: payload.destination,
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn progress_event_requires_url_and_downloaded() {
        let err = BackendEvent::parse("download_progress", json!({ "url": "https://x/a" }))
            .unwrap_err();
        assert!(matches!(
            err,
            EventError::Malformed {
                event: "download_progress",
                ..
            }
        ));
    }

    #[test]
    fn session_events_accept_camel_case_id() {
        let event =
            BackendEvent::parse("download_session_paused", json!({ "sessionId": "s1" })).unwrap();
        assert_eq!(
            event,
            BackendEvent::Session(SessionEvent {
                kind: SessionEventKind::Paused,
                session_id: Some("s1".to_string()),
                count: None,
                destination: None,
            })
        );
        assert_eq!(event.name(), "download_session_paused");
    }

    #[test]
    fn purge_may_omit_session_id_but_others_may_not() {
        assert!(BackendEvent::parse("download_session_purged", json!({})).is_ok());
        assert!(matches!(
            BackendEvent::parse("download_session_finished", json!({})),
            Err(EventError::MissingField { .. })
        ));
    }

    #[test]
    fn unknown_event_names_are_rejected() {
        assert!(matches!(
            BackendEvent::parse("icnx:emit_parse_error", json!({})),
            Err(EventError::UnknownEvent(name)) if name == "icnx:emit_parse_error"
        ));
    }

    #[test]
    fn completed_event_reads_size_as_downloaded() {
        let event = BackendEvent::parse(
            "download_item_completed",
            json!({ "url": "https://x/a.bin", "size": 42 }),
        )
        .unwrap();
        match event {
            BackendEvent::Download(DownloadEvent::ItemCompleted(payload)) => {
                assert_eq!(payload.downloaded, Some(42));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
