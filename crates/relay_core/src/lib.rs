//! Relay core: canonical in-memory stores and the session lifecycle reducer.
//!
//! Nothing in this crate performs I/O or owns a timer. The engine crate
//! drives these types from backend events and schedules flushes.
mod cards;
mod effect;
mod error;
mod events;
mod ingest;
mod item;
mod msg;
mod progress;
mod reconcile;
mod scrape;
mod session;
mod signal;
mod update;

pub use cards::{OverviewCard, OverviewCardRegistry, StoredCard};
pub use effect::{Effect, SessionRelease};
pub use error::{EventError, RejectReason};
pub use events::{
    BackendEvent, DownloadEvent, ItemPayload, ProgressPayload, ScrapeDone, ScrapeEvent,
    SessionEvent, SessionEventKind,
};
pub use ingest::{patch_for_event, IngestBuffer};
pub use item::{filename_from_url, DownloadItem};
pub use msg::{Msg, PendingCommand};
pub use progress::{
    ProgressBus, ProgressMap, ProgressPatch, ProgressRecord, ProgressStatus, SubscriptionId,
    TerminalNotice,
};
pub use reconcile::{summarize, FailedItem, FailurePolicy, ReconcileReport, SessionRow};
pub use scrape::{MountPlan, ScrapeSessionRecord, ScrapeSessionStore, ScrapeStatus, SessionKey};
pub use session::{
    ActiveSessionPointer, DownloadSessionRecord, DownloadSessionStatus, LifecycleState,
    NavigationTarget, Phase, SessionKind, SessionSummary,
};
pub use signal::AppSignal;
pub use update::update;
