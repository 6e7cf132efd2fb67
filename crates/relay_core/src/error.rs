use thiserror::Error;

/// A backend event that could not be narrowed into a typed event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown backend event `{0}`")]
    UnknownEvent(String),
    #[error("malformed payload for `{event}`: {source}")]
    Malformed {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{event}` payload is missing `{field}`")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
}

/// Why the lifecycle reducer refused a user request.
///
/// The `Display` text is what ends up in the toast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("a script is already running")]
    ScriptRunLocked,
    #[error("another session is still active")]
    SessionActive,
    #[error("no active session")]
    NoActiveSession,
    #[error("a {0} request is already in flight")]
    CommandInFlight(&'static str),
    #[error("the session is still starting")]
    StillStarting,
    #[error("session results are still being reconciled")]
    StillReconciling,
    #[error("cannot {action} while the session is {phase}")]
    InvalidTransition {
        action: &'static str,
        phase: &'static str,
    },
    #[error("nothing to download")]
    EmptyRequest,
}

impl RejectReason {
    /// Duplicate requests are dropped quietly; everything else is worth a toast.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, RejectReason::CommandInFlight(_))
    }
}
