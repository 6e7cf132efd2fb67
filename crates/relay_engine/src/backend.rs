use relay_core::{DownloadItem, ScrapeDone, SessionKey, SessionRow};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("{command} failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },
    #[error("{command} rejected: {message}")]
    Rejected {
        command: &'static str,
        message: String,
    },
    #[error("malformed response from {command}: {message}")]
    Malformed {
        command: &'static str,
        message: String,
    },
    #[error("backend unavailable")]
    Unavailable,
}

/// Commands the engine issues to the download/scrape backend.
///
/// Results only acknowledge the command. State changes still arrive as
/// pushed events, except where noted.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Returns the new session id.
    async fn start_download_session(
        &self,
        items: &[DownloadItem],
        destination: &str,
    ) -> Result<String, BackendError>;

    async fn pause_download_session(&self, session_id: &str) -> Result<(), BackendError>;

    async fn resume_download_session(&self, session_id: &str) -> Result<(), BackendError>;

    async fn cancel_download_session(&self, session_id: &str) -> Result<(), BackendError>;

    async fn force_cancel_download_session(&self, session_id: &str) -> Result<(), BackendError>;

    /// Durable per-item rows for a session.
    async fn read_download_session(
        &self,
        session_id: &str,
        destination: &str,
    ) -> Result<Vec<SessionRow>, BackendError>;

    /// Items the backend recorded for a scrape run.
    async fn read_scrape_session(
        &self,
        key: &SessionKey,
    ) -> Result<Vec<DownloadItem>, BackendError>;

    /// Runs the script to completion. The returned payload carries the
    /// final item list, the same shape as a `scrape_done` event.
    async fn run_script(&self, script_name: &str, options: &Value)
        -> Result<ScrapeDone, BackendError>;
}
