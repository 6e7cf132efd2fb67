use std::time::Duration;

use relay_core::{summarize, FailurePolicy, ReconcileReport, SessionRow};
use relay_logging::{relay_debug, relay_warn};
use thiserror::Error;

use crate::{Backend, BackendError, EngineSettings};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reading session {session_id} failed after {attempts} attempt(s): {source}")]
    Read {
        session_id: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },
}

/// Reads the backend's durable session record.
///
/// A read that comes back empty right after a terminal event usually lost
/// the race with the backend's own write, so it is retried a few times.
#[derive(Debug, Clone)]
pub struct ReconciliationReader {
    attempts: u32,
    retry_delay: Duration,
    policy: FailurePolicy,
}

impl ReconciliationReader {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            attempts: settings.reconcile_attempts.max(1),
            retry_delay: settings.reconcile_retry_delay,
            policy: settings.failure_policy.clone(),
        }
    }

    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    /// Rows for `session_id`, retrying empty or failed reads. An empty result
    /// after the last attempt is returned as is.
    pub async fn read_rows(
        &self,
        backend: &dyn Backend,
        session_id: &str,
        destination: &str,
    ) -> Result<Vec<SessionRow>, ReconcileError> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match backend.read_download_session(session_id, destination).await {
                Ok(rows) if !rows.is_empty() => return Ok(rows),
                Ok(_) => {
                    relay_debug!("session {} read {} returned no rows", session_id, attempt);
                    last_error = None;
                }
                Err(err) => {
                    relay_debug!("session {} read {} failed: {}", session_id, attempt, err);
                    last_error = Some(err);
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        match last_error {
            Some(source) => Err(ReconcileError::Read {
                session_id: session_id.to_string(),
                attempts: self.attempts,
                source,
            }),
            None => {
                relay_warn!("session {} has no durable rows", session_id);
                Ok(Vec::new())
            }
        }
    }

    /// Read and classify.
    pub async fn read(
        &self,
        backend: &dyn Backend,
        session_id: &str,
        destination: &str,
    ) -> Result<ReconcileReport, ReconcileError> {
        let rows = self.read_rows(backend, session_id, destination).await?;
        Ok(summarize(rows, &self.policy))
    }
}
