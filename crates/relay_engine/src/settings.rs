use std::time::Duration;

use relay_core::FailurePolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Write-behind window for raw progress events.
    pub flush_interval: Duration,
    /// How long a pause/resume waits for the backend's confirming event.
    pub pause_timeout: Duration,
    /// Background reconciliation tick while a session is open.
    pub reconcile_interval: Duration,
    pub reconcile_attempts: u32,
    pub reconcile_retry_delay: Duration,
    pub signal_capacity: usize,
    /// Newly discovered scrape items start out selected.
    pub select_all: bool,
    pub failure_policy: FailurePolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(500),
            pause_timeout: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(1),
            reconcile_attempts: 3,
            reconcile_retry_delay: Duration::from_millis(250),
            signal_capacity: 256,
            select_all: true,
            failure_policy: FailurePolicy::default(),
        }
    }
}
