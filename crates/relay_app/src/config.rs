use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_core::FailurePolicy;
use relay_engine::EngineSettings;
use relay_logging::{relay_info, relay_warn, LogDestination};
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV: &str = "RELAY_CONFIG";
const DEFAULT_CONFIG: &str = "relay.ron";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
}

/// Contents of `relay.ron`. Every field is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_destination: LogDestination,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub replay: Option<PathBuf>,
    pub select_all: Option<bool>,
    pub flush_interval_ms: Option<u64>,
    pub pause_timeout_ms: Option<u64>,
    pub reconcile_interval_ms: Option<u64>,
    pub reconcile_attempts: Option<u32>,
    pub reconcile_retry_delay_ms: Option<u64>,
    pub failure_policy: Option<FailurePolicy>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_destination: LogDestination::Terminal,
            log_level: "info".to_string(),
            log_file: None,
            state_dir: PathBuf::from(".relay"),
            replay: None,
            select_all: None,
            flush_interval_ms: None,
            pause_timeout_ms: None,
            reconcile_interval_ms: None,
            reconcile_attempts: None,
            reconcile_retry_delay_ms: None,
            failure_policy: None,
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Engine settings with this file's overrides applied.
    pub fn engine_settings(&self) -> EngineSettings {
        let defaults = EngineSettings::default();
        let millis = |value: Option<u64>, fallback: Duration| {
            value.map_or(fallback, Duration::from_millis)
        };
        EngineSettings {
            flush_interval: millis(self.flush_interval_ms, defaults.flush_interval),
            pause_timeout: millis(self.pause_timeout_ms, defaults.pause_timeout),
            reconcile_interval: millis(self.reconcile_interval_ms, defaults.reconcile_interval),
            reconcile_attempts: self.reconcile_attempts.unwrap_or(defaults.reconcile_attempts),
            reconcile_retry_delay: millis(
                self.reconcile_retry_delay_ms,
                defaults.reconcile_retry_delay,
            ),
            select_all: self.select_all.unwrap_or(defaults.select_all),
            failure_policy: self
                .failure_policy
                .clone()
                .unwrap_or(defaults.failure_policy),
            signal_capacity: defaults.signal_capacity,
        }
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(relay_logging::default_log_file)
    }
}

/// `$RELAY_CONFIG` if set, else `./relay.ron`.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

/// Where [`load`] got its configuration from.
#[derive(Debug)]
pub enum ConfigSource {
    File,
    Missing,
    Invalid(ConfigError),
}

/// A missing file means defaults; an unreadable or malformed one is
/// reported and also falls back to defaults. Runs before logging is up, so
/// the source is returned alongside the config to be logged later.
pub fn load(path: &Path) -> (AppConfig, ConfigSource) {
    if !path.exists() {
        return (AppConfig::default(), ConfigSource::Missing);
    }
    match AppConfig::from_file(path) {
        Ok(config) => (config, ConfigSource::File),
        Err(err) => (AppConfig::default(), ConfigSource::Invalid(err)),
    }
}

pub fn report(path: &Path, source: &ConfigSource) {
    match source {
        ConfigSource::File => relay_info!("configuration from {:?}", path),
        ConfigSource::Missing => relay_info!("no configuration at {:?}, using defaults", path),
        ConfigSource::Invalid(err) => relay_warn!("using default configuration: {}", err),
    }
}
