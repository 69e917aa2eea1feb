use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawCoreConfig, RawStorage};

/// The single configuration bundle consumed by the deployment core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub storage: StorageBackend,
    pub retention: RetentionConfig,
    pub retry: RetryPolicy,
    pub stabilisation_poll_interval_ms: u64,
    pub resource_lock_timeout_ms: u64,
    pub resource_lock_check_interval_ms: u64,
    pub drift_check_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memfile {
        state_dir: PathBuf,
        max_guide_file_size: u64,
        max_event_partition_size: u64,
    },
    Postgres {
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub events: Duration,
    pub validations: Duration,
    pub changesets: Duration,
    pub reconciliation_results: Duration,
    /// Window served by `subscribe-from-recent`.
    pub recent_event_window: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::Memfile {
                state_dir: PathBuf::from("state"),
                max_guide_file_size: 1024 * 1024,
                max_event_partition_size: 10 * 1024 * 1024,
            },
            retention: RetentionConfig::default(),
            retry: RetryPolicy::default(),
            stabilisation_poll_interval_ms: 5_000,
            resource_lock_timeout_ms: 180_000,
            resource_lock_check_interval_ms: 100,
            drift_check_enabled: false,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            events: DAY * 7,
            validations: DAY * 7,
            changesets: DAY * 7,
            reconciliation_results: DAY * 7,
            recent_event_window: Duration::from_secs(5 * 60),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            first_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl CoreConfig {
    pub fn stabilisation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stabilisation_poll_interval_ms)
    }

    pub fn resource_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_lock_timeout_ms)
    }

    pub fn resource_lock_check_interval(&self) -> Duration {
        Duration::from_millis(self.resource_lock_check_interval_ms)
    }
}

/// Load the core configuration from a YAML file.
///
/// A missing field takes its default; an unknown storage backend is a
/// conversion error.
pub fn load_config(path: &Path) -> Result<CoreConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawCoreConfig =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
            path: path.display().to_string(),
            source: e,
        })?;
    debug!("Loaded core config from {}", path.display());
    convert(raw, path)
}

fn convert(raw: RawCoreConfig, path: &Path) -> Result<CoreConfig, ConfigError> {
    let defaults = CoreConfig::default();

    let storage = match raw.storage {
        None => defaults.storage,
        Some(s) => convert_storage(s, path)?,
    };

    let retention = {
        let r = raw.retention.unwrap_or_default();
        let d = RetentionConfig::default();
        RetentionConfig {
            events: r.events_days.map_or(d.events, |days| DAY * days),
            validations: r.validations_days.map_or(d.validations, |days| DAY * days),
            changesets: r.changesets_days.map_or(d.changesets, |days| DAY * days),
            reconciliation_results: r
                .reconciliation_results_days
                .map_or(d.reconciliation_results, |days| DAY * days),
            recent_event_window: r
                .recent_event_window_seconds
                .map_or(d.recent_event_window, Duration::from_secs),
        }
    };

    let retry = {
        let r = raw.retry.unwrap_or_default();
        let d = RetryPolicy::default();
        let policy = RetryPolicy {
            max_retries: r.max_retries.unwrap_or(d.max_retries),
            first_delay: r.first_delay_ms.map_or(d.first_delay, Duration::from_millis),
            max_delay: r.max_delay_ms.map_or(d.max_delay, Duration::from_millis),
            backoff_factor: r.backoff_factor.unwrap_or(d.backoff_factor),
            jitter: r.jitter.unwrap_or(d.jitter),
        };
        if policy.backoff_factor < 1.0 {
            return Err(ConfigError::Conversion {
                path: path.display().to_string(),
                message: format!(
                    "retry backoff_factor must be >= 1.0, got {}",
                    policy.backoff_factor
                ),
            });
        }
        policy
    };

    Ok(CoreConfig {
        storage,
        retention,
        retry,
        stabilisation_poll_interval_ms: raw
            .stabilisation_poll_interval_ms
            .unwrap_or(defaults.stabilisation_poll_interval_ms),
        resource_lock_timeout_ms: raw
            .resource_lock_timeout_ms
            .unwrap_or(defaults.resource_lock_timeout_ms),
        resource_lock_check_interval_ms: raw
            .resource_lock_check_interval_ms
            .unwrap_or(defaults.resource_lock_check_interval_ms),
        drift_check_enabled: raw
            .drift_check_enabled
            .unwrap_or(defaults.drift_check_enabled),
    })
}

fn convert_storage(raw: RawStorage, path: &Path) -> Result<StorageBackend, ConfigError> {
    match raw.backend.as_str() {
        "memfile" => Ok(StorageBackend::Memfile {
            state_dir: raw.state_dir.unwrap_or_else(|| PathBuf::from("state")),
            max_guide_file_size: raw.max_guide_file_size.unwrap_or(1024 * 1024),
            max_event_partition_size: raw
                .max_event_partition_size
                .unwrap_or(10 * 1024 * 1024),
        }),
        "postgres" => {
            let url = raw.url.ok_or_else(|| ConfigError::Conversion {
                path: path.display().to_string(),
                message: "postgres backend requires a 'url'".to_string(),
            })?;
            Ok(StorageBackend::Postgres { url })
        }
        other => Err(ConfigError::Conversion {
            path: path.display().to_string(),
            message: format!("unknown storage backend '{}'", other),
        }),
    }
}
