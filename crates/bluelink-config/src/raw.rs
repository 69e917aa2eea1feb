use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw YAML representation of the core configuration file.
///
/// Every field is optional; absent fields take the documented defaults so a
/// minimal deployment only has to name its storage backend.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawCoreConfig {
    pub storage: Option<RawStorage>,
    pub retention: Option<RawRetention>,
    pub retry: Option<RawRetryPolicy>,
    /// Stabilisation polling interval in milliseconds.
    pub stabilisation_poll_interval_ms: Option<u64>,
    /// Resource lock liveness timeout in milliseconds.
    pub resource_lock_timeout_ms: Option<u64>,
    /// Resource lock acquisition check interval in milliseconds.
    pub resource_lock_check_interval_ms: Option<u64>,
    /// Run a drift check during change staging.
    pub drift_check_enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawStorage {
    /// "memfile" or "postgres".
    pub backend: String,
    /// Memfile: directory holding chunk, index and event partition files.
    pub state_dir: Option<PathBuf>,
    /// Memfile: soft cap on entity chunk files, in bytes.
    pub max_guide_file_size: Option<u64>,
    /// Memfile: hard cap on event partition files, in bytes.
    pub max_event_partition_size: Option<u64>,
    /// Postgres: libpq-style connection string.
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawRetention {
    pub events_days: Option<u32>,
    pub validations_days: Option<u32>,
    pub changesets_days: Option<u32>,
    pub reconciliation_results_days: Option<u32>,
    /// Recent-window for `subscribe-from-recent`, in seconds.
    pub recent_event_window_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawRetryPolicy {
    pub max_retries: Option<u32>,
    pub first_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub jitter: Option<bool>,
}
