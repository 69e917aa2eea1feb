use std::io::Write;
use std::time::Duration;

use bluelink_config::{load_config, CoreConfig, StorageBackend};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yml")
        .tempfile()
        .expect("tempfile");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn minimal_file_takes_defaults() {
    let file = write_config("{}\n");
    let config = load_config(file.path()).expect("should load without error");

    let defaults = CoreConfig::default();
    assert_eq!(config.retention, defaults.retention);
    assert_eq!(config.retry, defaults.retry);
    assert_eq!(config.stabilisation_poll_interval_ms, 5_000);
    assert_eq!(config.resource_lock_timeout_ms, 180_000);
    assert_eq!(config.resource_lock_check_interval_ms, 100);
    assert!(!config.drift_check_enabled);
}

#[test]
fn memfile_backend_with_overrides() {
    let file = write_config(
        r#"
storage:
  backend: memfile
  state_dir: /var/lib/bluelink/state
  max_guide_file_size: 2048
retention:
  events_days: 3
retry:
  max_retries: 2
  first_delay_ms: 50
drift_check_enabled: true
"#,
    );
    let config = load_config(file.path()).expect("should load without error");

    match &config.storage {
        StorageBackend::Memfile {
            state_dir,
            max_guide_file_size,
            max_event_partition_size,
        } => {
            assert_eq!(state_dir.to_str(), Some("/var/lib/bluelink/state"));
            assert_eq!(*max_guide_file_size, 2048);
            // untouched fields keep their defaults
            assert_eq!(*max_event_partition_size, 10 * 1024 * 1024);
        }
        other => panic!("expected memfile backend, got {other:?}"),
    }
    assert_eq!(config.retention.events, Duration::from_secs(3 * 24 * 60 * 60));
    assert_eq!(config.retry.max_retries, 2);
    assert_eq!(config.retry.first_delay, Duration::from_millis(50));
    assert!(config.drift_check_enabled);
}

#[test]
fn postgres_backend_requires_url() {
    let file = write_config("storage:\n  backend: postgres\n");
    assert!(load_config(file.path()).is_err());

    let file = write_config(
        "storage:\n  backend: postgres\n  url: postgres://bluelink@localhost/bluelink\n",
    );
    let config = load_config(file.path()).expect("should load without error");
    assert!(matches!(config.storage, StorageBackend::Postgres { .. }));
}

#[test]
fn unknown_backend_is_rejected() {
    let file = write_config("storage:\n  backend: dynamo\n");
    assert!(load_config(file.path()).is_err());
}

#[test]
fn missing_file_returns_error() {
    let path = std::path::Path::new("/nonexistent/path/does/not/exist.yml");
    assert!(load_config(path).is_err());
}

#[test]
fn backoff_factor_below_one_is_rejected() {
    let file = write_config("retry:\n  backoff_factor: 0.5\n");
    assert!(load_config(file.path()).is_err());
}
