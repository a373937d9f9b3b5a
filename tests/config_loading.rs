use std::io::Write;

use weft_core::config::WeftConfig;
use weft_core::error::WeftError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_concurrent_workflows = 4
node_timeout_ms = 5000
workflow_timeout_ms = 0
use_coordinator = true

[engine.retry]
max_retries = 2
initial_backoff_ms = 10
max_backoff_ms = 100

[coordinator]
mailbox_size = 8
max_concurrent_agents = 2

[coordinator.supervision]
max_restarts = 5
within_secs = 30

[events]
capacity = 64

[session]
history_limit = 20
num_history_runs = 5
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = WeftConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrent_workflows, 4);
    assert_eq!(config.engine.node_timeout().as_millis(), 5000);
    assert!(config.engine.workflow_timeout().is_none());
    assert!(config.engine.use_coordinator);
    assert_eq!(config.engine.retry.max_retries, 2);
    assert_eq!(config.coordinator.mailbox_size, 8);
    assert_eq!(config.coordinator.supervision.max_restarts, 5);
    assert_eq!(config.coordinator.supervision.window().as_secs(), 30);
    assert_eq!(config.events.capacity, 64);
    assert_eq!(config.session.history_limit, 20);
    assert_eq!(config.session.num_history_runs, 5);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEFT_TEST_MAILBOX", "42");

    let toml_content = r#"
[coordinator]
mailbox_size = ${WEFT_TEST_MAILBOX}
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = WeftConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.coordinator.mailbox_size, 42);

    std::env::remove_var("WEFT_TEST_MAILBOX");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[engine]
use_coordinator = false
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = WeftConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrent_workflows, 100);
    assert_eq!(config.engine.node_timeout_ms, 300_000);
    assert_eq!(config.engine.retry.max_retries, 0);
    assert_eq!(config.coordinator.mailbox_size, 100);
    assert_eq!(config.coordinator.supervision.max_restarts, 3);
    assert_eq!(config.coordinator.supervision.within_secs, 60);
    assert_eq!(config.events.capacity, 256);
    assert_eq!(config.session.history_limit, 10);
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("absent.toml");

    let err = WeftConfig::load(&path).unwrap_err();
    assert!(matches!(err, WeftError::ConfigNotFound(_)));

    let config = WeftConfig::load_or_default(&path).expect("defaults");
    assert!(!config.engine.use_coordinator);
}

#[test]
fn test_malformed_config_is_rejected() {
    let tmp = weft_test_utils::fixtures::temp_config("[engine\nmax_concurrent_workflows = ");
    let err = WeftConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));
}
