//! Configuration file loading

use recon_engine::{Orchestrator, ReconConfig, ReconError};
use std::io::Write;
use std::time::Duration;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_config_file() {
    let file = write_config(
        r#"
        targets = "192.168.10.0/29, scanme.example"
        probes = ["reachability", "resolve"]
        ports = [22, 443]
        concurrency = 16
        timeout_ms = 800
        retries = 4
        retry_interval_ms = 250
        rate_limit = 50
        rate_limit_window_ms = 1000
        stop_grace_ms = 1500
        log_level = "debug"

        [[rate_limits]]
        key = "resolve"
        capacity = 5
        window = 1000
        "#,
    );

    let config = ReconConfig::from_toml_file(file.path()).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.probes, vec!["reachability", "resolve"]);
    assert_eq!(config.ports, vec![22, 443]);
    assert_eq!(config.stop_grace(), Duration::from_millis(1500));

    let policy = config.retry_policy();
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.interval, Duration::from_millis(250));
    assert_eq!(policy.per_attempt_timeout, Duration::from_millis(800));

    assert_eq!(config.rate_limits[0].capacity, 5);
    assert_eq!(config.rate_limits[0].window, Duration::from_secs(1));
}

#[tokio::test]
async fn test_config_drives_rate_limiter() {
    let file = write_config(
        r#"
        rate_limit = 2
        rate_limit_window_ms = 60000

        [[rate_limits]]
        key = "resolve"
        unlimited = true
        "#,
    );
    let config = ReconConfig::from_toml_file(file.path()).unwrap();
    let orchestrator = Orchestrator::from_config(&config).unwrap();
    let limiter = orchestrator.rate_limiter();

    assert!(limiter.has_rule("resolve").await);
    assert_eq!(limiter.available("resolve").await, None);
    assert_eq!(limiter.available("reachability").await, Some(2));
}

#[test]
fn test_missing_file_is_config_error() {
    let err = ReconConfig::from_toml_file("/definitely/not/here.toml").unwrap_err();
    assert!(matches!(err, ReconError::Config(_)));
}

#[test]
fn test_invalid_values_are_rejected() {
    let file = write_config("concurrency = 0\n");
    let config = ReconConfig::from_toml_file(file.path()).unwrap();
    assert!(Orchestrator::from_config(&config).is_err());

    let file = write_config("[[rate_limits]]\nkey = \"http\"\ncapacity = 0\nwindow = 1000\n");
    let config = ReconConfig::from_toml_file(file.path()).unwrap();
    assert!(matches!(config.validate(), Err(ReconError::Config(_))));
}
