use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::ExposeSecret;
use snapq::config::Config;
use snapq::engine::PipelineConfig;
use snapq::error::Error;
use snapq::model::work::{DEFAULT_MODEL, PromptConfig};
use snapq::retry::RetryPolicy;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_apply_without_sources() {
    let config = Config::from_sources(None, env(&[])).unwrap();
    assert_eq!(config.db_path, PathBuf::from("data/snapq.db"));
    assert_eq!(config.min_interval(), Duration::from_millis(500));
    assert_eq!(config.retry_policy(), RetryPolicy::default());
    assert_eq!(config.workers, 1);
    assert_eq!(config.capture_timeout(), Duration::from_secs(10));
    assert_eq!(config.prompt_config(), PromptConfig::default());
    assert!(config.api_key.is_none());
}

#[test]
fn env_overrides_file() {
    let toml = r#"
        max_attempts = 3
        rate_per_sec = 0.5
        endpoint = "http://file.example/v1"
        results_dir = "out"
        capture_timeout_secs = 4
    "#;
    let config = Config::from_sources(
        Some(toml),
        env(&[
            ("SNAPQ_MAX_ATTEMPTS", "7"),
            ("SNAPQ_API_KEY", "sk-test"),
            ("SNAPQ_WORKERS", "2"),
        ]),
    )
    .unwrap();
    assert_eq!(config.max_attempts, 7);
    assert_eq!(config.rate_per_sec, 0.5);
    assert_eq!(config.endpoint.as_deref(), Some("http://file.example/v1"));
    assert_eq!(config.results_dir, Some(PathBuf::from("out")));
    assert_eq!(config.capture_timeout(), Duration::from_secs(4));
    assert_eq!(config.workers, 2);
    assert_eq!(
        config.api_key.as_ref().map(|k| k.expose_secret()),
        Some("sk-test")
    );
}

#[test]
fn api_key_is_redacted_in_debug_output() {
    let config = Config::from_sources(None, env(&[("SNAPQ_API_KEY", "sk-secret")])).unwrap();
    assert!(!format!("{config:?}").contains("sk-secret"));
}

#[test]
fn unparsable_numbers_are_rejected() {
    let err = Config::from_sources(None, env(&[("SNAPQ_MAX_ATTEMPTS", "five")])).unwrap_err();
    assert!(matches!(err, Error::Config(msg) if msg.contains("SNAPQ_MAX_ATTEMPTS")));
}

#[test]
fn out_of_range_values_are_rejected() {
    for (key, value) in [
        ("SNAPQ_MAX_ATTEMPTS", "0"),
        ("SNAPQ_RATE_CAPACITY", "0"),
        ("SNAPQ_RATE_PER_SEC", "0"),
        ("SNAPQ_RATE_PER_SEC", "-1"),
        ("SNAPQ_RATE_PER_SEC", "1e-25"),
        ("SNAPQ_WORKERS", "0"),
        ("SNAPQ_CAPTURE_TIMEOUT_SECS", "0"),
    ] {
        let result = Config::from_sources(None, env(&[(key, value)]));
        assert!(
            matches!(result, Err(Error::Config(_))),
            "{key}={value} accepted"
        );
    }
}

#[test]
fn unknown_file_keys_are_rejected() {
    let result = Config::from_sources(Some("max_attemps = 3"), env(&[]));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn blank_env_values_are_ignored() {
    let config = Config::from_sources(None, env(&[("SNAPQ_MODEL", "  ")])).unwrap();
    assert_eq!(config.model, DEFAULT_MODEL);
}

#[test]
fn config_loads_file_then_env() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapq.toml");
    std::fs::write(
        &path,
        r#"
        db_path = "/var/lib/snapq/snapq.db"
        workers = 2
        rate_capacity = 3
        model = "file-model"
        "#,
    )
    .unwrap();

    unsafe {
        std::env::set_var("SNAPQ_MODEL", "env-model");
        std::env::set_var("SNAPQ_BASE_DELAY_MS", "250");
    }

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.db_path, PathBuf::from("/var/lib/snapq/snapq.db"));
    assert_eq!(config.workers, 2);
    assert_eq!(config.model, "env-model");

    let pipeline = PipelineConfig::from(&config);
    assert_eq!(pipeline.workers, 2);
    assert_eq!(pipeline.rate_capacity, 3);
    assert_eq!(pipeline.retry.base_delay, Duration::from_millis(250));
    assert_eq!(pipeline.prompt.model, "env-model");

    unsafe {
        std::env::remove_var("SNAPQ_MODEL");
        std::env::remove_var("SNAPQ_BASE_DELAY_MS");
    }
}

#[test]
fn config_load_fails_for_missing_file() {
    let result = Config::load(Some(std::path::Path::new("/nonexistent/snapq.toml")));
    assert!(result.is_err());
}

#[test]
fn config_load_fails_for_malformed_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapq.toml");
    std::fs::write(&path, "workers = \"many\"").unwrap();

    assert!(Config::load(Some(&path)).is_err());
}
