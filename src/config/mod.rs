//! Typed configuration.
//!
//! Loads once at startup: built-in defaults, then an optional TOML file, then
//! environment variables. Fails fast on anything unparsable or out of range.
//! The API key is wrapped in `secrecy::SecretString` to keep it out of logs.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::work::{DEFAULT_MODEL, DEFAULT_PROMPT, PromptConfig};
use crate::retry::RetryPolicy;

/// Slowest accepted refill rate: one delivery per ~17 minutes.
pub const MIN_RATE_PER_SEC: f64 = 0.001;

#[derive(Debug)]
pub struct Config {
    pub db_path: PathBuf,
    pub artifact_dir: PathBuf,
    pub results_dir: Option<PathBuf>,
    pub min_interval_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub rate_capacity: u32,
    pub rate_per_sec: f64,
    pub grace_period_secs: u64,
    pub sweep_interval_secs: u64,
    pub workers: usize,
    pub delivery_timeout_secs: u64,
    pub capture_timeout_secs: u64,
    pub capture_command: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub prompt: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/snapq.db"),
            artifact_dir: PathBuf::from("data/ss"),
            results_dir: None,
            min_interval_ms: 500,
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            rate_capacity: 1,
            rate_per_sec: 1.0,
            grace_period_secs: 3_600,
            sweep_interval_secs: 300,
            workers: 1,
            delivery_timeout_secs: 60,
            capture_timeout_secs: 10,
            capture_command: None,
            endpoint: None,
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// On-disk shape of the TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    artifact_dir: Option<PathBuf>,
    results_dir: Option<PathBuf>,
    min_interval_ms: Option<u64>,
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    rate_capacity: Option<u32>,
    rate_per_sec: Option<f64>,
    grace_period_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    workers: Option<usize>,
    delivery_timeout_secs: Option<u64>,
    capture_timeout_secs: Option<u64>,
    capture_command: Option<PathBuf>,
    endpoint: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    prompt: Option<String>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from an optional TOML file and the process environment.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let text = match path {
            Some(p) => Some(std::fs::read_to_string(p).map_err(|e| {
                Error::Config(format!("cannot read config file {}: {e}", p.display()))
            })?),
            None => None,
        };
        Self::from_sources(text.as_deref(), |key| std::env::var(key).ok())
    }

    /// Layer `toml` (if any) and then `env` over the defaults.
    pub fn from_sources(
        toml: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = Self::default();
        if let Some(text) = toml {
            let file: FileConfig = toml::from_str(text)
                .map_err(|e| Error::Config(format!("invalid config file: {e}")))?;
            config.apply_file(file);
        }
        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = file.$field { self.$field = v; })*
            };
        }
        take!(
            db_path,
            artifact_dir,
            min_interval_ms,
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            rate_capacity,
            rate_per_sec,
            grace_period_secs,
            sweep_interval_secs,
            workers,
            delivery_timeout_secs,
            capture_timeout_secs,
            model,
            prompt,
            log_level,
        );
        self.results_dir = file.results_dir.or(self.results_dir.take());
        self.capture_command = file.capture_command.or(self.capture_command.take());
        self.endpoint = file.endpoint.or(self.endpoint.take());
        self.otel_endpoint = file.otel_endpoint.or(self.otel_endpoint.take());
        if let Some(key) = file.api_key {
            self.api_key = Some(SecretString::from(key));
        }
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("SNAPQ_DB_PATH") {
            self.db_path = v.into();
        }
        if let Some(v) = var("SNAPQ_ARTIFACT_DIR") {
            self.artifact_dir = v.into();
        }
        if let Some(v) = var("SNAPQ_RESULTS_DIR") {
            self.results_dir = Some(v.into());
        }
        parse_into(&var, "SNAPQ_MIN_INTERVAL_MS", &mut self.min_interval_ms)?;
        parse_into(&var, "SNAPQ_MAX_ATTEMPTS", &mut self.max_attempts)?;
        parse_into(&var, "SNAPQ_BASE_DELAY_MS", &mut self.base_delay_ms)?;
        parse_into(&var, "SNAPQ_MAX_DELAY_MS", &mut self.max_delay_ms)?;
        parse_into(&var, "SNAPQ_RATE_CAPACITY", &mut self.rate_capacity)?;
        parse_into(&var, "SNAPQ_RATE_PER_SEC", &mut self.rate_per_sec)?;
        parse_into(&var, "SNAPQ_GRACE_PERIOD_SECS", &mut self.grace_period_secs)?;
        parse_into(&var, "SNAPQ_SWEEP_INTERVAL_SECS", &mut self.sweep_interval_secs)?;
        parse_into(&var, "SNAPQ_WORKERS", &mut self.workers)?;
        parse_into(
            &var,
            "SNAPQ_DELIVERY_TIMEOUT_SECS",
            &mut self.delivery_timeout_secs,
        )?;
        parse_into(
            &var,
            "SNAPQ_CAPTURE_TIMEOUT_SECS",
            &mut self.capture_timeout_secs,
        )?;
        if let Some(v) = var("SNAPQ_CAPTURE_COMMAND") {
            self.capture_command = Some(v.into());
        }
        if let Some(v) = var("SNAPQ_ENDPOINT") {
            self.endpoint = Some(v);
        }
        if let Some(v) = var("SNAPQ_API_KEY") {
            self.api_key = Some(SecretString::from(v));
        }
        if let Some(v) = var("SNAPQ_MODEL") {
            self.model = v;
        }
        if let Some(v) = var("SNAPQ_PROMPT") {
            self.prompt = v;
        }
        if let Some(v) = var("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(v);
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Config(msg.to_string()));
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.rate_capacity == 0 {
            return invalid("rate_capacity must be at least 1");
        }
        if !(self.rate_per_sec.is_finite() && self.rate_per_sec >= MIN_RATE_PER_SEC) {
            return invalid("rate_per_sec must be a number of at least 0.001");
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.delivery_timeout_secs == 0 {
            return invalid("delivery_timeout_secs must be at least 1");
        }
        if self.capture_timeout_secs == 0 {
            return invalid("capture_timeout_secs must be at least 1");
        }
        if self.sweep_interval_secs == 0 {
            return invalid("sweep_interval_secs must be at least 1");
        }
        if self.max_delay_ms < self.base_delay_ms {
            return invalid("max_delay_ms must not be less than base_delay_ms");
        }
        Ok(())
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn prompt_config(&self) -> PromptConfig {
        PromptConfig {
            model: self.model.clone(),
            prompt: self.prompt.clone(),
        }
    }
}

fn parse_into<T>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = var(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}={raw:?} is invalid: {e}")))?;
    }
    Ok(())
}
