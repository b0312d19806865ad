//! Configuration loader and validator for the list synchronizer.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::{FieldDef, FieldKind};

static FIELD_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]{0,9}$").unwrap());

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub remote: Remote,
    #[serde(default)]
    pub sync: SyncSettings,
    pub fields: Vec<FieldDef>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

impl App {
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/mailsync.db", self.data_dir))
    }
}

/// Remote service settings. Credentials live on each mailing list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            base_url: None,
            page_size: default_page_size(),
        }
    }
}

/// Batch polling and run behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    pub poll_timeout_seconds: u64,
    #[serde(default)]
    pub raise_errors: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_poll_attempts: 10,
            poll_timeout_seconds: 600,
            raise_errors: false,
            concurrency: default_concurrency(),
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_seconds)
    }
}

fn default_page_size() -> usize {
    50
}

fn default_concurrency() -> usize {
    4
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(invalid("app.data_dir must be non-empty"));
    }

    if let Some(url) = &cfg.remote.base_url {
        if reqwest::Url::parse(url).is_err() {
            return Err(invalid(format!("remote.base_url is not a valid URL: {url}")));
        }
    }
    if !(1..=1000).contains(&cfg.remote.page_size) {
        return Err(invalid("remote.page_size must be between 1 and 1000"));
    }

    if cfg.sync.poll_interval_ms == 0 {
        return Err(invalid("sync.poll_interval_ms must be > 0"));
    }
    if cfg.sync.max_poll_attempts == 0 {
        return Err(invalid("sync.max_poll_attempts must be > 0"));
    }
    if cfg.sync.poll_timeout_seconds == 0 {
        return Err(invalid("sync.poll_timeout_seconds must be > 0"));
    }
    if cfg.sync.concurrency == 0 {
        return Err(invalid("sync.concurrency must be > 0"));
    }

    let mut seen = HashSet::new();
    for field in &cfg.fields {
        if !FIELD_TAG.is_match(&field.tag) {
            return Err(invalid(format!(
                "fields: tag '{}' must be 1-10 uppercase letters, digits or underscores",
                field.tag
            )));
        }
        if !seen.insert(field.tag.as_str()) {
            return Err(invalid(format!("fields: duplicate tag '{}'", field.tag)));
        }
        if field.name.trim().is_empty() {
            return Err(invalid(format!("fields: '{}' needs a name", field.tag)));
        }
        if field.kind == FieldKind::Dropdown && field.choices.is_empty() {
            return Err(invalid(format!(
                "fields: dropdown '{}' needs choices",
                field.tag
            )));
        }
    }

    Ok(())
}

/// Returns a documented example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

remote:
  # Derived from each list's API key datacenter when unset.
  base_url: null
  page_size: 50

sync:
  poll_interval_ms: 1000
  max_poll_attempts: 10
  poll_timeout_seconds: 600
  raise_errors: false
  concurrency: 4

fields:
  - tag: FNAME
    name: First Name
    kind: text
    source: first_name
  - tag: LNAME
    name: Last Name
    kind: text
    source: last_name
  - tag: GENDER
    name: Gender
    kind: dropdown
    source: gender
    choices: ["m", "w", ""]
"#
}
