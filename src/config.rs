//! Configuration for EventSense, read from `eventsense.toml`.
//!
//! Values are layered file → environment → CLI:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! db_path = ".eventsense/runs.db"
//! cors_origins = ["http://localhost:3000", "http://127.0.0.1:3000"]
//!
//! [pipeline]
//! step_timeout_secs = 30
//! max_transient_retries = 2
//! retry_backoff_ms = 250
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```
//!
//! Environment overrides: `EVENTSENSE_PORT`, `EVENTSENSE_DB_PATH`,
//! `EVENTSENSE_LOG` (an `EnvFilter` directive).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "eventsense.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".eventsense/runs.db")
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ]
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// Step execution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Per-attempt timeout for a single step
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Retries granted to a step after a transient failure
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    /// Base backoff, doubled on every retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_step_timeout_secs() -> u64 {
    30
}

fn default_max_transient_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    250
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            max_transient_retries: default_max_transient_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl PipelineSection {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// The complete `eventsense.toml` structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse eventsense.toml")
    }

    /// Load from `path` if given, otherwise from `eventsense.toml` in the
    /// working directory when present, otherwise defaults. Environment
    /// overrides are applied on top.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` so tests can inject values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("EVENTSENSE_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid EVENTSENSE_PORT '{}'", port))?;
        }
        if let Some(db_path) = lookup("EVENTSENSE_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Some(level) = lookup("EVENTSENSE_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize eventsense.toml")
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.pipeline.step_timeout_secs == 0 {
            warnings.push("pipeline.step_timeout_secs is 0; every step will time out".to_string());
        }
        if self.pipeline.max_transient_retries > 2 {
            warnings.push(format!(
                "pipeline.max_transient_retries = {} exceeds the recommended bound of 2",
                self.pipeline.max_transient_retries
            ));
        }
        if self.server.cors_origins.is_empty() {
            warnings.push("server.cors_origins is empty; browser clients will be rejected".to_string());
        }
        if self.logging.level.trim().is_empty() {
            warnings.push("logging.level is empty; falling back to 'info'".to_string());
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.db_path, PathBuf::from(".eventsense/runs.db"));
        assert_eq!(config.pipeline.max_transient_retries, 2);
        assert_eq!(config.pipeline.step_timeout(), Duration::from_secs(30));
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
            [pipeline]
            step_timeout_secs = 5

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.step_timeout_secs, 5);
        assert_eq!(config.pipeline.retry_backoff_ms, 250);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_parse_rejects_unknown_log_format() {
        let result = Config::parse("[logging]\nformat = \"xml\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("eventsense.toml");
        std::fs::write(&path, "[server]\nport = 9100\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempdir().unwrap();
        let result = Config::load(&dir.path().join("missing.toml"));
        assert!(result.unwrap_err().to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config::parse("[server]\nport = 9100\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("EVENTSENSE_PORT", "9200"),
            ("EVENTSENSE_DB_PATH", "/tmp/runs.db"),
            ("EVENTSENSE_LOG", "eventsense=debug"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/runs.db"));
        assert_eq!(config.logging.level, "eventsense=debug");
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let mut config = Config::default();
        let result = config.apply_env(|key| (key == "EVENTSENSE_PORT").then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_warns_on_excess_retries() {
        let mut config = Config::default();
        config.pipeline.max_transient_retries = 5;
        config.pipeline.step_timeout_secs = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("max_transient_retries")));
    }

    #[test]
    fn test_toml_roundtrip_preserves_values() {
        let mut config = Config::default();
        config.server.port = 8123;
        let text = config.to_toml().unwrap();
        assert_eq!(Config::parse(&text).unwrap(), config);
    }
}
