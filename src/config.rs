use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{JobManagerConfig, INACTIVE_TIMEOUT, STREAMING_THRESHOLD, SWEEP_INTERVAL};
use crate::{DatasourceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = DatasourceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" | "" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(DatasourceError::InvalidRequest(format!(
                "Unknown LOG_FORMAT '{}', expected 'compact' or 'json'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Filter directive, `RUST_LOG` syntax.
    pub filter: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub api_timeout: Duration,
    pub jobs: JobManagerConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            api_timeout: Duration::from_secs(30),
            jobs: JobManagerConfig::default(),
            log: LogConfig {
                filter: "info".to_string(),
                format: LogFormat::Compact,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            parse_or(&lookup, key, default.as_secs()).map(Duration::from_secs)
        };

        Ok(Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: parse_or(&lookup, "PORT", defaults.port)?,
            api_timeout: secs("API_TIMEOUT_SECS", defaults.api_timeout)?,
            jobs: JobManagerConfig {
                sweep_interval: secs("JOB_SWEEP_INTERVAL_SECS", SWEEP_INTERVAL)?,
                inactive_timeout: secs("JOB_INACTIVE_TIMEOUT_SECS", INACTIVE_TIMEOUT)?,
                streaming_threshold: secs("JOB_STREAMING_THRESHOLD_SECS", STREAMING_THRESHOLD)?,
            },
            log: LogConfig {
                filter: lookup("RUST_LOG").unwrap_or(defaults.log.filter),
                format: match lookup("LOG_FORMAT") {
                    Some(format) => format.parse()?,
                    None => defaults.log.format,
                },
            },
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            DatasourceError::InvalidRequest(format!("Invalid value '{}' for {}", raw, key))
        }),
        None => Ok(default),
    }
}
