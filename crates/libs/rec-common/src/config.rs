//! Agent configuration.
//!
//! Configuration is layered, lowest precedence first:
//!
//! 1. Hardcoded defaults
//! 2. The config file passed on the command line (`--config`)
//! 3. `REC_*` environment variables
//!
//! The file format is whatever the `config` crate can detect from the
//! extension (TOML and YAML are the two used in practice).

use config::{Config, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub rootly: RootlyConfig,
    pub poller: PollerConfig,
    pub pool: PoolConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Control-plane endpoint and credentials.
#[derive(Debug, Deserialize, Clone)]
pub struct RootlyConfig {
    pub api_url: String,
    pub api_path: String,
    pub api_key: String,
}

impl RootlyConfig {
    /// Full base URL for delivery and action endpoints.
    pub fn base_url(&self) -> String {
        format!(
            "{}{}",
            self.api_url.trim_end_matches('/'),
            self.api_path
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollerConfig {
    pub polling_wait_interval_ms: u64,
    pub visibility_timeout_sec: u64,
    pub max_number_of_messages: u32,
    pub retry_on_error: bool,
    pub retry_backoff: BackoffKind,
    pub max_retries: u32,
}

/// Delay strategy between consecutive failed polls.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_size: usize,
    pub keepalive_ms: u64,
    pub monitoring_period_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    /// Roots a script is allowed to live under. Empty means unrestricted.
    #[serde(default)]
    pub allowed_script_paths: Vec<PathBuf>,
    /// Environment injected into every script child.
    #[serde(default)]
    pub global_env: HashMap<String, String>,
    /// Hard ceiling on any script execution, in seconds.
    pub script_timeout: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    /// `plain` or `json`.
    pub format_type: String,
    /// When set, logs also go to a daily-rolled file at this path.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
    /// Constant labels attached to every exported metric.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rootly: RootlyConfig {
                api_url: String::new(),
                api_path: "/v1".to_string(),
                api_key: String::new(),
            },
            poller: PollerConfig {
                polling_wait_interval_ms: 1_000,
                visibility_timeout_sec: 300,
                max_number_of_messages: 10,
                retry_on_error: true,
                retry_backoff: BackoffKind::Exponential,
                max_retries: 5,
            },
            pool: PoolConfig {
                min_workers: 2,
                max_workers: 10,
                queue_size: 100,
                keepalive_ms: 30_000,
                monitoring_period_ms: 1_000,
            },
            security: SecurityConfig {
                allowed_script_paths: Vec::new(),
                global_env: HashMap::new(),
                script_timeout: 300,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format_type: "plain".to_string(),
                file: None,
            },
            metrics: MetricsConfig {
                enabled: false,
                port: 9090,
                path: "/metrics".to_string(),
                labels: HashMap::new(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file plus `REC_*` env overrides.
    ///
    /// Priority order (highest to lowest):
    /// 1. `REC_API_URL`, `REC_API_PATH`, `REC_API_KEY`, `REC_LOG_LEVEL`,
    ///    `REC_LOG_FORMAT_TYPE`
    /// 2. The config file, when one is given
    /// 3. Hardcoded defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("rootly.api_url", "")?
            .set_default("rootly.api_path", "/v1")?
            .set_default("rootly.api_key", "")?
            .set_default("poller.polling_wait_interval_ms", 1_000)?
            .set_default("poller.visibility_timeout_sec", 300)?
            .set_default("poller.max_number_of_messages", 10)?
            .set_default("poller.retry_on_error", true)?
            .set_default("poller.retry_backoff", "exponential")?
            .set_default("poller.max_retries", 5)?
            .set_default("pool.min_workers", 2)?
            .set_default("pool.max_workers", 10)?
            .set_default("pool.queue_size", 100)?
            .set_default("pool.keepalive_ms", 30_000)?
            .set_default("pool.monitoring_period_ms", 1_000)?
            .set_default("security.script_timeout", 300)?
            .set_default("logging.level", "info")?
            .set_default("logging.format_type", "plain")?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.port", 9090)?
            .set_default("metrics.path", "/metrics")?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        // Env overrides, highest precedence
        for (var, key) in [
            ("REC_API_URL", "rootly.api_url"),
            ("REC_API_PATH", "rootly.api_path"),
            ("REC_API_KEY", "rootly.api_key"),
            ("REC_LOG_LEVEL", "logging.level"),
            ("REC_LOG_FORMAT_TYPE", "logging.format_type"),
        ] {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(key, value)?;
            }
        }

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Startup sanity checks beyond what deserialization enforces.
    fn validate(&self) -> Result<()> {
        if self.pool.min_workers == 0 {
            return Err(Error::InvalidConfig(
                "pool.min_workers must be at least 1".into(),
            ));
        }
        if self.pool.max_workers < self.pool.min_workers {
            return Err(Error::InvalidConfig(format!(
                "pool.max_workers ({}) is below pool.min_workers ({})",
                self.pool.max_workers, self.pool.min_workers
            )));
        }
        if self.pool.queue_size == 0 {
            return Err(Error::InvalidConfig("pool.queue_size must be > 0".into()));
        }
        if self.security.script_timeout == 0 {
            return Err(Error::InvalidConfig(
                "security.script_timeout must be > 0".into(),
            ));
        }
        Ok(())
    }
}
