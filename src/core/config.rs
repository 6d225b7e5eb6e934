//! Configuration management for agentrelay
//!
//! Supports environment variables, config files, and runtime overrides.
//!
//! Config file location: ~/.config/agentrelay/config.toml

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::error::{RelayError, Result};
use crate::core::types::DispatchMode;

/// Main configuration for agentrelay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Completion service connection
    #[serde(default)]
    pub service: ServiceConfig,
    /// Run polling behaviour
    #[serde(default)]
    pub run: RunConfig,
    /// Tool-call dispatch
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Durable state
    #[serde(default)]
    pub storage: StorageConfig,
    /// User function registrars
    #[serde(default)]
    pub functions: FunctionsConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How requests are authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceProvider {
    /// `Authorization: Bearer` plus the assistants beta header
    #[default]
    OpenAi,
    /// `api-key` header plus `api-version` query parameter
    Azure,
}

/// Completion service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub provider: ServiceProvider,
    /// Base URL, e.g. https://api.openai.com/v1
    pub base_url: String,
    /// Never written back to the config file
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,
    /// Azure only
    pub api_version: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

/// What to do when a run is requested on a thread that already has one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Fail immediately with `ThreadBusy`
    #[default]
    Reject,
    /// Queue behind the active run, up to `run_timeout_secs`
    Wait,
}

/// Run polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// First delay between polls
    pub poll_interval_ms: u64,
    /// Upper bound for the backed-off poll delay
    pub max_poll_interval_ms: u64,
    /// Multiplier applied after each non-terminal poll
    pub backoff_factor: f64,
    /// Wall-clock budget before a pending run is treated as expired
    pub run_timeout_secs: u64,
    /// Consecutive transient failures tolerated per poll or submit
    pub max_poll_retries: u32,
    /// Base delay before retrying a transient failure
    pub retry_backoff_ms: u64,
    pub busy_policy: BusyPolicy,
    /// Cancel remotely when a run expires locally or polling gives up
    pub cancel_abandoned_runs: bool,
    /// Page size when reading messages back
    pub message_page_size: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_poll_interval_ms: 5_000,
            backoff_factor: 1.5,
            run_timeout_secs: env::var("AGENTRELAY_RUN_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            max_poll_retries: 3,
            retry_backoff_ms: 1_000,
            busy_policy: BusyPolicy::default(),
            cancel_abandoned_runs: true,
            message_page_size: 20,
        }
    }
}

impl RunConfig {
    /// Largest accepted `backoff_factor`
    pub const MAX_BACKOFF_FACTOR: f64 = 10.0;
    /// Largest accepted `run_timeout_secs` (one week)
    pub const MAX_RUN_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Tool-call dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    /// Size of the handler worker pool
    pub max_workers: usize,
    /// Per-call budget in seconds
    pub call_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            max_workers: env::var("AGENTRELAY_MAX_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            call_timeout_secs: 120,
        }
    }
}

impl DispatchConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Durable state configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for thread and relay files; `None` keeps state in memory
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn threads_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("threads.json"))
    }

    pub fn relay_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("relay.json"))
    }
}

/// Registrar selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionsConfig {
    /// Names of registrars to load from the catalog, in order
    pub registrars: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "agentrelay=info".to_string(),
            json: env::var("AGENTRELAY_LOG_JSON")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            provider: match env::var("AGENTRELAY_PROVIDER").as_deref() {
                Ok("azure") => ServiceProvider::Azure,
                _ => ServiceProvider::OpenAi,
            },
            base_url: env::var("AGENTRELAY_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: env::var("AGENTRELAY_API_KEY")
                .or_else(|_| env::var("OPENAI_API_KEY"))
                .ok(),
            api_version: env::var("AGENTRELAY_API_VERSION").ok(),
            timeout_secs: 60,
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agentrelay")
    }

    /// Get the config file path
    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from file, environment, and defaults
    /// Priority: explicit overrides > config file > env-aware defaults
    pub fn load() -> Self {
        // Try to load .env file if it exists
        let _ = dotenvy::dotenv();

        match Self::load_from_file() {
            Ok(config) => config,
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from file only
    pub fn load_from_file() -> Result<Self> {
        let config_path = Self::config_file();

        if !config_path.exists() {
            return Err(RelayError::config("Config file not found"));
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|e| RelayError::config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse a TOML document; missing sections fall back to defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)
            .map_err(|e| RelayError::config(format!("Failed to parse config: {}", e)))?;

        // Secrets come from the environment only
        if config.service.api_key.is_none() {
            config.service.api_key = ServiceConfig::default().api_key;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_dir = Self::config_dir();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .map_err(|e| RelayError::config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| RelayError::config(format!("Failed to serialize config: {}", e)))?;

        fs::write(Self::config_file(), content)
            .map_err(|e| RelayError::config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.service.base_url).map_err(|e| {
            RelayError::config(format!("Invalid base_url '{}': {}", self.service.base_url, e))
        })?;

        if self.service.provider == ServiceProvider::Azure && self.service.api_version.is_none() {
            return Err(RelayError::config("Azure provider requires api_version"));
        }
        if self.run.poll_interval_ms == 0 {
            return Err(RelayError::config("poll_interval_ms must be positive"));
        }
        if self.run.max_poll_interval_ms < self.run.poll_interval_ms {
            return Err(RelayError::config(
                "max_poll_interval_ms must be >= poll_interval_ms",
            ));
        }
        if !(1.0..=RunConfig::MAX_BACKOFF_FACTOR).contains(&self.run.backoff_factor) {
            return Err(RelayError::config(format!(
                "backoff_factor must be in 1.0..={}",
                RunConfig::MAX_BACKOFF_FACTOR
            )));
        }
        if self.run.run_timeout_secs == 0
            || self.run.run_timeout_secs > RunConfig::MAX_RUN_TIMEOUT_SECS
        {
            return Err(RelayError::config(format!(
                "run_timeout_secs must be in 1..={}",
                RunConfig::MAX_RUN_TIMEOUT_SECS
            )));
        }
        if self.run.message_page_size == 0 || self.run.message_page_size > 100 {
            return Err(RelayError::config("message_page_size must be in 1..=100"));
        }
        if self.dispatch.max_workers == 0 {
            return Err(RelayError::config("max_workers must be positive"));
        }
        if self.dispatch.call_timeout_secs == 0 {
            return Err(RelayError::config("call_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Generate a default config file content for display
    pub fn default_config_toml() -> String {
        toml::to_string_pretty(&Config::default())
            .unwrap_or_else(|_| String::from("# Error generating config"))
    }
}
