//! Configuration loading, validation, and management for Stepwise.
//!
//! Loads configuration from `~/.stepwise/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use stepwise_core::EvaluationCriteria;

/// The root configuration structure.
///
/// Maps directly to `~/.stepwise/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model identifier sent with every request
    #[serde(default = "default_model")]
    pub model: String,

    /// Hard cap on orchestrator loop passes per task
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Step executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Evaluation thresholds
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Connection to the completion service
    #[serde(default)]
    pub transport: TransportConfig,

    /// Streaming router settings
    #[serde(default)]
    pub router: RouterConfig,

    /// Recovery-step policy
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

fn default_model() -> String {
    "claude".into()
}
fn default_max_iterations() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Seconds to wait for a completion event before resolving with the timeout sentinel
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Maximum tool invocations executed per step
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,

    /// Tool name that short-circuits remaining tool processing
    #[serde(default = "default_stop_tool")]
    pub stop_tool: String,
}

fn default_step_timeout_secs() -> u64 {
    30
}
fn default_max_tool_calls() -> usize {
    25
}
fn default_stop_tool() -> String {
    "stop".into()
}

impl ExecutorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            max_tool_calls: default_max_tool_calls(),
            stop_tool: default_stop_tool(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_minimum_confidence")]
    pub minimum_confidence: f64,

    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    #[serde(default = "default_true")]
    pub must_meet_all_criteria: bool,

    #[serde(default)]
    pub allow_partial_completion: bool,
}

fn default_minimum_confidence() -> f64 {
    0.8
}
fn default_quality_threshold() -> f64 {
    0.7
}
fn default_true() -> bool {
    true
}

impl EvaluationConfig {
    pub fn criteria(&self) -> EvaluationCriteria {
        EvaluationCriteria {
            minimum_confidence: self.minimum_confidence,
            quality_threshold: self.quality_threshold,
            must_meet_all_criteria: self.must_meet_all_criteria,
            allow_partial_completion: self.allow_partial_completion,
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            minimum_confidence: default_minimum_confidence(),
            quality_threshold: default_quality_threshold(),
            must_meet_all_criteria: true,
            allow_partial_completion: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// WebSocket endpoint of the completion service
    #[serde(default = "default_url")]
    pub url: String,

    /// Connection attempts before reporting the transport as disconnected
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Fixed delay between connection attempts
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

fn default_url() -> String {
    "ws://127.0.0.1:3001".into()
}
fn default_max_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_backoff_ms() -> u64 {
    1000
}

impl TransportConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Prefix on a user message that marks an unattended run; tool markers
    /// are suppressed for replies to such messages
    #[serde(default = "default_autonomous_prefix")]
    pub autonomous_prefix: String,
}

fn default_autonomous_prefix() -> String {
    "[AUTONOMOUS]".into()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            autonomous_prefix: default_autonomous_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Recovery steps the orchestrator may append per task (0 disables)
    #[serde(default = "default_max_recovery_steps")]
    pub max_recovery_steps: usize,
}

fn default_max_recovery_steps() -> usize {
    2
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_recovery_steps: default_max_recovery_steps(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default path (~/.stepwise/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `STEPWISE_MODEL`
    /// - `STEPWISE_URL`
    /// - `STEPWISE_MAX_ITERATIONS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(model) = std::env::var("STEPWISE_MODEL") {
            self.model = model;
        }

        if let Ok(url) = std::env::var("STEPWISE_URL") {
            self.transport.url = url;
        }

        if let Ok(raw) = std::env::var("STEPWISE_MAX_ITERATIONS") {
            self.max_iterations = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "STEPWISE_MAX_ITERATIONS must be a positive integer, got '{raw}'"
                ))
            })?;
        }

        self.validate()
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".stepwise")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "max_iterations must be at least 1".into(),
            ));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("model must not be empty".into()));
        }

        if self.executor.step_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "executor.step_timeout_secs must be > 0".into(),
            ));
        }

        for (name, value) in [
            ("evaluation.minimum_confidence", self.evaluation.minimum_confidence),
            ("evaluation.quality_threshold", self.evaluation.quality_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be between 0.0 and 1.0"
                )));
            }
        }

        if self.transport.max_reconnect_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "transport.max_reconnect_attempts must be at least 1".into(),
            ));
        }

        if !self.transport.url.starts_with("ws://") && !self.transport.url.starts_with("wss://") {
            return Err(ConfigError::ValidationError(format!(
                "transport.url must be a ws:// or wss:// URL, got '{}'",
                self.transport.url
            )));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_iterations: default_max_iterations(),
            executor: ExecutorConfig::default(),
            evaluation: EvaluationConfig::default(),
            transport: TransportConfig::default(),
            router: RouterConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for stepwise_core::Error {
    fn from(err: ConfigError) -> Self {
        stepwise_core::Error::Config {
            message: err.to_string(),
        }
    }
}
