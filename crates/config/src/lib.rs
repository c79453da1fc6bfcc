//! Configuration loading, validation, and management for stepwise.
//!
//! Loads configuration from `~/.stepwise/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Grammar dialects the agent understands.
pub const DIALECTS: &[&str] = &["react", "granite"];

/// Memory strategies the agent understands.
pub const MEMORY_KINDS: &[&str] = &["unconstrained", "sliding"];

/// The root configuration structure.
///
/// Maps directly to `~/.stepwise/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the model endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of an OpenAI-compatible endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per model response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stream model output by default
    #[serde(default)]
    pub stream: bool,

    /// Retry and iteration budgets of a run
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// HTTP transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Agent behaviour
    #[serde(default)]
    pub agent: AgentConfig,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.0
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("stream", &self.stream)
            .field("execution", &self.execution)
            .field("transport", &self.transport)
            .field("agent", &self.agent)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_retries_per_step")]
    pub max_retries_per_step: u32,

    #[serde(default = "default_total_max_retries")]
    pub total_max_retries: u32,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Abort a run after this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_max_retries_per_step() -> u32 {
    3
}
fn default_total_max_retries() -> u32 {
    10
}
fn default_max_iterations() -> u32 {
    20
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries_per_step: default_max_retries_per_step(),
            total_max_retries: default_total_max_retries(),
            max_iterations: default_max_iterations(),
            timeout_secs: None,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Attempts to open a model call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8000
}
fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Grammar dialect: "react" or "granite"
    #[serde(default = "default_dialect")]
    pub dialect: String,

    /// Extra instructions appended to the system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Memory strategy: "unconstrained" or "sliding"
    #[serde(default = "default_memory")]
    pub memory: String,

    /// Messages kept by the sliding memory
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
}

fn default_dialect() -> String {
    "react".into()
}
fn default_memory() -> String {
    "unconstrained".into()
}
fn default_memory_window() -> usize {
    50
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dialect: default_dialect(),
            instructions: None,
            memory: default_memory(),
            memory_window: default_memory_window(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.stepwise/config.toml).
    ///
    /// Also checks environment variables:
    /// - `STEPWISE_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `STEPWISE_BASE_URL`
    /// - `STEPWISE_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
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

    /// Apply environment overrides through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("STEPWISE_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.api_key = Some(key);
        }

        if let Some(base_url) = lookup("STEPWISE_BASE_URL") {
            self.base_url = base_url;
        }

        if let Some(model) = lookup("STEPWISE_MODEL") {
            self.model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".stepwise")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.execution.max_iterations < 1 {
            return Err(ConfigError::ValidationError(
                "execution.max_iterations must be at least 1".into(),
            ));
        }

        if self.transport.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "transport.max_attempts must be at least 1".into(),
            ));
        }

        if !DIALECTS.contains(&self.agent.dialect.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "unknown agent.dialect '{}' (expected one of: {})",
                self.agent.dialect,
                DIALECTS.join(", ")
            )));
        }

        if !MEMORY_KINDS.contains(&self.agent.memory.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "unknown agent.memory '{}' (expected one of: {})",
                self.agent.memory,
                MEMORY_KINDS.join(", ")
            )));
        }

        if self.agent.memory_window == 0 {
            return Err(ConfigError::ValidationError(
                "agent.memory_window must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Render as TOML with the API key redacted.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.api_key.is_some() {
            shown.api_key = Some("[REDACTED]".into());
        }
        toml::to_string_pretty(&shown).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            stream: false,
            execution: ExecutionConfig::default(),
            transport: TransportConfig::default(),
            agent: AgentConfig::default(),
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

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.max_retries_per_step, 3);
        assert_eq!(config.execution.total_max_retries, 10);
        assert_eq!(config.execution.max_iterations, 20);
        assert_eq!(config.agent.dialect, "react");
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model, config.model);
        assert_eq!(parsed.transport.max_delay_ms, config.transport.max_delay_ms);
    }

    #[test]
    fn invalid_values_rejected() {
        let hot = AppConfig {
            temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(hot.validate().is_err());

        let mut no_iterations = AppConfig::default();
        no_iterations.execution.max_iterations = 0;
        assert!(no_iterations.validate().is_err());

        let mut bad_dialect = AppConfig::default();
        bad_dialect.agent.dialect = "haiku".into();
        let err = bad_dialect.validate().unwrap_err();
        assert!(err.to_string().contains("react, granite"));

        let mut bad_window = AppConfig::default();
        bad_window.agent.memory = "sliding".into();
        bad_window.agent.memory_window = 0;
        assert!(bad_window.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
model = "granite-3-8b"
stream = true

[execution]
max_retries_per_step = 2
timeout_secs = 120

[agent]
dialect = "granite"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.model, "granite-3-8b");
        assert!(config.stream);
        assert_eq!(config.execution.max_retries_per_step, 2);
        assert_eq!(config.execution.total_max_retries, 10);
        assert_eq!(config.execution.timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.agent.dialect, "granite");
        assert_eq!(config.agent.memory, "unconstrained");
    }

    #[test]
    fn invalid_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "model = [").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn env_overrides_apply_in_priority_order() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-openai"),
            ("STEPWISE_API_KEY", "sk-stepwise"),
            ("STEPWISE_MODEL", "granite-3-8b"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.api_key.as_deref(), Some("sk-stepwise"));
        assert_eq!(config.model, "granite-3-8b");
        assert_eq!(config.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn secrets_never_printed() {
        let config = AppConfig {
            api_key: Some("sk-secret-value".into()),
            ..AppConfig::default()
        };
        assert!(!format!("{config:?}").contains("sk-secret-value"));
        let shown = config.to_redacted_toml().unwrap();
        assert!(!shown.contains("sk-secret-value"));
        assert!(shown.contains("[REDACTED]"));
    }
}
