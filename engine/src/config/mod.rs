//! Configuration management
//!
//! This module handles loading, validation, and management of the Courier configuration.
//! Configuration is stored in TOML format at ~/.courier/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, scratch directory for downloaded artifacts
//! - **bus**: Broker endpoint, listen address, reconnect backoff
//! - **limits**: Artifact size, audio duration, character budget, timeouts
//! - **coordinator**: Liveness check and progress relay switches
//! - **telegram**: Bot API settings for the conversation front end
//! - **analysis**: Analysis provider settings
//! - **extractors**: External converter and transcriber commands
//!
//! Every section is optional and falls back to its defaults.
//!
//! # Credentials
//!
//! Credentials never live in this file. Fields ending in `_key` name a secret
//! that is resolved at startup by [`crate::secrets::SecretManager`].
//!
//! # Examples
//!
//! ```no_run
//! use courier_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load configuration from default location
//! let config = Config::load_or_create()?;
//!
//! // Access configuration values
//! println!("Bus endpoint: {}", config.bus.endpoint);
//! println!("Character budget: {}", config.limits.char_budget);
//! # Ok(())
//! # }
//! ```

use courier_sdk::errors::DispatchError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::message_bus::Backoff;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Message bus settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Processing bounds
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Coordinator behaviour
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Telegram front end
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Analysis provider
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// External extraction commands
    #[serde(default)]
    pub extractors: ExtractorsConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Parent directory for per-task scratch directories (supports ~ expansion)
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Broker url used by coordinator and workers
    #[serde(default = "default_bus_endpoint")]
    pub endpoint: String,

    /// Address the broker listens on
    #[serde(default = "default_bus_listen")]
    pub listen: String,

    /// Secret name of the shared broker token
    #[serde(default = "default_bus_token_key")]
    pub auth_token_key: String,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Upper bound for the reconnect delay in seconds
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

/// Processing bounds
///
/// Supplied at process start and never changed at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum artifact size in bytes
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,

    /// Maximum audio duration in seconds
    #[serde(default = "default_max_audio_secs")]
    pub max_audio_secs: u32,

    /// Maximum number of characters passed to analysis
    #[serde(default = "default_char_budget")]
    pub char_budget: usize,

    /// Seconds a task may stay outstanding before it times out
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Seconds between correlation sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Seconds allowed for one analysis call
    #[serde(default = "default_analysis_timeout_secs")]
    pub analysis_timeout_secs: u64,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Refuse to dispatch when no worker is subscribed to the task channel
    #[serde(default)]
    pub require_live_worker: bool,

    /// Forward worker progress events to the conversation
    #[serde(default = "default_true")]
    pub relay_progress: bool,
}

/// Telegram front end configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot API base url
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,

    /// Secret name of the bot token
    #[serde(default = "default_telegram_token_key")]
    pub token_key: String,

    /// User ids allowed to talk to the bot (empty = everyone)
    #[serde(default)]
    pub allowed_users: Vec<i64>,

    /// Long polling timeout in seconds
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

/// Analysis provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Base URL for Gemini API
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_gemini_model")]
    pub model: String,

    /// Secret name of the API key
    #[serde(default = "default_analysis_key")]
    pub api_key_key: String,
}

/// External extraction commands
///
/// Commands are argument vectors; `{input}` is replaced by the artifact path.
/// An empty vector disables the collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorsConfig {
    /// Optional override that converts every binary document format to
    /// plain text on stdout; required only for legacy formats such as .doc
    #[serde(default)]
    pub document_converter: Vec<String>,

    /// Transcribes an audio file to plain text on stdout
    #[serde(default)]
    pub transcriber: Vec<String>,

    /// Seconds an external command may run
    #[serde(default = "default_extractor_timeout_secs")]
    pub timeout_secs: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("~/.courier/scratch")
}

fn default_bus_endpoint() -> String {
    "ws://127.0.0.1:7700/bus".to_string()
}

fn default_bus_listen() -> String {
    "127.0.0.1:7700".to_string()
}

fn default_bus_token_key() -> String {
    "COURIER_BUS_TOKEN".to_string()
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_secs() -> u64 {
    30
}

fn default_max_artifact_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_max_audio_secs() -> u32 {
    1800
}

fn default_char_budget() -> usize {
    10_000
}

fn default_task_timeout_secs() -> u64 {
    1800
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_analysis_timeout_secs() -> u64 {
    120
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_telegram_token_key() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_gemini_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_analysis_key() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_extractor_timeout_secs() -> u64 {
    300
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: default_bus_endpoint(),
            listen: default_bus_listen(),
            auth_token_key: default_bus_token_key(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_artifact_bytes: default_max_artifact_bytes(),
            max_audio_secs: default_max_audio_secs(),
            char_budget: default_char_budget(),
            task_timeout_secs: default_task_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            analysis_timeout_secs: default_analysis_timeout_secs(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            require_live_worker: false,
            relay_progress: true,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: default_telegram_api_base(),
            token_key: default_telegram_token_key(),
            allowed_users: Vec::new(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_url: default_gemini_base_url(),
            model: default_gemini_model(),
            api_key_key: default_analysis_key(),
        }
    }
}

impl Default for ExtractorsConfig {
    fn default() -> Self {
        Self {
            document_converter: Vec::new(),
            transcriber: Vec::new(),
            timeout_secs: default_extractor_timeout_secs(),
        }
    }
}

impl BusConfig {
    /// Reconnect backoff built from the configured delays
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_secs(self.reconnect_max_secs),
        )
    }
}

impl LimitsConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }
}

impl Config {
    /// Load configuration from the default location (~/.courier/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    /// Validates the configuration after loading and returns descriptive errors
    /// if validation fails.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails (invalid values, bad endpoint)
    pub fn load_or_create() -> Result<Self, DispatchError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load from `path` when given, otherwise from the default location
    pub fn load(path: Option<&Path>) -> Result<Self, DispatchError> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load_or_create(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_from_path(path: &Path) -> Result<Self, DispatchError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| DispatchError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, DispatchError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DispatchError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| DispatchError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| DispatchError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.courier/config.toml)
    fn default_config_path() -> Result<PathBuf, DispatchError> {
        let home = dirs::home_dir().ok_or_else(|| {
            DispatchError::Config("Could not determine home directory".to_string())
        })?;

        Ok(home.join(".courier").join("config.toml"))
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates log level, bounds and timeouts
    /// - Validates the bus endpoint and listen address
    /// - Expands ~ in the scratch directory and creates it if missing
    pub fn validate_and_process(&mut self) -> Result<(), DispatchError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(DispatchError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if !(self.bus.endpoint.starts_with("ws://") || self.bus.endpoint.starts_with("wss://")) {
            return Err(DispatchError::Config(format!(
                "Bus endpoint must start with ws:// or wss://, got '{}'",
                self.bus.endpoint
            )));
        }

        self.bus.listen.parse::<SocketAddr>().map_err(|e| {
            DispatchError::Config(format!("Invalid bus listen address '{}': {}", self.bus.listen, e))
        })?;

        if self.bus.reconnect_initial_ms == 0 {
            return Err(DispatchError::Config(
                "reconnect_initial_ms must be greater than 0".to_string(),
            ));
        }

        let limits = &self.limits;
        if limits.max_artifact_bytes == 0 {
            return Err(DispatchError::Config(
                "max_artifact_bytes must be greater than 0".to_string(),
            ));
        }
        if limits.max_audio_secs == 0 {
            return Err(DispatchError::Config(
                "max_audio_secs must be greater than 0".to_string(),
            ));
        }
        if limits.char_budget == 0 {
            return Err(DispatchError::Config(
                "char_budget must be greater than 0".to_string(),
            ));
        }
        if limits.task_timeout_secs == 0 || limits.analysis_timeout_secs == 0 {
            return Err(DispatchError::Config(
                "task and analysis timeouts must be greater than 0".to_string(),
            ));
        }
        if limits.sweep_interval_secs == 0 || limits.sweep_interval_secs > limits.task_timeout_secs
        {
            return Err(DispatchError::Config(format!(
                "sweep_interval_secs must be between 1 and task_timeout_secs ({})",
                limits.task_timeout_secs
            )));
        }

        if self.extractors.timeout_secs == 0 {
            return Err(DispatchError::Config(
                "extractors.timeout_secs must be greater than 0".to_string(),
            ));
        }

        self.core.scratch_dir = expand_path(&self.core.scratch_dir)?;
        if !self.core.scratch_dir.exists() {
            fs::create_dir_all(&self.core.scratch_dir).map_err(|e| {
                DispatchError::Config(format!("Failed to create scratch directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
///
/// # Examples
///
/// ```ignore
/// let path = PathBuf::from("~/.courier/scratch");
/// let expanded = expand_path(&path)?;
/// // expanded is now /home/user/.courier/scratch (on Unix)
/// ```
fn expand_path(path: &Path) -> Result<PathBuf, DispatchError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| DispatchError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| {
            DispatchError::Config("Could not determine home directory".to_string())
        })?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| DispatchError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_creation() {
        let config = Config::default();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.limits.max_artifact_bytes, 52_428_800);
        assert_eq!(config.limits.max_audio_secs, 1800);
        assert_eq!(config.limits.char_budget, 10_000);
        assert_eq!(config.limits.task_timeout_secs, 1800);
        assert!(!config.coordinator.require_live_worker);
        assert!(config.coordinator.relay_progress);
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.bus.endpoint, deserialized.bus.endpoint);
        assert_eq!(config.limits.char_budget, deserialized.limits.char_budget);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bus.listen, "127.0.0.1:7700");
        assert_eq!(config.extractors.timeout_secs, 300);
    }

    #[test]
    fn test_rejects_sweep_longer_than_timeout() {
        let mut config = Config::default();
        config.core.scratch_dir = std::env::temp_dir();
        config.limits.task_timeout_secs = 10;
        config.limits.sweep_interval_secs = 20;

        assert!(matches!(
            config.validate_and_process(),
            Err(DispatchError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_non_websocket_endpoint() {
        let mut config = Config::default();
        config.core.scratch_dir = std::env::temp_dir();
        config.bus.endpoint = "redis://localhost:6379".to_string();

        assert!(config.validate_and_process().is_err());
    }

    #[test]
    fn test_durations() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.task_timeout(), Duration::from_secs(1800));
        assert_eq!(limits.sweep_interval(), Duration::from_secs(5));
        assert_eq!(limits.analysis_timeout(), Duration::from_secs(120));
    }
}
