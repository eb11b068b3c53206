//! Configuration management for chatshard
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{ChatshardError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for chatshard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Completion endpoint settings
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Chat persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Streaming and throttling settings
    #[serde(default)]
    pub streaming: StreamingConfig,
}

/// OpenAI-compatible completion endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL; `/chat/completions` is appended
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Bearer token; the header is omitted when unset
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name sent with every request
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key: None,
            model: default_model(),
        }
    }
}

/// Chat persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the sled database; the platform data dir when unset
    #[serde(default)]
    pub path: Option<String>,

    /// Identifies this process's current-chat pointer
    #[serde(default = "default_session_id")]
    pub session_id: String,

    /// Title given to chats created without one
    #[serde(default = "default_chat_title")]
    pub default_chat_title: String,

    /// Delay before a scheduled flush pass runs
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,

    /// Upper bound on how long a scheduled pass may wait
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Time a single flush pass may run before yielding
    #[serde(default = "default_flush_budget_ms")]
    pub flush_budget_ms: u64,

    /// Passes `flush_now` runs before giving up on draining
    #[serde(default = "default_flush_now_max_rounds")]
    pub flush_now_max_rounds: usize,
}

fn default_session_id() -> String {
    "default".to_string()
}

fn default_chat_title() -> String {
    "New Chat".to_string()
}

fn default_idle_delay_ms() -> u64 {
    50
}

fn default_flush_timeout_ms() -> u64 {
    1000
}

fn default_flush_budget_ms() -> u64 {
    8
}

fn default_flush_now_max_rounds() -> usize {
    200
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            session_id: default_session_id(),
            default_chat_title: default_chat_title(),
            idle_delay_ms: default_idle_delay_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            flush_budget_ms: default_flush_budget_ms(),
            flush_now_max_rounds: default_flush_now_max_rounds(),
        }
    }
}

impl StorageConfig {
    /// Delay before a scheduled pass runs
    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    /// Upper bound on the wait of a scheduled pass
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Time budget of one pass
    pub fn flush_budget(&self) -> Duration {
        Duration::from_millis(self.flush_budget_ms)
    }

    /// Database directory, falling back to the platform data directory
    ///
    /// # Errors
    ///
    /// Returns `ChatshardError::Config` when no path is configured and the
    /// platform has no data directory.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(PathBuf::from(path));
        }
        directories::ProjectDirs::from("", "", "chatshard")
            .map(|dirs| dirs.data_dir().join("store"))
            .ok_or_else(|| {
                ChatshardError::Config(
                    "No storage path configured and no platform data directory".to_string(),
                )
                .into()
            })
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Minimum interval between snapshots handed to the view
    #[serde(default = "default_throttle_interval_ms")]
    pub throttle_interval_ms: u64,

    /// Detection of reasoning tokens sent as answer content
    #[serde(default)]
    pub misfiled_reasoning: MisfiledReasoningConfig,
}

fn default_throttle_interval_ms() -> u64 {
    100
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            throttle_interval_ms: default_throttle_interval_ms(),
            misfiled_reasoning: MisfiledReasoningConfig::default(),
        }
    }
}

impl StreamingConfig {
    /// Throttle interval as a duration
    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }
}

/// Misfiled reasoning detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MisfiledReasoningConfig {
    /// Inspect the start of the first content
    #[serde(default)]
    pub enabled: bool,

    /// Case-insensitive markers that identify reasoning at the start of content
    #[serde(default = "default_reasoning_prefixes")]
    pub prefixes: Vec<String>,

    /// Markers that end the reasoning section when a turn is restarted
    #[serde(default = "default_reasoning_end_markers")]
    pub end_markers: Vec<String>,
}

fn default_reasoning_prefixes() -> Vec<String> {
    vec!["<think>".to_string(), "think".to_string()]
}

fn default_reasoning_end_markers() -> Vec<String> {
    vec!["</think>".to_string()]
}

impl Default for MisfiledReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefixes: default_reasoning_prefixes(),
            end_markers: default_reasoning_end_markers(),
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ChatshardError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| ChatshardError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(api_base) = std::env::var("CHATSHARD_API_BASE") {
            self.provider.api_base = api_base;
        }

        if let Ok(api_key) = std::env::var("CHATSHARD_API_KEY") {
            self.provider.api_key = Some(api_key).filter(|key| !key.is_empty());
        }

        if let Ok(model) = std::env::var("CHATSHARD_MODEL") {
            self.provider.model = model;
        }

        if let Ok(path) = std::env::var("CHATSHARD_STORAGE_PATH") {
            self.storage.path = Some(path);
        }

        if let Ok(session_id) = std::env::var("CHATSHARD_SESSION_ID") {
            self.storage.session_id = session_id;
        }

        if let Ok(throttle) = std::env::var("CHATSHARD_THROTTLE_MS") {
            if let Ok(value) = throttle.parse() {
                self.streaming.throttle_interval_ms = value;
            } else {
                tracing::warn!("Invalid CHATSHARD_THROTTLE_MS: {}", throttle);
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(path) = &cli.storage_path {
            tracing::debug!("Using storage path override from CLI: {}", path);
            self.storage.path = Some(path.clone());
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ChatshardError::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = url::Url::parse(&self.provider.api_base) {
            return Err(ChatshardError::Config(format!(
                "provider.api_base is not a valid URL ({}): {}",
                self.provider.api_base, e
            ))
            .into());
        }

        if self.provider.model.trim().is_empty() {
            return Err(
                ChatshardError::Config("provider.model cannot be empty".to_string()).into(),
            );
        }

        if self.storage.session_id.trim().is_empty() {
            return Err(
                ChatshardError::Config("storage.session_id cannot be empty".to_string()).into(),
            );
        }

        if self.storage.default_chat_title.trim().is_empty() {
            return Err(ChatshardError::Config(
                "storage.default_chat_title cannot be empty".to_string(),
            )
            .into());
        }

        if self.storage.flush_now_max_rounds == 0 {
            return Err(ChatshardError::Config(
                "storage.flush_now_max_rounds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.streaming.throttle_interval_ms == 0 {
            return Err(ChatshardError::Config(
                "streaming.throttle_interval_ms must be greater than 0".to_string(),
            )
            .into());
        }

        let misfiled = &self.streaming.misfiled_reasoning;
        if misfiled.enabled && misfiled.prefixes.iter().all(|p| p.trim().is_empty()) {
            return Err(ChatshardError::Config(
                "streaming.misfiled_reasoning.prefixes cannot be empty when enabled".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
