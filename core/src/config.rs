/// Configuration management for the Stepwise workflow engine.
/// Handles loading, parsing and validation of .stepwise/config.toml
use crate::errors::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Top-level configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepwiseConfig {
    /// Sequence/feedback backend settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Effect dispatch settings
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Logging and observability settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the reasoning backend (can be read from env: STEPWISE_BACKEND_URL)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the streaming sequence endpoint
    #[serde(default = "default_sequence_path")]
    pub sequence_path: String,

    /// Path of the feedback endpoint
    #[serde(default = "default_feedback_path")]
    pub feedback_path: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Bearer token (can be read from env: STEPWISE_API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            sequence_path: default_sequence_path(),
            feedback_path: default_feedback_path(),
            timeout_secs: default_timeout(),
            api_key: None,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_sequence_path() -> String {
    "/sequence".to_string()
}

fn default_feedback_path() -> String {
    "/feedback".to_string()
}

fn default_timeout() -> u64 {
    300
}

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Capacity of the command/event queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, text, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Configuration loader and manager
pub struct ConfigManager {
    config: StepwiseConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults
    pub fn load(config_path: Option<&Path>) -> ConfigResult<Self> {
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(".stepwise/config.toml"),
        };

        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            warn!("Config file not found at {:?}, using defaults", path);
            StepwiseConfig::default()
        };

        debug!("Configuration loaded successfully");
        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    pub fn from_config(config: StepwiseConfig, config_path: PathBuf) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Get configuration reference
    pub fn config(&self) -> &StepwiseConfig {
        &self.config
    }

    /// Save configuration to file
    pub fn save(&self) -> ConfigResult<()> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(&self.config)?;
        std::fs::write(&self.config_path, content)?;

        info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.config.backend.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("Backend base_url must be set".to_string()));
        }

        if self.config.backend.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "Backend timeout must be greater than 0".to_string(),
            ));
        }

        if self.config.runner.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "Runner queue capacity must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.config.logging.format.as_str(), "text" | "json" | "pretty") {
            return Err(ConfigError::Invalid(format!(
                "Unknown log format: {}",
                self.config.logging.format
            )));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Load configuration from environment variables
    pub fn load_from_env(&mut self) {
        if let Ok(url) = std::env::var("STEPWISE_BACKEND_URL") {
            self.config.backend.base_url = url;
        }

        if let Ok(key) = std::env::var("STEPWISE_API_KEY") {
            self.config.backend.api_key = Some(key);
        }

        debug!("Environment overrides applied");
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}
