//! Configuration management module for the packet tunnel.
//!
//! This module provides functionality for loading, parsing, and managing
//! configuration settings for the tunnel controller and its host process.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::tunnel::ControllerPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Controller policy settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Invoke the failure hook every N connection losses; 0 disables (default: 2)
    #[serde(default = "default_failure_hook_interval")]
    pub failure_hook_interval: u32,

    /// Enter the error state after this many consecutive failed reconnects.
    /// Unset means never give up.
    #[serde(default)]
    pub reconnect_escalation_threshold: Option<u32>,

    /// How long stop waits for a cancelled task, in milliseconds (default: 5000)
    #[serde(default = "default_task_join_timeout_ms")]
    pub task_join_timeout_ms: u64,
}

fn default_failure_hook_interval() -> u32 {
    2
}

fn default_task_join_timeout_ms() -> u64 {
    5_000
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            failure_hook_interval: default_failure_hook_interval(),
            reconnect_escalation_threshold: None,
            task_join_timeout_ms: default_task_join_timeout_ms(),
        }
    }
}

impl ControllerConfig {
    /// Returns the task join timeout as a [`Duration`].
    pub fn task_join_timeout(&self) -> Duration {
        Duration::from_millis(self.task_join_timeout_ms)
    }

    /// Runtime policy for the controller.
    pub fn policy(&self) -> ControllerPolicy {
        ControllerPolicy {
            failure_hook_interval: self.failure_hook_interval,
            reconnect_escalation_threshold: self.reconnect_escalation_threshold,
            task_join_timeout: self.task_join_timeout(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,

    /// Also write logs to a daily rotated file
    #[serde(default)]
    pub log_to_file: bool,

    /// Directory for log files (default: "./logs")
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Base filename for log files (default: "packet-tunnel")
    #[serde(default = "default_log_file_name")]
    pub log_file_name: String,
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_log_file_name() -> String {
    "packet-tunnel".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            json: false,
            log_to_file: false,
            log_dir: default_log_dir(),
            log_file_name: default_log_file_name(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Controller policy
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            controller: ControllerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;

        // Environment variables take precedence over the file
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "log_level".to_string(),
                message: format!("expected one of {}", LOG_LEVELS.join(", ")),
            });
        }

        if self.controller.task_join_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "controller.task_join_timeout_ms".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.controller.reconnect_escalation_threshold == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "controller.reconnect_escalation_threshold".to_string(),
                message: "must be greater than 0 when set".to_string(),
            });
        }

        if self.logging.log_to_file && self.logging.log_file_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "logging.log_file_name".to_string(),
                message: "log file name cannot be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: PACKET_TUNNEL_)
    /// Example keys:
    /// - PACKET_TUNNEL_LOG_LEVEL
    /// - PACKET_TUNNEL_CONTROLLER_FAILURE_HOOK_INTERVAL,
    ///   PACKET_TUNNEL_CONTROLLER_RECONNECT_ESCALATION_THRESHOLD,
    ///   PACKET_TUNNEL_CONTROLLER_TASK_JOIN_TIMEOUT_MS
    /// - PACKET_TUNNEL_LOGGING_JSON, PACKET_TUNNEL_LOGGING_LOG_TO_FILE,
    ///   PACKET_TUNNEL_LOGGING_LOG_DIR
    fn apply_env_overrides(cfg: &mut Config) {
        Self::apply_overrides(cfg, |key| std::env::var(key).ok());
    }

    /// Apply overrides looked up by `var`. Values that fail to parse are
    /// ignored and the configured value is kept.
    fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }

        if let Some(v) = var("PACKET_TUNNEL_LOG_LEVEL") {
            cfg.log_level = v;
        }

        // Controller
        if let Some(v) = var("PACKET_TUNNEL_CONTROLLER_FAILURE_HOOK_INTERVAL") {
            if let Ok(n) = v.parse() {
                cfg.controller.failure_hook_interval = n;
            }
        }
        if let Some(v) = var("PACKET_TUNNEL_CONTROLLER_RECONNECT_ESCALATION_THRESHOLD") {
            if let Ok(n) = v.parse() {
                cfg.controller.reconnect_escalation_threshold = Some(n);
            }
        }
        if let Some(v) = var("PACKET_TUNNEL_CONTROLLER_TASK_JOIN_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                cfg.controller.task_join_timeout_ms = n;
            }
        }

        // Logging
        if let Some(v) = var("PACKET_TUNNEL_LOGGING_JSON") {
            if let Some(b) = parse_bool(&v) {
                cfg.logging.json = b;
            }
        }
        if let Some(v) = var("PACKET_TUNNEL_LOGGING_LOG_TO_FILE") {
            if let Some(b) = parse_bool(&v) {
                cfg.logging.log_to_file = b;
            }
        }
        if let Some(v) = var("PACKET_TUNNEL_LOGGING_LOG_DIR") {
            if !v.is_empty() {
                cfg.logging.log_dir = v;
            }
        }
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("packet-tunnel").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}

/// Configuration manager for handling configuration loading and reloading.
#[derive(Debug)]
pub struct ConfigManager {
    /// Current configuration
    config: Config,
    /// Path to the configuration file
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with the default configuration
    pub fn new() -> Self {
        ConfigManager {
            config: Config::default(),
            config_path: Config::default_path(),
        }
    }

    /// Load configuration from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(Config::default_path())
    }

    /// Get a reference to the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a mutable reference to the current configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Reload configuration from the current path
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config.reload(&self.config_path)
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }

    /// Get the current configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
