//! Configuration management
//!
//! This module handles loading, validation, and management of the SAAN configuration.
//! Configuration is stored in TOML format at ~/.saan/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: data directory, log level, optional fixed session id
//! - **gate**: risk gate switch, block threshold and rule table overrides
//! - **loop_guard**: loop detector window and limits
//! - **audit**: snapshot interval and restore horizon
//!
//! Every section except `core` may be omitted and falls back to defaults.
//!
//! # Examples
//!
//! ```no_run
//! use saan_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Data directory: {:?}", config.core.data_dir);
//! println!("Block threshold: {}", config.gate.block_threshold);
//! # Ok(())
//! # }
//! ```

use chrono::{TimeDelta, Utc};
use saan_sdk::GatewayError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::conductor::Ledger;
use crate::db::{hours_span, seconds_span};
use crate::loop_detector::LoopLimits;
use crate::risk_assessor::{RiskRules, DEFAULT_BLOCK_THRESHOLD};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    pub core: CoreConfig,

    /// Risk gate
    #[serde(default)]
    pub gate: GateConfig,

    /// Loop detector
    #[serde(default)]
    pub loop_guard: LoopLimits,

    /// Audit store and snapshots
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Fixed session id instead of the one derived from the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            session_id: None,
        }
    }
}

/// Risk gate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Totals at or above this are rejected
    #[serde(default = "default_block_threshold")]
    pub block_threshold: u32,

    #[serde(default)]
    pub rules: RiskRules,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_threshold: DEFAULT_BLOCK_THRESHOLD,
            rules: RiskRules::default(),
        }
    }
}

/// Audit configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Minimum seconds between periodic snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// Oldest snapshot `restore_previous_context` will use by default
    #[serde(default = "default_restore_max_age")]
    pub restore_max_age_hours: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: default_snapshot_interval(),
            restore_max_age_hours: default_restore_max_age(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.saan")
}

fn default_block_threshold() -> u32 {
    DEFAULT_BLOCK_THRESHOLD
}

fn default_snapshot_interval() -> u64 {
    300
}

fn default_restore_max_age() -> u64 {
    24
}

impl Config {
    /// Load configuration from the default location (~/.saan/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    pub fn load_or_create() -> Result<Self, GatewayError> {
        let config_path = Self::default_config_path()?;
        Self::load_or_create_at(&config_path)
    }

    /// Load configuration from `path`, writing defaults there first if missing
    pub fn load_or_create_at(path: &Path) -> Result<Self, GatewayError> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            Self::create_default(path)
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
    pub fn load_from_path(path: &Path) -> Result<Self, GatewayError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse, validate and process a TOML document
    pub fn from_toml(contents: &str) -> Result<Self, GatewayError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        config.process()?;

        Ok(config)
    }

    fn create_default(path: &Path) -> Result<Self, GatewayError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                GatewayError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config = Self::default();

        // Written before path expansion so the file keeps the portable ~ form
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| GatewayError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, toml_string)
            .map_err(|e| GatewayError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = config;
        config.process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.saan/config.toml)
    pub fn default_config_path() -> Result<PathBuf, GatewayError> {
        let home = dirs::home_dir()
            .ok_or_else(|| GatewayError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".saan").join("config.toml"))
    }

    /// Reject values the gateway cannot run with
    pub fn validate(&self) -> Result<(), GatewayError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(GatewayError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if let Some(session_id) = &self.core.session_id {
            if session_id.trim().is_empty() {
                return Err(GatewayError::Config("session_id must not be empty".into()));
            }
        }

        if self.gate.block_threshold == 0 {
            return Err(GatewayError::Config(
                "block_threshold must be greater than 0".into(),
            ));
        }

        if self.loop_guard.window_secs == 0
            || !within_calendar(seconds_span(self.loop_guard.window_secs))
        {
            return Err(GatewayError::Config(
                "loop_guard.window_secs must be greater than 0 and representable".into(),
            ));
        }
        if self.loop_guard.method_limit <= 0 || self.loop_guard.tool_limit <= 0 {
            return Err(GatewayError::Config(
                "loop_guard limits must be greater than 0".into(),
            ));
        }

        if self.audit.snapshot_interval_secs == 0
            || !within_calendar(seconds_span(self.audit.snapshot_interval_secs))
        {
            return Err(GatewayError::Config(
                "snapshot_interval_secs must be greater than 0 and representable".into(),
            ));
        }
        if self.audit.restore_max_age_hours == 0
            || !within_calendar(hours_span(self.audit.restore_max_age_hours))
        {
            return Err(GatewayError::Config(
                "restore_max_age_hours must be greater than 0 and representable".into(),
            ));
        }

        Ok(())
    }

    /// Expand paths and make sure the data directory exists
    fn process(&mut self) -> Result<(), GatewayError> {
        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                GatewayError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }

    /// `<data_dir>/audit/<session_id>.db`
    pub fn audit_db_path(&self, session_id: &str) -> PathBuf {
        self.core
            .data_dir
            .join("audit")
            .join(format!("{}.db", session_id))
    }

    /// Workflow ledger under `<data_dir>/state_management`
    pub fn ledger(&self) -> Ledger {
        Ledger::in_data_dir(&self.core.data_dir)
    }
}

/// Expand ~ in path to user's home directory
/// A span that can be subtracted from the current time
fn within_calendar(span: Option<TimeDelta>) -> bool {
    span.and_then(|span| Utc::now().checked_sub_signed(span)).is_some()
}

fn expand_path(path: &Path) -> Result<PathBuf, GatewayError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| GatewayError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| GatewayError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| GatewayError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
