//! Session configuration
//!
//! Loaded from a TOML file; every field has a default so a partial file (or
//! no file at all) yields a usable configuration.

use crate::connection::ReconnectPolicy;
use crate::session::TurnDetectionMode;
use crate::{Result, SessionError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Greeting sent into the conversation right after connecting
pub const DEFAULT_GREETING: &str = "Hello! Let's get started.";

/// Reconnect backoff settings
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect attempts before the loss becomes fatal
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        }
    }
}

impl ReconnectConfig {
    /// Build the runtime policy (attempt counter starts at zero)
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.max_attempts, self.base_delay_ms, self.max_delay_ms)
    }
}

/// Conversation settings applied on connect
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Text item sent once the connection is up
    pub greeting: String,
    /// Turn detection mode at startup
    pub turn_detection: TurnDetectionMode,
    /// Optional system instructions pushed with the session update
    pub instructions: Option<String>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            greeting: DEFAULT_GREETING.to_string(),
            turn_detection: TurnDetectionMode::Manual,
            instructions: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Capacity of the UI event channel
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
        }
    }
}

/// Complete session manager configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub reconnect: ReconnectConfig,
    pub session: ConversationConfig,
    pub events: EventConfig,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config file location: `<config_dir>/parley/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("parley").join("config.toml"))
    }

    /// Load and validate a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config = Self::from_toml(&content)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path`, or defaults when the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse and validate TOML content
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(content)
            .map_err(|e| SessionError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let reconnect = &self.reconnect;
        if reconnect.max_attempts == 0 {
            return Err(SessionError::Config(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        if reconnect.base_delay_ms == 0 {
            return Err(SessionError::Config(
                "reconnect.base_delay_ms must be positive".to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(SessionError::Config(format!(
                "reconnect.max_delay_ms ({}) is below base_delay_ms ({})",
                reconnect.max_delay_ms, reconnect.base_delay_ms
            )));
        }
        if self.events.channel_capacity == 0 {
            return Err(SessionError::Config(
                "events.channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the reconnect settings
    pub fn with_reconnect(mut self, max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.reconnect = ReconnectConfig {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        };
        self
    }

    /// Set the greeting text
    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.session.greeting = greeting.into();
        self
    }

    /// Set the initial turn detection mode
    pub fn with_turn_detection(mut self, mode: TurnDetectionMode) -> Self {
        self.session.turn_detection = mode;
        self
    }

    /// Set the system instructions
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.session.instructions = Some(instructions.into());
        self
    }

    /// Set the UI event channel capacity
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.events.channel_capacity = capacity;
        self
    }
}
