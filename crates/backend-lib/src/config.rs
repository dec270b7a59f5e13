// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub room: RoomSettings,
    pub matchmaking: MatchmakingSettings,
    pub video: VideoSettings,
    pub logging: LoggingSettings,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Flat-file store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub path: PathBuf,
}

/// Room countdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSettings {
    /// Initial countdown in seconds
    pub countdown_secs: u32,
    /// Seconds added by the one-time extension
    pub extension_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchmakingSettings {
    /// How often the pool is re-scanned for pairs
    pub sweep_interval_secs: u64,
    /// Outbound buffer per WebSocket connection
    pub channel_capacity: usize,
}

/// Video room provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSettings {
    pub api_url: String,
    /// Without a key every room allocation fails and sessions run degraded
    pub api_key: Option<String>,
    pub max_participants: u32,
    pub room_expiry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    /// Emit JSON lines instead of the human-readable format
    pub json: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data"),
        }
    }
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            countdown_secs: 60,
            extension_secs: 60,
        }
    }
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
            channel_capacity: 64,
        }
    }
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.daily.co/v1".to_string(),
            api_key: None,
            max_participants: 2,
            room_expiry_secs: 60 * 60, // 1 hour
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Settings {
    /// Load settings from `config/default.toml` (if present) and `PROTV__*` env vars
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load settings, layering an explicit config file over the defaults
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::with_name("config/default").required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("PROTV")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| anyhow!("Failed to load configuration: {e}"))?
            .try_deserialize()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {e}"))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("server.port must be greater than 0"));
        }
        if self.room.countdown_secs == 0 {
            return Err(anyhow!("room.countdown_secs must be greater than 0"));
        }
        if self.matchmaking.channel_capacity == 0 {
            return Err(anyhow!("matchmaking.channel_capacity must be greater than 0"));
        }
        if self.matchmaking.sweep_interval_secs == 0 {
            return Err(anyhow!("matchmaking.sweep_interval_secs must be greater than 0"));
        }
        if self.video.max_participants != 2 {
            return Err(anyhow!(
                "video.max_participants must be 2, got {}",
                self.video.max_participants
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(anyhow!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                VALID_LOG_LEVELS
            ));
        }
        Ok(())
    }

    /// Socket address the server binds to
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| anyhow!("Invalid bind address: {e}"))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.matchmaking.sweep_interval_secs)
    }
}

#[cfg(test)]
mod config_tests;
