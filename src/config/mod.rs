//! # Configuration Management Module
//!
//! Strongly typed relay configuration loaded from TOML. Every option the relay
//! engine reads lives here with an explicit default, so the rest of the crate
//! never touches untyped maps.
//!
//! ## Configuration Structure
//!
//! - [`MatrixConfig`] - chat side identity and chat-bound prefix
//! - [`RoomMapping`] - radio channel index to Matrix room links
//! - [`MeshtasticConfig`] - radio connection, relay toggles, radio-bound prefix
//! - [`DatabaseConfig`] - identity map retention
//! - [`LoggingConfig`] - log level and optional log file
//! - [`PluginConfig`] - per-plugin activation and priority
//!
//! ## Configuration File Format
//!
//! ```toml
//! [matrix]
//! homeserver = "https://matrix.example.org"
//! bot_user_id = "@relay:example.org"
//!
//! [[matrix_rooms]]
//! id = "!abcdef:example.org"
//! meshtastic_channel = 0
//!
//! [meshtastic]
//! connection_type = "tcp"
//! host = "meshtastic.local"
//! meshnet_name = "Downtown"
//!
//! [meshtastic.message_interactions]
//! reactions = true
//! replies = true
//!
//! [database.msg_map]
//! msgs_to_keep = 500
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

/// Radio firmware rejects text sends spaced closer than this.
pub const MINIMUM_MESSAGE_DELAY_SECS: f64 = 2.0;
pub const DEFAULT_MESSAGE_DELAY_SECS: f64 = 2.2;
pub const DEFAULT_MESSAGE_TRUNCATE_BYTES: usize = 227;
pub const DEFAULT_MSGS_TO_KEEP: usize = 500;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_BACKOFF_SECS: u64 = 10;
pub const DEFAULT_PLUGIN_PRIORITY: i32 = 10;
pub const MAX_MESSAGE_DELAY_SECS: f64 = 3600.0;
/// Upper bound for heartbeat and reconnect backoff intervals (one day).
pub const MAX_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("meshtastic.meshnet_name must not be empty")]
    EmptyMeshnetName,
    #[error("connection_type {0} requires meshtastic.{1} to be set")]
    MissingConnectionTarget(&'static str, &'static str),
    #[error("matrix room {0} is listed more than once")]
    DuplicateRoom(String),
    #[error("matrix room id must not be empty")]
    EmptyRoomId,
    #[error("meshtastic.health_check.heartbeat_interval must be greater than zero")]
    ZeroHeartbeat,
    #[error("meshtastic.reconnect.backoff_seconds must be greater than zero")]
    ZeroBackoff,
    #[error("meshtastic.message_delay must be a finite number of seconds up to 3600, got {0}")]
    InvalidDelay(String),
    #[error("meshtastic.health_check.heartbeat_interval must be at most {MAX_INTERVAL_SECS}s, got {0}")]
    HeartbeatTooLong(u64),
    #[error("meshtastic.reconnect.backoff_seconds must be at most {MAX_INTERVAL_SECS}s, got {0}")]
    BackoffTooLong(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub matrix_rooms: Vec<RoomMapping>,
    pub meshtastic: MeshtasticConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub plugins: HashMap<String, PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub homeserver: String,
    pub bot_user_id: String,
    /// Prefix Meshtastic-origin messages in Matrix with sender and meshnet.
    #[serde(default = "default_true")]
    pub prefix_enabled: bool,
    /// Chat-bound prefix template, e.g. `"[{long}/{mesh}]: "`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_format: Option<String>,
}

/// Links one radio channel index to one Matrix room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMapping {
    pub id: String,
    pub meshtastic_channel: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Serial,
    /// `network` is the legacy spelling still found in older configs.
    #[serde(alias = "network")]
    Tcp,
    Ble,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Serial => "serial",
            ConnectionType::Tcp => "tcp",
            ConnectionType::Ble => "ble",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshtasticConfig {
    pub connection_type: ConnectionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ble_address: Option<String>,
    /// Name of the meshnet this relay belongs to; recorded as message origin.
    pub meshnet_name: String,
    /// Relay Matrix messages out to the radio channel.
    #[serde(default = "default_true")]
    pub broadcast_enabled: bool,
    /// Relay DETECTION_SENSOR_APP packets in both directions.
    #[serde(default = "default_true")]
    pub detection_sensor: bool,
    /// Seconds between radio sends. Values below 2.0 are raised to 2.0.
    #[serde(default = "default_message_delay")]
    pub message_delay: f64,
    #[serde(default = "default_true")]
    pub prefix_enabled: bool,
    /// Radio-bound prefix template, e.g. `"{display5}[M]: "`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_format: Option<String>,
    /// Byte budget for text sent to the radio.
    #[serde(default = "default_truncate_bytes")]
    pub message_truncate_bytes: usize,
    #[serde(default)]
    pub message_interactions: InteractionConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct InteractionConfig {
    #[serde(default)]
    pub reactions: bool,
    #[serde(default)]
    pub replies: bool,
}

impl InteractionConfig {
    /// Identity mappings are only recorded when something will read them.
    pub fn storage_enabled(&self) -> bool {
        self.reactions || self.replies
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between transport health probes.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Fixed wait before each reconnect attempt.
    #[serde(default = "default_backoff")]
    pub backoff_seconds: u64,
    /// Connect attempts before giving up; 0 retries forever.
    #[serde(default)]
    pub retry_limit: u32,
    /// Upper bound on closing the transport during shutdown.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_seconds: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_seconds: DEFAULT_BACKOFF_SECS,
            retry_limit: 0,
            close_timeout_seconds: default_close_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default)]
    pub msg_map: MsgMapConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            msg_map: MsgMapConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgMapConfig {
    /// Identity-map rows kept after each insert; 0 disables pruning.
    #[serde(default = "default_msgs_to_keep")]
    pub msgs_to_keep: usize,
    /// Clear the identity map at startup and at clean shutdown.
    #[serde(default)]
    pub wipe_on_restart: bool,
}

impl Default for MsgMapConfig {
    fn default() -> Self {
        Self {
            msgs_to_keep: DEFAULT_MSGS_TO_KEEP,
            wipe_on_restart: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PluginConfig {
    #[serde(default)]
    pub active: bool,
    /// Lower runs first. Overrides the plugin's own default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Radio channels the plugin answers on; empty means all mapped channels.
    #[serde(default)]
    pub channels: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_data_rows_per_node: Option<usize>,
}

fn default_true() -> bool {
    true
}
fn default_message_delay() -> f64 {
    DEFAULT_MESSAGE_DELAY_SECS
}
fn default_truncate_bytes() -> usize {
    DEFAULT_MESSAGE_TRUNCATE_BYTES
}
fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_backoff() -> u64 {
    DEFAULT_BACKOFF_SECS
}
fn default_close_timeout() -> u64 {
    10
}
fn default_db_path() -> String {
    "./data/meshrelay.db".to_string()
}
fn default_msgs_to_keep() -> usize {
    DEFAULT_MSGS_TO_KEEP
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;
        Self::from_toml_str(&content).map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject configurations the relay cannot run with. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.meshtastic;
        if m.meshnet_name.trim().is_empty() {
            return Err(ConfigError::EmptyMeshnetName);
        }
        let blank = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or("").is_empty();
        match m.connection_type {
            ConnectionType::Serial if blank(&m.serial_port) => {
                return Err(ConfigError::MissingConnectionTarget("serial", "serial_port"))
            }
            ConnectionType::Tcp if blank(&m.host) => {
                return Err(ConfigError::MissingConnectionTarget("tcp", "host"))
            }
            ConnectionType::Ble if blank(&m.ble_address) => {
                return Err(ConfigError::MissingConnectionTarget("ble", "ble_address"))
            }
            _ => {}
        }
        if !m.message_delay.is_finite() || m.message_delay > MAX_MESSAGE_DELAY_SECS {
            return Err(ConfigError::InvalidDelay(m.message_delay.to_string()));
        }
        if m.health_check.heartbeat_interval == 0 {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if m.health_check.heartbeat_interval > MAX_INTERVAL_SECS {
            return Err(ConfigError::HeartbeatTooLong(m.health_check.heartbeat_interval));
        }
        if m.reconnect.backoff_seconds == 0 {
            return Err(ConfigError::ZeroBackoff);
        }
        if m.reconnect.backoff_seconds > MAX_INTERVAL_SECS {
            return Err(ConfigError::BackoffTooLong(m.reconnect.backoff_seconds));
        }
        let mut seen = HashSet::new();
        for room in &self.matrix_rooms {
            if room.id.trim().is_empty() {
                return Err(ConfigError::EmptyRoomId);
            }
            if !seen.insert(room.id.as_str()) {
                return Err(ConfigError::DuplicateRoom(room.id.clone()));
            }
        }
        Ok(())
    }

    pub fn meshnet_name(&self) -> &str {
        &self.meshtastic.meshnet_name
    }

    pub fn interactions(&self) -> InteractionConfig {
        self.meshtastic.message_interactions
    }

    /// Rooms fed by a radio channel. A channel may feed several rooms.
    pub fn rooms_for_channel(&self, channel: u32) -> impl Iterator<Item = &RoomMapping> {
        self.matrix_rooms
            .iter()
            .filter(move |r| r.meshtastic_channel == channel)
    }

    pub fn channel_is_mapped(&self, channel: u32) -> bool {
        self.rooms_for_channel(channel).next().is_some()
    }

    pub fn room(&self, room_id: &str) -> Option<&RoomMapping> {
        self.matrix_rooms.iter().find(|r| r.id == room_id)
    }

    /// Requested inter-send delay; the queue applies the 2.0s floor itself.
    pub fn message_delay(&self) -> f64 {
        self.meshtastic.message_delay
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.meshtastic.health_check.heartbeat_interval)
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins.get(name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            matrix: MatrixConfig {
                homeserver: "https://matrix.example.org".to_string(),
                bot_user_id: "@meshrelay:example.org".to_string(),
                prefix_enabled: true,
                prefix_format: None,
            },
            matrix_rooms: vec![RoomMapping {
                id: "!roomid:example.org".to_string(),
                meshtastic_channel: 0,
            }],
            meshtastic: MeshtasticConfig {
                connection_type: ConnectionType::Serial,
                serial_port: Some("/dev/ttyUSB0".to_string()),
                host: None,
                ble_address: None,
                meshnet_name: "Your Meshnet".to_string(),
                broadcast_enabled: true,
                detection_sensor: true,
                message_delay: DEFAULT_MESSAGE_DELAY_SECS,
                prefix_enabled: true,
                prefix_format: None,
                message_truncate_bytes: DEFAULT_MESSAGE_TRUNCATE_BYTES,
                message_interactions: InteractionConfig::default(),
                health_check: HealthCheckConfig::default(),
                reconnect: ReconnectConfig::default(),
            },
            database: DatabaseConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("meshrelay.log".to_string()),
            },
            plugins: HashMap::new(),
        }
    }
}
