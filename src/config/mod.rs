//! Configuration management

use crate::channel::{ChannelFlags, ChannelOptions};
use crate::crypto::{random_bytes, KEY_LEN};
use crate::protocol::{EVENT_QUEUE_CAPACITY, PULL_BATCH, WRITE_QUEUE_CAPACITY};
use crate::server::PullOptions;
use crate::transport::TransportConfig;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

fn decode_secret(secret: &str) -> Result<Vec<u8>, crate::Error> {
    if secret.is_empty() {
        return Err(crate::Error::Config("secret is not set".to_string()));
    }
    BASE64
        .decode(secret.trim())
        .map_err(|e| crate::Error::Config(format!("Invalid secret: {}", e)))
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Shared tunnel secret (base64)
    pub secret: String,
    /// Users allowed to authenticate; empty allows everyone
    pub allowed_users: Vec<String>,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Pull request window in seconds
    pub pull_window_secs: u64,
    /// Events drained per pull iteration
    pub pull_batch: usize,
    /// Wait per peek in milliseconds
    pub pull_peek_timeout_ms: u64,
    /// Per-connection event queue capacity
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7700".to_string(),
            secret: String::new(),
            allowed_users: Vec::new(),
            max_connections: 1000,
            pull_window_secs: 10,
            pull_batch: PULL_BATCH,
            pull_peek_timeout_ms: 50,
            queue_capacity: EVENT_QUEUE_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn secret_bytes(&self) -> Result<Vec<u8>, crate::Error> {
        decode_secret(&self.secret)
    }

    pub fn pull_options(&self) -> PullOptions {
        PullOptions {
            window: Duration::from_secs(self.pull_window_secs),
            batch: self.pull_batch.max(1),
            peek_timeout: Duration::from_millis(self.pull_peek_timeout_ms),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address
    pub server: String,
    /// User announced in auth frames
    pub user: String,
    /// Shared tunnel secret (base64)
    pub secret: String,
    /// Number of channels in the pool
    pub channels: usize,
    /// Drive I/O through single request/response round trips
    pub direct_io: bool,
    /// Prepend an auth frame to every write batch
    pub write_join_auth: bool,
    /// Prepend an auth frame to the first batch of each connection
    pub open_join_auth: bool,
    /// Send heartbeats while sessions exist
    pub heartbeat: bool,
    pub heartbeat_interval_secs: u64,
    pub connect_timeout_secs: u64,
    /// Also bounds the wait for the server's auth verdict
    pub read_timeout_secs: u64,
    pub write_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:7700".to_string(),
            user: "default".to_string(),
            secret: String::new(),
            channels: 2,
            direct_io: false,
            write_join_auth: false,
            open_join_auth: true,
            heartbeat: true,
            heartbeat_interval_secs: 5,
            connect_timeout_secs: 10,
            read_timeout_secs: 15,
            write_queue_capacity: WRITE_QUEUE_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn secret_bytes(&self) -> Result<Vec<u8>, crate::Error> {
        decode_secret(&self.secret)
    }

    /// Options of the channel at `index` in the pool
    pub fn channel_options(&self, index: i64) -> ChannelOptions {
        ChannelOptions {
            user: self.user.clone(),
            flags: ChannelFlags {
                direct_io: self.direct_io,
                write_join_auth: self.write_join_auth,
                open_join_auth: self.open_join_auth,
                heartbeat: self.heartbeat,
            },
            write_queue_capacity: self.write_queue_capacity.max(1),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            ..ChannelOptions::new(self.server.clone(), index)
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.connect_timeout_secs,
            read_timeout: self.read_timeout_secs,
            ..TransportConfig::default()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Filter directive to log with; a command line level wins over `level`
    pub fn filter<'a>(&'a self, cli_level: Option<&'a str>) -> &'a str {
        cli_level.unwrap_or(self.level.as_str())
    }
}

/// Generate a fresh base64 tunnel secret
pub fn generate_secret() -> Result<String, crate::Error> {
    let mut secret = [0u8; KEY_LEN];
    random_bytes(&mut secret)?;
    Ok(BASE64.encode(secret))
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}
