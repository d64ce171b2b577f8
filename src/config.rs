//! Configuration for the framelink binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::client::ClientConfig;
use crate::server::ServerConfig;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which side of the connection the binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Accept connections and echo user messages back
    Server,
    /// Connect, send stdin lines and print replies
    Client,
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "framelink")]
#[command(version)]
#[command(about = "Length-prefixed TCP framing with pooled connections and heartbeats", long_about = None)]
pub struct CliArgs {
    /// Run as server or client
    #[arg(value_enum, default_value = "server")]
    pub mode: Mode,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind (server) or connect to (client); 0.0.0.0 binds all interfaces
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum concurrent connections (pool size)
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Per-connection buffer size in bytes; also the largest frame accepted
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    pub heartbeat_interval_ms: Option<u64>,

    /// Heartbeat lifetime in milliseconds
    #[arg(long)]
    pub heartbeat_lifetime_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
        }
    }
}

/// Per-connection settings
#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

/// Heartbeat settings
#[derive(Debug, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_lifetime_ms")]
    pub lifetime_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            lifetime_ms: default_lifetime_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7000
}

fn default_backlog() -> u32 {
    100
}

fn default_max_connections() -> usize {
    1000
}

fn default_buffer_size() -> usize {
    4096
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_lifetime_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_lifetime: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::from_parts(cli, toml_config)
    }

    /// Merge parsed CLI args over a parsed TOML file and validate the result.
    pub fn from_parts(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            mode: cli.mode,
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.connection.buffer_size),
            heartbeat_interval: Duration::from_millis(
                cli.heartbeat_interval_ms
                    .unwrap_or(toml_config.heartbeat.interval_ms),
            ),
            heartbeat_lifetime: Duration::from_millis(
                cli.heartbeat_lifetime_ms
                    .unwrap_or(toml_config.heartbeat.lifetime_ms),
            ),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        match config.mode {
            Mode::Server => config.server_config().validate()?,
            Mode::Client => config.client_config().validate()?,
        }
        Ok(config)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            backlog: self.backlog,
            max_connections: self.max_connections,
            buffer_size: self.buffer_size,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_lifetime: self.heartbeat_lifetime,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            port: self.port,
            buffer_size: self.buffer_size,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_lifetime: self.heartbeat_lifetime,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
