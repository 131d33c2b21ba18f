//! Configuration management for mylogd.
//!
//! Uses figment to merge configuration from multiple sources:
//! 1. Default values
//! 2. Config file (TOML)
//! 3. Environment variables
//! 4. Command-line arguments

use clap::ValueEnum;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use mylog_protocol::{DEFAULT_LOG_FILE, Transport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Log sink configuration
    #[serde(default)]
    pub sink: SinkConfig,
}

/// Listener and receive-loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Unix socket path
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,

    /// Socket type (datagram or stream)
    #[serde(default)]
    pub transport: Transport,

    /// Permission bits applied to the socket file
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How received messages are handed to the sink
    #[serde(default)]
    pub dispatch: DispatchMode,

    /// Upper bound on deliveries in flight (worker dispatch only)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Give up waiting for a message after this many milliseconds
    #[serde(default)]
    pub receive_timeout_ms: Option<u64>,
}

/// Log sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Target log file
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Mirror every record to standard output
    #[serde(default = "default_true")]
    pub echo: bool,

    /// Flush each record to storage before reporting success
    #[serde(default = "default_true")]
    pub sync: bool,
}

/// Dispatch model for received messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Receive, persist, then receive the next one
    Sequential,
    /// Persist each message on its own task
    #[default]
    Worker,
}

fn default_socket_path() -> PathBuf {
    mylog_protocol::get_socket_path()
}

fn default_socket_mode() -> u32 {
    0o666
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_in_flight() -> usize {
    64
}

fn default_log_file() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_FILE)
}

fn default_true() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: default_socket_path(),
            transport: Transport::default(),
            socket_mode: default_socket_mode(),
            log_level: default_log_level(),
            dispatch: DispatchMode::default(),
            max_in_flight: default_max_in_flight(),
            receive_timeout_ms: None,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
            echo: true,
            sync: true,
        }
    }
}

impl DaemonConfig {
    /// Receive timeout as a duration, if one is configured
    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_file: Option<&PathBuf>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Add config file if provided
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        } else {
            // Try default config locations
            let default_paths = [
                PathBuf::from("/etc/mylogd/config.toml"),
                dirs::config_dir()
                    .unwrap_or_default()
                    .join("mylogd/config.toml"),
            ];

            for path in &default_paths {
                if path.exists() {
                    figment = figment.merge(Toml::file(path));
                    break;
                }
            }
        }

        // Environment variables (MYLOGD_ prefix, `__` separates sections)
        figment = figment.merge(Env::prefixed("MYLOGD_").split("__"));

        figment.extract()
    }

    /// Override socket path from CLI
    pub fn with_socket(mut self, socket: Option<PathBuf>) -> Self {
        if let Some(s) = socket {
            self.daemon.socket = s;
        }
        self
    }

    /// Override transport from CLI
    pub fn with_transport(mut self, transport: Option<Transport>) -> Self {
        if let Some(t) = transport {
            self.daemon.transport = t;
        }
        self
    }

    /// Override log level from CLI
    pub fn with_log_level(mut self, log_level: Option<String>) -> Self {
        if let Some(level) = log_level {
            self.daemon.log_level = level;
        }
        self
    }

    /// Override target log file from CLI
    pub fn with_log_file(mut self, log_file: Option<PathBuf>) -> Self {
        if let Some(f) = log_file {
            self.sink.log_file = f;
        }
        self
    }

    /// Override dispatch mode from CLI
    pub fn with_dispatch(mut self, dispatch: Option<DispatchMode>) -> Self {
        if let Some(d) = dispatch {
            self.daemon.dispatch = d;
        }
        self
    }

    /// Override receive timeout from CLI
    pub fn with_receive_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        if timeout_ms.is_some() {
            self.daemon.receive_timeout_ms = timeout_ms;
        }
        self
    }
}
