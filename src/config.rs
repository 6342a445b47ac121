//! Configuration module for coop-frame-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::HEADER_LEN;
use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the frame server
#[derive(Parser, Debug)]
#[command(name = "coop-frame-server")]
#[command(version = "0.1.0")]
#[command(about = "Single-threaded cooperative framed request/response server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Largest accepted payload in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Append logs to this file instead of stdout
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[server]` section
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Upper bound on one readiness wait, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_frame_size: default_max_frame_size(),
            max_sessions: default_max_sessions(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// `[logging]` section
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Size in bytes at which the log file is rotated
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Rotated files kept next to the active one
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            max_file_size: default_max_file_size(),
            max_files: default_max_files(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9999
}

fn default_backlog() -> i32 {
    128
}

fn default_max_frame_size() -> usize {
    (10 << 20) - HEADER_LEN // 10 MiB receive buffer holds header + payload
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_file_size() -> u64 {
    100 << 20 // 100 MiB
}

fn default_max_files() -> usize {
    3
}

/// Resolved listener and session settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub max_frame_size: usize,
    pub max_sessions: usize,
    pub poll_interval: Duration,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerSection::default().into()
    }
}

impl From<ServerSection> for ServerConfig {
    fn from(section: ServerSection) -> Self {
        Self {
            host: section.host,
            port: section.port,
            backlog: section.backlog,
            max_frame_size: section.max_frame_size,
            max_sessions: section.max_sessions,
            poll_interval: Duration::from_millis(section.poll_interval_ms),
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
    pub max_file_size: u64,
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            max_file_size: default_max_file_size(),
            max_files: default_max_files(),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut server = ServerConfig::from(toml_config.server);
        if let Some(host) = cli.host {
            server.host = host;
        }
        if let Some(port) = cli.port {
            server.port = port;
        }
        if let Some(max_frame_size) = cli.max_frame_size {
            server.max_frame_size = max_frame_size;
        }
        if let Some(max_sessions) = cli.max_sessions {
            server.max_sessions = max_sessions;
        }
        // Fail at startup rather than at bind time.
        server.listen_addr()?;

        let logging = LoggingConfig {
            level: cli.log_level.unwrap_or(toml_config.logging.level),
            file: cli.log_file.or(toml_config.logging.file),
            max_file_size: toml_config.logging.max_file_size,
            max_files: toml_config.logging.max_files,
        };

        Ok(Config { server, logging })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidAddress(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidAddress(host) => {
                write!(f, "Invalid listen address '{}'", host)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.max_frame_size, 10 * 1024 * 1024 - 12);
        assert_eq!(config.server.poll_interval, Duration::from_millis(10));
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
        assert_eq!(config.logging.max_file_size, 100 * 1024 * 1024);
        assert_eq!(config.logging.max_files, 3);
        assert_eq!(
            config.server.listen_addr().unwrap(),
            "0.0.0.0:9999".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 7000
            max_sessions = 16
            poll_interval_ms = 5

            [logging]
            level = "debug"
            file = "/tmp/server.log"
            max_file_size = 4096
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.max_sessions, 16);
        assert_eq!(config.server.poll_interval_ms, 5);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/server.log")));
        assert_eq!(config.logging.max_file_size, 4096);
        assert_eq!(config.logging.max_files, 3);
    }

    #[test]
    fn test_cli_overrides_file() {
        let path = std::env::temp_dir().join(format!("coop-frame-config-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[server]\nport = 7000\nmax_sessions = 16\n[logging]\nlevel = \"warn\"").unwrap();

        let cli = CliArgs::parse_from([
            "coop-frame-server",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "8000",
            "--log-level",
            "trace",
        ]);
        let config = Config::from_args(cli).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.max_sessions, 16);
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_invalid_host_rejected() {
        let cli = CliArgs::parse_from(["coop-frame-server", "--host", "not-an-ip"]);
        match Config::from_args(cli) {
            Err(ConfigError::InvalidAddress(host)) => assert_eq!(host, "not-an-ip"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::parse_from(["coop-frame-server", "--config", "/nonexistent/coop.toml"]);
        assert!(matches!(Config::from_args(cli), Err(ConfigError::FileRead(..))));
    }
}
