//! Configuration module for the SCGI gateway.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::ReactorConfig;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the gateway
#[derive(Parser, Debug, Default)]
#[command(name = "scgi-gateway")]
#[command(version)]
#[command(about = "Serve an application handler over SCGI", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Inactivity timeout in seconds
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Maximum number of concurrent connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Read size for streamed response bodies, in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Maximum header block plus body size, in bytes
    #[arg(long)]
    pub max_request_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Inactivity timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Events handled per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            timeout: default_timeout(),
            max_connections: default_max_connections(),
            batch_size: default_batch_size(),
        }
    }
}

/// Framing limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_request_size: default_max_request_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Longest accepted inactivity timeout: one day.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

fn default_listen() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_timeout() -> u64 {
    5
}

fn default_max_connections() -> usize {
    1024
}

fn default_batch_size() -> usize {
    256
}

fn default_chunk_size() -> usize {
    1024
}

fn default_max_request_size() -> usize {
    16 * 1024 * 1024 // 16 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen: String,
    pub timeout: u64,
    pub max_connections: usize,
    pub batch_size: usize,
    pub chunk_size: usize,
    pub max_request_size: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = match cli.config {
            Some(ref path) => Self::read_file(path)?,
            None => TomlConfig::default(),
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Read and parse a TOML configuration file.
    pub fn read_file(path: &Path) -> Result<TomlConfig, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            timeout: cli.timeout.unwrap_or(toml_config.server.timeout),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            batch_size: toml_config.server.batch_size,
            chunk_size: cli.chunk_size.unwrap_or(toml_config.protocol.chunk_size),
            max_request_size: cli
                .max_request_size
                .unwrap_or(toml_config.protocol.max_request_size),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Validate and convert into the reactor's typed settings.
    pub fn reactor_config(&self) -> Result<ReactorConfig, ConfigError> {
        let listen: SocketAddr = self
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(self.listen.clone()))?;

        if self.timeout > MAX_TIMEOUT_SECS {
            return Err(ConfigError::InvalidValue {
                name: "timeout",
                reason: "must be at most 86400 seconds",
            });
        }

        for (name, value) in [
            ("timeout", self.timeout as usize),
            ("max_connections", self.max_connections),
            ("chunk_size", self.chunk_size),
            ("batch_size", self.batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name,
                    reason: "must be greater than zero",
                });
            }
        }

        Ok(ReactorConfig {
            listen,
            timeout: Duration::from_secs(self.timeout),
            chunk_size: self.chunk_size,
            max_connections: self.max_connections,
            max_request_size: self.max_request_size,
            batch_size: self.batch_size,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::merge(CliArgs::default(), TomlConfig::default());
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.timeout, 5);
        assert_eq!(config.max_connections, 1024);
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.max_request_size, 16 * 1024 * 1024);
        assert_eq!(config.log_level, "info");

        let reactor = config.reactor_config().unwrap();
        assert_eq!(reactor.timeout, Duration::from_secs(5));
        assert_eq!(reactor.listen, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:4000"
            timeout = 30
            max_connections = 64

            [protocol]
            chunk_size = 8192

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:4000");
        assert_eq!(config.server.timeout, 30);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.batch_size, 256);
        assert_eq!(config.protocol.chunk_size, 8192);
        assert_eq!(config.protocol.max_request_size, 16 * 1024 * 1024);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_takes_precedence() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:4000"
            timeout = 30

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();
        let cli = CliArgs {
            timeout: Some(2),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };

        let config = Config::merge(cli, file);
        assert_eq!(config.listen, "0.0.0.0:4000");
        assert_eq!(config.timeout, 2);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_cli_parsing() {
        let cli = CliArgs::try_parse_from([
            "scgi-gateway",
            "-l",
            "127.0.0.1:7000",
            "-t",
            "9",
            "--chunk-size",
            "512",
        ])
        .unwrap();
        assert_eq!(cli.listen.as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(cli.timeout, Some(9));
        assert_eq!(cli.chunk_size, Some(512));
        assert_eq!(cli.max_connections, None);
    }

    #[test]
    fn test_read_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nlisten = \"127.0.0.1:9100\"").unwrap();

        let config = Config::read_file(file.path()).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9100");
        assert_eq!(config.server.timeout, 5);
    }

    #[test]
    fn test_read_file_errors() {
        let missing = Path::new("/nonexistent/scgi-gateway.toml");
        assert!(matches!(
            Config::read_file(missing),
            Err(ConfigError::FileRead(..))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nlisten = ").unwrap();
        assert!(matches!(
            Config::read_file(file.path()),
            Err(ConfigError::TomlParse(..))
        ));
    }

    #[test]
    fn test_error_messages() {
        let missing = Path::new("/nonexistent/scgi-gateway.toml");
        let err = Config::read_file(missing).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with(
            "Failed to read config file '/nonexistent/scgi-gateway.toml': "
        ));
        assert!(std::error::Error::source(&err).is_some());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nlisten = ").unwrap();
        let err = Config::read_file(file.path()).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse config file '"));

        assert_eq!(
            ConfigError::InvalidListen("nope".to_string()).to_string(),
            "Invalid listen address 'nope'"
        );
    }

    #[test]
    fn test_invalid_values() {
        let mut config = Config::merge(CliArgs::default(), TomlConfig::default());
        config.listen = "localhost".to_string();
        assert!(matches!(
            config.reactor_config(),
            Err(ConfigError::InvalidListen(ref s)) if s == "localhost"
        ));

        let mut config = Config::merge(CliArgs::default(), TomlConfig::default());
        config.timeout = 0;
        match config.reactor_config() {
            Err(ConfigError::InvalidValue { name, .. }) => assert_eq!(name, "timeout"),
            other => panic!("unexpected: {:?}", other),
        }

        let cli = CliArgs {
            timeout: Some(u64::MAX),
            ..Default::default()
        };
        match Config::merge(cli, TomlConfig::default()).reactor_config() {
            Err(ConfigError::InvalidValue { name, reason }) => {
                assert_eq!(name, "timeout");
                assert!(reason.contains("at most"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        let mut config = Config::merge(CliArgs::default(), TomlConfig::default());
        config.timeout = MAX_TIMEOUT_SECS;
        assert_eq!(
            config.reactor_config().unwrap().timeout,
            Duration::from_secs(MAX_TIMEOUT_SECS)
        );

        let mut config = Config::merge(CliArgs::default(), TomlConfig::default());
        config.chunk_size = 0;
        assert!(matches!(
            config.reactor_config(),
            Err(ConfigError::InvalidValue { name: "chunk_size", .. })
        ));
    }
}
