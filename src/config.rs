//! Configuration for the echo server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::{AcceptorOptions, BackendKind, ReactorOptions};
use crate::server::ServerOptions;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "tcpkit-server")]
#[command(author = "tcpkit authors")]
#[command(version = "0.1.0")]
#[command(about = "A reactor-based TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (0.0.0.0 for all interfaces)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Readiness backend
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Number of reactor threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum open connections per reactor
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening socket configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of reactor threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Share the port with other listeners even with one worker
    #[serde(default)]
    pub reuse_port: bool,
    #[serde(default = "default_true")]
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            reuse_port: false,
            nodelay: true,
        }
    }
}

/// Event loop configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Bytes read per receive call
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Events returned by one readiness wait at most
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Upper bound on one readiness wait (0 = wait for events only)
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            read_chunk: default_read_chunk(),
            event_capacity: default_event_capacity(),
            poll_timeout_ms: default_poll_timeout_ms(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    1
}

fn default_max_connections() -> usize {
    10_000
}

fn default_backlog() -> i32 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_read_chunk() -> usize {
    1024
}

fn default_event_capacity() -> usize {
    1024
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub workers: usize,
    pub max_connections: usize,
    pub backlog: i32,
    pub reuse_port: bool,
    pub nodelay: bool,
    pub read_chunk: usize,
    pub event_capacity: usize,
    pub poll_timeout_ms: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backend: cli.backend.unwrap_or(toml_config.runtime.backend),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: toml_config.server.backlog,
            reuse_port: toml_config.server.reuse_port,
            nodelay: toml_config.server.nodelay,
            read_chunk: toml_config.runtime.read_chunk,
            event_capacity: toml_config.runtime.event_capacity,
            poll_timeout_ms: toml_config.runtime.poll_timeout_ms,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be in 1..=65535".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.read_chunk == 0 || self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "read_chunk and event_capacity must be non-zero".into(),
            ));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive".into()));
        }
        Ok(())
    }

    /// Server construction options described by this config.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            backend: self.backend,
            workers: self.workers,
            event_capacity: self.event_capacity,
            acceptor: AcceptorOptions {
                backlog: self.backlog,
                reuse_port: self.reuse_port,
                nodelay: self.nodelay,
            },
            reactor: ReactorOptions {
                max_connections: self.max_connections,
                read_chunk: self.read_chunk,
                poll_timeout: match self.poll_timeout_ms {
                    0 => None,
                    ms => Some(Duration::from_millis(ms)),
                },
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> CliArgs {
        CliArgs {
            log_level: "info".to_string(),
            ..CliArgs::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::merge(cli(), TomlConfig::default()).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.backend, BackendKind::Auto);
        assert_eq!(config.workers, 1);
        assert!(!config.reuse_port);
        assert!(!config.server_options().acceptor.reuse_port);
        assert_eq!(config.read_chunk, 1024);
        assert_eq!(config.poll_timeout_ms, 100);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            workers = 4
            reuse_port = true

            [runtime]
            backend = "poll"
            read_chunk = 4096
            poll_timeout_ms = 0

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.host, "0.0.0.0");
        assert_eq!(toml_config.server.port, 9000);
        assert_eq!(toml_config.runtime.backend, BackendKind::Poll);
        assert_eq!(toml_config.server.backlog, 1024);

        let config = Config::merge(cli(), toml_config).unwrap();
        assert_eq!(config.log_level, "debug");
        let options = config.server_options();
        assert_eq!(options.workers, 4);
        assert_eq!(options.reactor.read_chunk, 4096);
        assert_eq!(options.reactor.poll_timeout, None);
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            [runtime]
            backend = "poll"
        "#,
        )
        .unwrap();

        let args = CliArgs::try_parse_from([
            "tcpkit-server",
            "--port",
            "7000",
            "--backend",
            "mio",
            "--host",
            "0.0.0.0",
            "--log-level",
            "warn",
        ])
        .unwrap();

        let config = Config::merge(args, toml_config).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.backend, BackendKind::Mio);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_validation() {
        let toml_config: TomlConfig = toml::from_str("[server]\nport = 0\n").unwrap();
        assert!(matches!(
            Config::merge(cli(), toml_config),
            Err(ConfigError::Invalid(_))
        ));

        let args = CliArgs {
            workers: Some(0),
            ..cli()
        };
        assert!(matches!(
            Config::merge(args, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));

        // Several workers share the port on their own.
        let toml_config: TomlConfig = toml::from_str("[server]\nworkers = 2\n").unwrap();
        assert!(Config::merge(cli(), toml_config).is_ok());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(toml::from_str::<TomlConfig>("[runtime]\nbackend = \"uring\"\n").is_err());
        assert!(CliArgs::try_parse_from(["tcpkit-server", "--backend", "uring"]).is_err());
    }
}
