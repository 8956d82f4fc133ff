//! Configuration module for the remote call server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.
//!
//! Besides the flags, the server accepts positional `key=value` settings.
//! Only `port=<n>` is understood. Anything else, including flags clap does
//! not know, is collected so it can be reported once logging is up.

use clap::{Command, CommandFactory, Parser};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Port used when neither the command line nor the config file names one.
pub const DEFAULT_PORT: u16 = 33744;

/// Command-line arguments for the remote call server
#[derive(Parser, Debug)]
#[command(name = "remotecall-server")]
#[command(author = "remotecall-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Accepts one remote call and traces it", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Give up waiting for a client after this many seconds
    #[arg(long)]
    pub accept_timeout: Option<u64>,

    /// Seconds to wait after the call so trace data can be flushed
    #[arg(long)]
    pub flush_delay: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Settings of the form key=value (e.g., port=33744)
    pub settings: Vec<String>,

    /// Hyphenated arguments that match none of the flags above
    #[arg(skip)]
    pub unknown_flags: Vec<String>,
}

impl CliArgs {
    /// Parse arguments, setting aside unrecognized flags instead of failing.
    pub fn try_parse_lenient<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut command = Self::command();
        command.build();

        let (known, unknown_flags) = split_unknown_flags(&command, args);
        let mut cli = Self::try_parse_from(known)?;
        cli.unknown_flags = unknown_flags;
        Ok(cli)
    }
}

/// Separate arguments `command` accepts from hyphenated ones it does not.
fn split_unknown_flags<I, T>(command: &Command, args: I) -> (Vec<String>, Vec<String>)
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    let mut args = args.into_iter().map(Into::into);
    let mut known: Vec<String> = args.next().into_iter().collect();
    let mut unknown = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--" {
            known.push(arg);
            known.extend(args.by_ref());
            break;
        }
        if !arg.starts_with('-') || arg == "-" {
            known.push(arg);
            continue;
        }
        match lookup_flag(command, &arg) {
            Some(FlagMatch { needs_next }) => {
                known.push(arg);
                if needs_next {
                    known.extend(args.next());
                }
            }
            None => unknown.push(arg),
        }
    }

    (known, unknown)
}

struct FlagMatch {
    /// The flag's value is the following argument
    needs_next: bool,
}

fn lookup_flag(command: &Command, arg: &str) -> Option<FlagMatch> {
    if let Some(long) = arg.strip_prefix("--") {
        let (name, inline) = match long.split_once('=') {
            Some((name, _)) => (name, true),
            None => (long, false),
        };
        let flag = command.get_arguments().find(|a| a.get_long() == Some(name))?;
        let takes_value = flag.get_action().takes_values();
        if inline && !takes_value {
            return None;
        }
        return Some(FlagMatch {
            needs_next: takes_value && !inline,
        });
    }

    let mut chars = arg[1..].chars();
    let short = chars.next()?;
    let attached = chars.as_str();
    let flag = command.get_arguments().find(|a| a.get_short() == Some(short))?;
    let takes_value = flag.get_action().takes_values();
    if !attached.is_empty() && !takes_value {
        return None;
    }
    Some(FlagMatch {
        needs_next: takes_value && attached.is_empty(),
    })
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accept timeout in seconds, waits forever when absent
    pub accept_timeout: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            accept_timeout: None,
        }
    }
}

/// Tracing collaborator configuration
#[derive(Debug, Deserialize)]
pub struct TracingConfig {
    /// Whether remote calls are traced at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Delay before exit in seconds
    #[serde(default = "default_flush_delay")]
    pub flush_delay: u64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            flush_delay: default_flush_delay(),
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_enabled() -> bool {
    true
}

fn default_flush_delay() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub accept_timeout: Option<Duration>,
    pub flush_delay: Duration,
    pub tracing_enabled: bool,
    pub log_level: String,
    /// Arguments that were not recognized, unknown flags first.
    pub unknown_args: Vec<String>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let args = std::env::args_os().map(|arg| arg.to_string_lossy().into_owned());
        let cli = CliArgs::try_parse_lenient(args).unwrap_or_else(|e| e.exit());
        Self::resolve(cli)
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut port = toml_config.server.port;
        let mut unknown_args = cli.unknown_flags;
        for setting in cli.settings {
            if let Some(value) = setting.strip_prefix("port=") {
                port = parse_port(value)?;
            } else {
                unknown_args.push(setting);
            }
        }
        if port == 0 {
            return Err(ConfigError::InvalidPort(port.to_string()));
        }

        let host = cli.host.unwrap_or(toml_config.server.host);
        let host = host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidHost(host))?;

        Ok(Config {
            host,
            port,
            accept_timeout: cli
                .accept_timeout
                .or(toml_config.server.accept_timeout)
                .map(Duration::from_secs),
            flush_delay: Duration::from_secs(
                cli.flush_delay.unwrap_or(toml_config.tracing.flush_delay),
            ),
            tracing_enabled: toml_config.tracing.enabled,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            unknown_args,
        })
    }

    /// Socket address the server listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(value.to_string())),
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidPort(String),
    InvalidHost(String),
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
            ConfigError::InvalidPort(value) => {
                write!(f, "Invalid port '{}': expected an integer in 1..=65535", value)
            }
            ConfigError::InvalidHost(value) => {
                write!(f, "Invalid host '{}': expected an IP address", value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
