use crate::Error;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use subpub::DEFAULT_QUEUE_CAPACITY;

const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 50051);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOG_LEVEL: &str = "info";

/// Command-line flags and their environment fallbacks.
///
/// Anything left unset falls back to the settings file, then to the
/// built-in default.
#[derive(Clone, Debug, Default, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// YAML settings file (keys: `grpc_port`, `shutdown_timeout`, `log_level`, `queue_capacity`)
    #[arg(long, env = "SUBPUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the HTTP/WebSocket listener binds to [default: 0.0.0.0:50051]
    #[arg(long, env = "SUBPUB_LISTEN_ADDR")]
    pub listen_addr: Option<SocketAddr>,

    /// Seconds to wait for subscribers to drain on shutdown [default: 5]
    #[arg(long, env = "SUBPUB_SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long, env = "SUBPUB_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Messages buffered per subscription before overflow hand-off [default: 64]
    #[arg(long, env = "SUBPUB_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,
}

/// Settings file layout. Missing or empty keys keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    /// `host:port`, or `:port` for every interface.
    grpc_port: Option<String>,

    /// Human-readable duration such as `5s` or `1m30s`.
    shutdown_timeout: Option<String>,

    log_level: Option<String>,

    queue_capacity: Option<usize>,
}

/// Resolved process configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Address the HTTP/WebSocket listener binds to.
    pub listen_addr: SocketAddr,

    /// How long shutdown waits for the bus to drain.
    pub shutdown_timeout: Duration,

    /// Log level name, see [`crate::logging::parse_level`].
    pub log_level: String,

    /// Messages buffered per subscription before overflow hand-off.
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    /// Reads the configuration from the process arguments and environment,
    /// layered over the settings file when one is given.
    ///
    /// # Errors
    /// Returns an error if the settings file cannot be read or is invalid.
    pub fn load() -> Result<Self, Error> {
        Self::from_args(Args::parse())
    }

    /// Resolves `args` over the settings file they name, if any.
    ///
    /// # Errors
    /// Returns an error if the settings file cannot be read or is invalid.
    pub fn from_args(args: Args) -> Result<Self, Error> {
        let config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        Ok(config.with_overrides(args))
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is invalid.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(Error::ReadConfig)?;

        Self::from_yaml(&contents)
    }

    /// Parses a YAML settings document, applying defaults for missing keys.
    ///
    /// # Errors
    /// Returns an error if the document is malformed or a value is invalid.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let file: Option<FileConfig> =
            serde_yaml::from_str(contents).map_err(Error::ParseConfig)?;
        let file = file.unwrap_or_default();

        let mut config = Self::default();

        if let Some(port) = non_empty(file.grpc_port) {
            config.listen_addr = parse_listen_addr(&port)?;
        }

        if let Some(timeout) = non_empty(file.shutdown_timeout) {
            let timeout = humantime::parse_duration(&timeout)
                .map_err(|e| Error::InvalidConfig(format!("shutdown_timeout: {e}")))?;
            // Zero means unset.
            if !timeout.is_zero() {
                config.shutdown_timeout = timeout;
            }
        }

        if let Some(level) = non_empty(file.log_level) {
            config.log_level = level;
        }

        if let Some(capacity) = file.queue_capacity {
            config.queue_capacity = capacity;
        }

        Ok(config)
    }

    fn with_overrides(mut self, args: Args) -> Self {
        if let Some(listen_addr) = args.listen_addr {
            self.listen_addr = listen_addr;
        }

        if let Some(secs) = args.shutdown_timeout_secs {
            self.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }

        if let Some(queue_capacity) = args.queue_capacity {
            self.queue_capacity = queue_capacity;
        }

        self
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn parse_listen_addr(value: &str) -> Result<SocketAddr, Error> {
    let value = value.trim();
    let addr = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_string()
    };

    addr.parse()
        .map_err(|_| Error::InvalidConfig(format!("grpc_port: invalid address {value:?}")))
}
