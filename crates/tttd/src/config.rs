//! Process configuration.
//!
//! Values resolve from built-in defaults, then the environment (a `.env`
//! file is loaded into the environment by the binary beforehand), then
//! command-line flags.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::replication::DEFAULT_TOPIC;
use crate::server::TransportKind;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Environment variable names.
pub mod env {
    pub const HOST: &str = "HOST";
    pub const PORT: &str = "PORT";
    pub const REDIS_URL: &str = "REDIS_URL";
    pub const TRANSPORT: &str = "TTT_TRANSPORT";
    pub const TOPIC: &str = "TTT_TOPIC";
    pub const INSTANCE_ID: &str = "TTT_INSTANCE_ID";
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("{0}")]
    InvalidTransport(String),

    #[error("invalid broker {0:?} (expected \"memory\" or a redis:// URL)")]
    InvalidBroker(String),

    #[error("topic must not be empty")]
    EmptyTopic,
}

/// Which broker carries replication traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerConfig {
    /// In-process only; a single server with no peers.
    Memory,
    /// Redis pub/sub at the given URL.
    Redis(String),
}

impl fmt::Display for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Redis(url) => f.write_str(url),
        }
    }
}

impl FromStr for BrokerConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("memory") {
            Ok(Self::Memory)
        } else if s.starts_with("redis://") || s.starts_with("rediss://") {
            Ok(Self::Redis(s.to_string()))
        } else {
            Err(ConfigError::InvalidBroker(s.to_string()))
        }
    }
}

/// Command-line overrides. Every field is optional; unset fields keep the
/// value from the environment or the default.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct CliOverrides {
    /// Address to listen on [env: HOST]
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on [env: PORT]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Session transport: websocket or lines [env: TTT_TRANSPORT]
    #[arg(long, value_parser = parse_transport)]
    pub transport: Option<TransportKind>,

    /// Replication broker: "memory" or a redis:// URL [env: REDIS_URL]
    #[arg(long, value_parser = parse_broker)]
    pub broker: Option<BrokerConfig>,

    /// Pub/sub topic shared by all instances [env: TTT_TOPIC]
    #[arg(long)]
    pub topic: Option<String>,

    /// Identifier for this instance [env: TTT_INSTANCE_ID]
    #[arg(long)]
    pub instance_id: Option<String>,

    /// Shorthand for --transport lines
    #[arg(long, conflicts_with = "transport")]
    pub use_lines: bool,
}

fn parse_transport(s: &str) -> Result<TransportKind, String> {
    s.parse()
}

fn parse_broker(s: &str) -> Result<BrokerConfig, String> {
    s.parse().map_err(|e: ConfigError| e.to_string())
}

/// Resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub broker: BrokerConfig,
    pub topic: String,
    /// Explicit instance id; derived from pid and port when unset.
    pub instance_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            transport: TransportKind::WebSocket,
            broker: BrokerConfig::Redis(DEFAULT_REDIS_URL.to_string()),
            topic: DEFAULT_TOPIC.to_string(),
            instance_id: None,
        }
    }
}

impl Config {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`. Empty values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(host) = get(env::HOST) {
            config.host = host;
        }
        if let Some(port) = get(env::PORT) {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
        }
        if let Some(transport) = get(env::TRANSPORT) {
            config.transport = transport.parse().map_err(ConfigError::InvalidTransport)?;
        }
        if let Some(url) = get(env::REDIS_URL) {
            config.broker = url.parse()?;
        }
        if let Some(topic) = get(env::TOPIC) {
            config.topic = topic;
        }
        config.instance_id = get(env::INSTANCE_ID);

        Ok(config)
    }

    /// Applies command-line overrides.
    pub fn with_overrides(mut self, cli: &CliOverrides) -> Result<Self, ConfigError> {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(transport) = cli.transport {
            self.transport = transport;
        }
        if cli.use_lines {
            self.transport = TransportKind::JsonLines;
        }
        if let Some(broker) = &cli.broker {
            self.broker = broker.clone();
        }
        if let Some(topic) = &cli.topic {
            self.topic = topic.clone();
        }
        if let Some(id) = &cli.instance_id {
            self.instance_id = Some(id.clone());
        }

        if self.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        Ok(self)
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The configured instance id, or `pid:port`.
    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", std::process::id(), self.port))
    }
}
