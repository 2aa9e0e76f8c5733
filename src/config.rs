//! Runtime configuration
//!
//! Values come from the environment first and can be overridden by the
//! binary's command line flags.

use std::env;

use thiserror::Error;

/// Default rendezvous server host
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default rendezvous server port
pub const DEFAULT_SERVER_PORT: u16 = 9988;

/// Default public STUN server used for server-reflexive candidates
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("invalid server address '{0}', expected host:port")]
    InvalidServer(String),
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Rendezvous server host name or address
    pub server_host: String,
    /// Rendezvous server TCP port
    pub server_port: u16,
    /// STUN server (host:port); `None` disables server-reflexive gathering
    pub stun_server: Option<String>,
    /// Offer loopback host candidates (same-machine testing)
    pub include_loopback: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            stun_server: Some(DEFAULT_STUN_SERVER.to_string()),
            include_loopback: false,
        }
    }
}

impl Config {
    /// Load configuration from `LOBBY_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(host) = lookup("LOBBY_SERVER_HOST") {
            config.server_host = host;
        }
        if let Some(port) = lookup("LOBBY_SERVER_PORT") {
            config.server_port = parse_port(&port)?;
        }
        if let Some(stun) = lookup("LOBBY_STUN_SERVER") {
            config.stun_server = if stun.trim().is_empty() { None } else { Some(stun) };
        }
        if let Some(flag) = lookup("LOBBY_INCLUDE_LOOPBACK") {
            config.include_loopback = parse_bool("LOBBY_INCLUDE_LOOPBACK", &flag)?;
        }

        Ok(config)
    }

    /// Override host and port from a `host:port` string
    pub fn set_server(&mut self, server: &str) -> Result<(), ConfigError> {
        let (host, port) = server
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidServer(server.to_string()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidServer(server.to_string()));
        }
        self.server_port = parse_port(port)?;
        self.server_host = host.trim_matches(|c| c == '[' || c == ']').to_string();
        Ok(())
    }

    /// `host:port` form of the rendezvous server address
    pub fn server_address(&self) -> String {
        if self.server_host.contains(':') {
            format!("[{}]:{}", self.server_host, self.server_port)
        } else {
            format!("{}:{}", self.server_host, self.server_port)
        }
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(value.to_string())),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}
