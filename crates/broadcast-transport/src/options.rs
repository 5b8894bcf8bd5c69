//! Broker connection options.
//!
//! Host and port defaults can be taken from the environment
//! (`SYSBROADCAST_REDIS_HOST`, `SYSBROADCAST_REDIS_PORT`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::traits::TransportError;

/// Default broker port.
pub const DEFAULT_PORT: u16 = 6379;

/// Default connection scheme.
pub const DEFAULT_SCHEME: &str = "tcp";

/// Options for opening a broker connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Broker host, or socket path for the `unix` scheme. Required.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connection scheme: `tcp`, `tls` or `unix`.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Database index.
    #[serde(default)]
    pub database: i64,

    /// Username for ACL authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication.
    #[serde(default)]
    pub password: Option<String>,

    /// Read/write idle timeout in milliseconds. Zero waits indefinitely.
    #[serde(default)]
    pub read_write_timeout_ms: u64,

    /// Connect timeout in milliseconds. Zero means no deadline.
    #[serde(default)]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    std::env::var("SYSBROADCAST_REDIS_HOST").unwrap_or_default()
}

fn default_port() -> u16 {
    std::env::var("SYSBROADCAST_REDIS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            scheme: default_scheme(),
            database: 0,
            username: None,
            password: None,
            read_write_timeout_ms: 0,
            connect_timeout_ms: 0,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("read_write_timeout_ms", &self.read_write_timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

impl ConnectionOptions {
    /// Create options for a host with all other values defaulted.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the read/write idle timeout. `Duration::ZERO` waits indefinitely.
    #[must_use]
    pub fn with_read_write_timeout(mut self, timeout: Duration) -> Self {
        self.read_write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the connect timeout. `Duration::ZERO` means no deadline.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// The idle timeout, if any.
    #[must_use]
    pub fn read_write_timeout(&self) -> Option<Duration> {
        (self.read_write_timeout_ms > 0).then(|| Duration::from_millis(self.read_write_timeout_ms))
    }

    /// The connect timeout, if any.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    /// Check that the options can be used to connect.
    ///
    /// # Errors
    ///
    /// Returns an error if no host is configured or the scheme is unknown.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.trim().is_empty() {
            return Err(TransportError::InvalidConfig(
                "broker host not configured".to_string(),
            ));
        }
        match self.scheme.as_str() {
            "tcp" | "tls" | "unix" => Ok(()),
            other => Err(TransportError::InvalidConfig(format!(
                "unsupported scheme \"{other}\""
            ))),
        }
    }
}
