//! Client configuration.
//!
//! Configuration is read from a TOML file:
//!
//! ```toml
//! channel = "system"
//!
//! [connection]
//! host = "127.0.0.1"
//! port = 6379
//!
//! [signing]
//! sign_key = "secret"
//! sign_key_name = "node1"
//! verification_algorithms = ["sha512"]
//!
//! [signing.verification_keys]
//! node2 = "other secret"
//! ```
//!
//! Connection host and port fall back to `SYSBROADCAST_REDIS_HOST` and
//! `SYSBROADCAST_REDIS_PORT`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sysbroadcast_protocol::SigningConfig;
use sysbroadcast_transport::ConnectionOptions;
use thiserror::Error;
use tracing::debug;

use crate::sequence::DEFAULT_SEQUENCE_PREFIX;

/// Paths probed by [`BroadcastConfig::load`], in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "sysbroadcast.toml",
    "/etc/sysbroadcast/sysbroadcast.toml",
    "~/.config/sysbroadcast/sysbroadcast.toml",
];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("Failed to parse config {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },

    /// None of the probed files exists.
    #[error("No config file found, tried {}", .0.join(", "))]
    NotFound(Vec<String>),

    /// The configuration can never work.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Everything needed to build a [`Broadcast`](crate::Broadcast) client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Channel shared by all publishers and listeners.
    pub channel: String,

    /// Prefix of the sequence counter key.
    #[serde(default = "default_sequence_prefix")]
    pub sequence_prefix: String,

    /// Broker connection.
    #[serde(default)]
    pub connection: ConnectionOptions,

    /// Signing identity and verification policy.
    #[serde(default)]
    pub signing: SigningConfig,
}

fn default_sequence_prefix() -> String {
    DEFAULT_SEQUENCE_PREFIX.to_string()
}

impl BroadcastConfig {
    /// Create a configuration for a channel with all other values defaulted.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            sequence_prefix: default_sequence_prefix(),
            connection: ConnectionOptions::default(),
            signing: SigningConfig::default(),
        }
    }

    /// Load configuration from the first existing file of [`CONFIG_PATHS`].
    ///
    /// # Errors
    ///
    /// Returns an error if no file exists, or the first existing one cannot
    /// be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let mut tried = Vec::with_capacity(CONFIG_PATHS.len());
        for path in CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
            tried.push(expanded.into_owned());
        }
        Err(ConfigError::NotFound(tried))
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::parse(&contents, &path.display().to_string())
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Self::parse(contents, "string")
    }

    fn parse(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })
    }

    /// Check for values that can never work.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty channel, a zero time tolerance, or
    /// unusable connection options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.trim().is_empty() {
            return Err(ConfigError::Invalid("channel must not be empty".to_string()));
        }
        self.signing
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.connection
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
