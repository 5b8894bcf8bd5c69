//! Error types for the broadcast client.

use sysbroadcast_protocol::{ProtocolError, VerifyError};
use sysbroadcast_transport::TransportError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::handler::HandlerError;

/// Broad categories of [`BroadcastError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller passed an unusable argument.
    Usage,
    /// A payload could not be encoded or decoded.
    Codec,
    /// A received message failed authentication.
    Verification,
    /// No handler is registered for a received message.
    Unhandled,
    /// A handler returned an error.
    Handler,
    /// The broker connection failed.
    Transport,
    /// The configuration could not be loaded.
    Config,
}

/// Broadcast client errors.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Invalid argument.
    #[error("Invalid usage: {0}")]
    Usage(String),

    /// Payload encoding or decoding failed.
    #[error("Codec error for broadcast message \"{name}\": {source}")]
    Codec {
        name: String,
        #[source]
        source: ProtocolError,
    },

    /// Message authentication failed.
    #[error(transparent)]
    Verification(#[from] VerifyError),

    /// No handler registered.
    #[error("No handler for broadcast message \"{name}\" registered")]
    Unhandled { name: String },

    /// A handler failed.
    #[error("Handler for broadcast message \"{name}\" failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: HandlerError,
    },

    /// Transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BroadcastError {
    /// The category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            BroadcastError::Usage(_) => ErrorKind::Usage,
            BroadcastError::Codec { .. } => ErrorKind::Codec,
            BroadcastError::Verification(_) => ErrorKind::Verification,
            BroadcastError::Unhandled { .. } => ErrorKind::Unhandled,
            BroadcastError::Handler { .. } => ErrorKind::Handler,
            BroadcastError::Transport(_) => ErrorKind::Transport,
            BroadcastError::Config(_) => ErrorKind::Config,
        }
    }

    /// Name of the message the error concerns, if any.
    #[must_use]
    pub fn message_name(&self) -> Option<&str> {
        match self {
            BroadcastError::Codec { name, .. }
            | BroadcastError::Unhandled { name }
            | BroadcastError::Handler { name, .. } => Some(name),
            BroadcastError::Verification(e) => Some(e.message_name()),
            _ => None,
        }
    }
}
