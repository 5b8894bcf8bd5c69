//! Transport abstraction traits for system broadcasts.
//!
//! These traits define what the broadcast client needs from a pub/sub
//! broker, allowing it to be broker-agnostic.

use async_trait::async_trait;
use thiserror::Error;

use crate::options::ConnectionOptions;

/// A broker command that can be part of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Publish a payload to a channel.
    Publish { channel: String, payload: String },
    /// Increment an integer value by one, treating an absent key as zero.
    Increment { key: String },
}

impl Command {
    /// Create a publish command.
    #[must_use]
    pub fn publish(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Command::Publish {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Create an increment command.
    #[must_use]
    pub fn increment(key: impl Into<String>) -> Self {
        Command::Increment { key: key.into() }
    }
}

/// An event observed on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The broker confirmed the subscription.
    Subscribe { channel: String },
    /// A message was published to the channel.
    Message { channel: String, payload: String },
    /// The broker confirmed the unsubscription.
    Unsubscribe { channel: String },
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No data arrived within the configured timeout.
    #[error("Connection timed out")]
    Timeout,

    /// Could not establish or keep a connection.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The broker refused or failed a command.
    #[error("Command failed: {0}")]
    Command(String),

    /// Connection options are unusable.
    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error concerns the connection rather than a command.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed
                | TransportError::Timeout
                | TransportError::Connect(_)
                | TransportError::Io(_)
        )
    }
}

/// A pub/sub broker.
///
/// Transports hand out two kinds of connections: command connections,
/// which may be kept and reused, and subscriptions, which own a dedicated
/// connection configured for one listening session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a command connection.
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn Connection>, TransportError>;

    /// Open a dedicated connection and subscribe it to `channel`.
    ///
    /// The first event of the returned subscription is the subscribe
    /// confirmation.
    async fn subscribe(
        &self,
        options: &ConnectionOptions,
        channel: &str,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Get the transport name (e.g., "redis", "memory").
    fn name(&self) -> &'static str;
}

/// A command connection to the broker.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute commands as one indivisible unit.
    ///
    /// Either all commands take effect, in order, or none do. Other clients
    /// never observe a partial batch.
    async fn execute_atomic(&self, commands: Vec<Command>) -> Result<(), TransportError>;

    /// Read a string value. Absent keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, TransportError>;
}

/// A live channel subscription.
#[async_trait]
pub trait Subscription: Send {
    /// The subscribed channel.
    fn channel(&self) -> &str;

    /// Wait for the next event.
    ///
    /// Returns `Ok(None)` once the subscription has ended, and
    /// [`TransportError::Timeout`] if the idle timeout elapsed first.
    async fn next_event(&mut self) -> Result<Option<SubscriptionEvent>, TransportError>;

    /// Request unsubscription.
    ///
    /// The confirmation is delivered as a later
    /// [`SubscriptionEvent::Unsubscribe`], after which the subscription ends.
    async fn unsubscribe(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_constructors() {
        assert_eq!(
            Command::publish("ch", "msg::"),
            Command::Publish {
                channel: "ch".to_string(),
                payload: "msg::".to_string()
            }
        );
        assert_eq!(
            Command::increment("seq_ch"),
            Command::Increment {
                key: "seq_ch".to_string()
            }
        );
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(TransportError::Timeout.is_connectivity());
        assert!(TransportError::ConnectionClosed.is_connectivity());
        assert!(TransportError::Connect("refused".into()).is_connectivity());
        assert!(TransportError::Io(std::io::Error::other("reset")).is_connectivity());
        assert!(!TransportError::Command("WRONGTYPE".into()).is_connectivity());
        assert!(!TransportError::InvalidConfig("host".into()).is_connectivity());
    }
}
