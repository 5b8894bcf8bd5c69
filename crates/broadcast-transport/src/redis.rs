//! Redis transport implementation.
//!
//! Command connections are multiplexed and cheap to clone. Each
//! subscription opens its own pub/sub connection, since its idle timeout is
//! specific to one listening session.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, Client, IntoConnectionInfo, RedisError};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::options::ConnectionOptions;
use crate::traits::{
    Command, Connection, Subscription, SubscriptionEvent, Transport, TransportError,
};

impl From<RedisError> for TransportError {
    fn from(e: RedisError) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Command(e.to_string())
        }
    }
}

/// Redis transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisTransport;

impl RedisTransport {
    /// Create a new Redis transport.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn client(options: &ConnectionOptions) -> Result<Client, TransportError> {
        options.validate()?;

        let url = match options.scheme.as_str() {
            "tls" => format!("rediss://{}:{}", options.host, options.port),
            "unix" => format!("redis+unix://{}", options.host),
            _ => format!("redis://{}:{}", options.host, options.port),
        };

        let mut info = url
            .as_str()
            .into_connection_info()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        info.redis.db = options.database;
        info.redis.username = options.username.clone();
        info.redis.password = options.password.clone();

        Client::open(info).map_err(|e| TransportError::InvalidConfig(e.to_string()))
    }
}

/// Run a connection attempt under the optional connect deadline.
async fn with_connect_timeout<T>(
    timeout: Option<Duration>,
    attempt: impl Future<Output = Result<T, RedisError>>,
) -> Result<T, TransportError> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| TransportError::Connect("connect timed out".to_string()))?
            .map_err(TransportError::from),
        None => attempt.await.map_err(TransportError::from),
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let client = Self::client(options)?;
        let conn = with_connect_timeout(
            options.connect_timeout(),
            client.get_multiplexed_async_connection(),
        )
        .await?;

        debug!(host = %options.host, port = options.port, "Redis connection established");
        Ok(Box::new(RedisConnection { conn }))
    }

    async fn subscribe(
        &self,
        options: &ConnectionOptions,
        channel: &str,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let client = Self::client(options)?;
        let mut pubsub =
            with_connect_timeout(options.connect_timeout(), client.get_async_pubsub()).await?;

        // Resolves once the broker has confirmed the subscription
        pubsub.subscribe(channel).await?;
        debug!(channel = %channel, "Redis subscription confirmed");

        let mut pending = VecDeque::new();
        pending.push_back(SubscriptionEvent::Subscribe {
            channel: channel.to_string(),
        });

        Ok(Box::new(RedisSubscription {
            channel: channel.to_string(),
            pubsub,
            idle_timeout: options.read_write_timeout(),
            pending,
            ended: false,
        }))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// A multiplexed Redis command connection.
pub struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl Connection for RedisConnection {
    async fn execute_atomic(&self, commands: Vec<Command>) -> Result<(), TransportError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            match command {
                Command::Publish { channel, payload } => {
                    pipe.publish(channel, payload).ignore();
                }
                Command::Increment { key } => {
                    pipe.incr(key, 1).ignore();
                }
            }
        }

        let mut conn = self.conn.clone();
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TransportError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }
}

/// A Redis pub/sub subscription.
pub struct RedisSubscription {
    channel: String,
    pubsub: PubSub,
    idle_timeout: Option<Duration>,
    pending: VecDeque<SubscriptionEvent>,
    ended: bool,
}

#[async_trait]
impl Subscription for RedisSubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_event(&mut self) -> Result<Option<SubscriptionEvent>, TransportError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        if self.ended {
            return Ok(None);
        }

        let idle_timeout = self.idle_timeout;
        let next = {
            let mut messages = std::pin::pin!(self.pubsub.on_message());
            match idle_timeout {
                Some(timeout) => tokio::time::timeout(timeout, messages.next())
                    .await
                    .map_err(|_| TransportError::Timeout)?,
                None => messages.next().await,
            }
        };

        let Some(msg) = next else {
            warn!(channel = %self.channel, "Redis subscription closed by broker");
            self.ended = true;
            return Err(TransportError::ConnectionClosed);
        };

        let payload: String = msg.get_payload()?;
        Ok(Some(SubscriptionEvent::Message {
            channel: msg.get_channel_name().to_string(),
            payload,
        }))
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        if self.ended {
            return Ok(());
        }
        self.pubsub.unsubscribe(&self.channel).await?;
        self.ended = true;
        debug!(channel = %self.channel, "Redis subscription released");

        self.pending.push_back(SubscriptionEvent::Unsubscribe {
            channel: self.channel.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_requires_host() {
        let options = ConnectionOptions::new("");
        assert!(matches!(
            RedisTransport::client(&options),
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_client_from_options() {
        let mut options = ConnectionOptions::new("127.0.0.1").with_port(6380);
        options.database = 3;
        options.password = Some("p@ss:word".to_string());

        let client = RedisTransport::client(&options).unwrap();
        let info = client.get_connection_info();
        assert_eq!(info.redis.db, 3);
        assert_eq!(info.redis.password.as_deref(), Some("p@ss:word"));
        assert!(matches!(
            &info.addr,
            redis::ConnectionAddr::Tcp(host, 6380) if host == "127.0.0.1"
        ));
    }

    #[test]
    fn test_error_classification() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(TransportError::from(io).is_connectivity());

        let timeout = RedisError::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(
            TransportError::from(timeout),
            TransportError::Timeout
        ));

        let command = RedisError::from((redis::ErrorKind::TypeError, "wrong type"));
        assert!(!TransportError::from(command).is_connectivity());
    }
}
