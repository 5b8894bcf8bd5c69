//! In-process broker.
//!
//! Channels are tokio broadcast channels; the key space is a map guarded
//! by the same lock, so an atomic batch is applied while holding it and
//! is observed as a unit by every other client.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::options::ConnectionOptions;
use crate::traits::{
    Command, Connection, Subscription, SubscriptionEvent, Transport, TransportError,
};

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    channels: HashMap<String, broadcast::Sender<String>>,
    values: HashMap<String, String>,
}

struct Shared {
    state: Mutex<State>,
    unreachable: AtomicBool,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoning panic cannot leave a batch half-applied
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_reachable(&self) -> Result<(), TransportError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("broker unreachable".to_string()));
        }
        Ok(())
    }
}

/// An in-process broker shared by all clones.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an empty broker buffering up to `capacity` messages per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                unreachable: AtomicBool::new(false),
                capacity,
            }),
        }
    }

    /// Make new connections and subscriptions fail as if the broker were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Drop every live subscription as if the broker closed the connections.
    pub fn close_subscriptions(&self) {
        let mut state = self.shared.lock();
        let closed = state.channels.len();
        state.channels.clear();
        warn!(channels = closed, "Closed all subscriptions");
    }

    /// Read a value directly.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        self.shared.lock().values.get(key).cloned()
    }

    /// Number of live subscriptions on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .lock()
            .channels
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        _options: &ConnectionOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        self.shared.check_reachable()?;
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn subscribe(
        &self,
        options: &ConnectionOptions,
        channel: &str,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        self.shared.check_reachable()?;

        let receiver = {
            let mut state = self.shared.lock();
            let capacity = self.shared.capacity;
            state
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(capacity).0)
                .subscribe()
        };
        debug!(channel = %channel, "Memory subscription opened");

        let mut pending = VecDeque::new();
        pending.push_back(SubscriptionEvent::Subscribe {
            channel: channel.to_string(),
        });

        Ok(Box::new(MemorySubscription {
            channel: channel.to_string(),
            receiver: Some(receiver),
            idle_timeout: options.read_write_timeout(),
            pending,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// A command connection to a [`MemoryTransport`].
pub struct MemoryConnection {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute_atomic(&self, commands: Vec<Command>) -> Result<(), TransportError> {
        let mut state = self.shared.lock();

        // Validate the whole batch before applying any of it
        let mut counters: HashMap<&str, i64> = HashMap::new();
        for command in &commands {
            if let Command::Increment { key } = command {
                let current = match counters.get(key.as_str()) {
                    Some(value) => *value,
                    None => parse_counter(key, state.values.get(key))?,
                };
                let next = current.checked_add(1).ok_or_else(|| {
                    TransportError::Command(format!("increment of \"{key}\" would overflow"))
                })?;
                counters.insert(key.as_str(), next);
            }
        }

        for command in &commands {
            match command {
                Command::Publish { channel, payload } => {
                    let receivers = state
                        .channels
                        .get(channel)
                        .map_or(0, |sender| sender.send(payload.clone()).unwrap_or_default());
                    trace!(channel = %channel, receivers, "Published");
                }
                Command::Increment { key } => {
                    if let Some(value) = counters.get(key.as_str()) {
                        state.values.insert(key.clone(), value.to_string());
                    }
                }
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TransportError> {
        Ok(self.shared.lock().values.get(key).cloned())
    }
}

fn parse_counter(key: &str, value: Option<&String>) -> Result<i64, TransportError> {
    match value {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            TransportError::Command(format!("value of \"{key}\" is not an integer"))
        }),
    }
}

/// A subscription to a [`MemoryTransport`] channel.
pub struct MemorySubscription {
    channel: String,
    receiver: Option<broadcast::Receiver<String>>,
    idle_timeout: Option<Duration>,
    pending: VecDeque<SubscriptionEvent>,
}

impl MemorySubscription {
    async fn recv(
        receiver: &mut broadcast::Receiver<String>,
        idle_timeout: Option<Duration>,
    ) -> Result<String, TransportError> {
        let received = match idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, receiver.recv())
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => receiver.recv().await,
        };

        received.map_err(|e| match e {
            broadcast::error::RecvError::Closed => TransportError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(missed) => {
                TransportError::Other(format!("subscriber lagged, {missed} messages dropped"))
            }
        })
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_event(&mut self) -> Result<Option<SubscriptionEvent>, TransportError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(None);
        };

        let payload = Self::recv(receiver, self.idle_timeout).await?;
        Ok(Some(SubscriptionEvent::Message {
            channel: self.channel.clone(),
            payload,
        }))
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        if self.receiver.take().is_some() {
            debug!(channel = %self.channel, "Memory subscription closed");
            self.pending.push_back(SubscriptionEvent::Unsubscribe {
                channel: self.channel.clone(),
            });
        }
        Ok(())
    }
}
