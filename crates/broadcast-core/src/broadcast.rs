//! The broadcast client.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysbroadcast_protocol::codec::{self, ProtocolError};
use sysbroadcast_protocol::{is_valid_key_name, Algorithm, SigningConfig};
use sysbroadcast_transport::{Connection, ConnectionOptions, Transport, TransportError};
use tokio::sync::OnceCell;
use tracing::{debug, trace, warn};

use crate::config::BroadcastConfig;
use crate::error::BroadcastError;
use crate::handler::{Flow, FnHandler, HandlerError, HandlerRegistry, ListenCallback, MessageHandler};
use crate::listen::{Dispatch, ListenEnd, ListenSession};
use crate::sequence::{self, DEFAULT_SEQUENCE_PREFIX};

/// A client publishing and listening for broadcast messages on one channel.
///
/// Configure the client, register handlers, then share it (for example in
/// an [`Arc`]) between the tasks publishing and the task listening.
pub struct Broadcast {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    channel: String,
    sequence_prefix: String,
    signing: SigningConfig,
    handlers: HandlerRegistry,
    listen_callbacks: Vec<ListenCallback>,
    stopped: AtomicBool,
    connection: OnceCell<Box<dyn Connection>>,
}

impl Broadcast {
    /// Create an unsigned client for `channel`.
    pub fn new(
        transport: impl Transport + 'static,
        options: ConnectionOptions,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            options,
            channel: channel.into(),
            sequence_prefix: DEFAULT_SEQUENCE_PREFIX.to_string(),
            signing: SigningConfig::default(),
            handlers: HandlerRegistry::new(),
            listen_callbacks: Vec::new(),
            stopped: AtomicBool::new(false),
            connection: OnceCell::new(),
        }
    }

    /// Create a client from a loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn from_config(
        transport: impl Transport + 'static,
        config: BroadcastConfig,
    ) -> Result<Self, BroadcastError> {
        config.validate()?;
        let BroadcastConfig {
            channel,
            sequence_prefix,
            connection,
            signing,
        } = config;

        Ok(Self::new(transport, connection, channel)
            .with_sequence_prefix(sequence_prefix)
            .with_signing(signing))
    }

    /// Sign outgoing messages with `key` and require signatures on incoming ones.
    #[must_use]
    pub fn with_sign_key(mut self, key: impl Into<String>) -> Self {
        self.signing = self.signing.with_sign_key(key);
        self
    }

    /// Set the key name announced with signatures.
    ///
    /// # Errors
    ///
    /// Returns a usage error if `name` contains `:` or `|`.
    pub fn with_sign_key_name(mut self, name: impl Into<String>) -> Result<Self, BroadcastError> {
        let name = name.into();
        if !is_valid_key_name(&name) {
            return Err(BroadcastError::Usage(format!(
                "Sign key name \"{name}\" must not contain ':' or '|'"
            )));
        }
        self.signing = self.signing.with_sign_key_name(Some(name));
        Ok(self)
    }

    #[must_use]
    pub fn with_sign_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.signing = self.signing.with_sign_algorithm(algorithm);
        self
    }

    /// Set the accepted clock difference in seconds.
    ///
    /// # Errors
    ///
    /// Returns a usage error if `seconds` is zero.
    pub fn with_time_tolerance(mut self, seconds: u64) -> Result<Self, BroadcastError> {
        let signing = self.signing.with_time_tolerance(seconds);
        signing
            .validate()
            .map_err(|e| BroadcastError::Usage(e.to_string()))?;
        self.signing = signing;
        Ok(self)
    }

    /// Accept signatures made with other key names, mapped to their secrets.
    #[must_use]
    pub fn with_verification_keys(mut self, keys: HashMap<String, String>) -> Self {
        self.signing = self.signing.with_verification_keys(keys);
        self
    }

    /// Accept signatures made with other algorithms.
    #[must_use]
    pub fn with_verification_algorithms(
        mut self,
        algorithms: impl IntoIterator<Item = Algorithm>,
    ) -> Self {
        self.signing = self.signing.with_verification_algorithms(algorithms);
        self
    }

    /// Replace the whole signing configuration.
    #[must_use]
    pub fn with_signing(mut self, signing: SigningConfig) -> Self {
        self.signing = signing;
        self
    }

    #[must_use]
    pub fn with_sequence_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.sequence_prefix = prefix.into();
        self
    }

    /// Register the handler for a message name, replacing any earlier one.
    pub fn handler(
        &mut self,
        name: impl Into<String>,
        handler: impl MessageHandler + 'static,
    ) -> &mut Self {
        let name = name.into();
        if self.handlers.register(name.clone(), Arc::new(handler)).is_some() {
            debug!(channel = %self.channel, name = %name, "Replaced broadcast handler");
        }
        self
    }

    /// Register a closure as the handler for a message name.
    pub fn handler_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Option<Value>, &Broadcast, &str) -> Result<Flow, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.handler(name, FnHandler::new(f))
    }

    /// Register a callback run with the sequence value captured when a
    /// listening session is subscribed. Callbacks run in registration order.
    pub fn on_listen(&mut self, callback: impl Fn(u64) + Send + Sync + 'static) -> &mut Self {
        self.listen_callbacks.push(Box::new(callback));
        self
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn connection_options(&self) -> &ConnectionOptions {
        &self.options
    }

    #[must_use]
    pub fn sequence_prefix(&self) -> &str {
        &self.sequence_prefix
    }

    /// The key of this channel's sequence counter.
    #[must_use]
    pub fn sequence_key(&self) -> String {
        sequence::sequence_key(&self.sequence_prefix, &self.channel)
    }

    #[must_use]
    pub fn signing(&self) -> &SigningConfig {
        &self.signing
    }

    #[must_use]
    pub fn sign_key(&self) -> Option<&str> {
        self.signing.sign_key()
    }

    #[must_use]
    pub fn sign_key_name(&self) -> Option<&str> {
        self.signing.sign_key_name()
    }

    #[must_use]
    pub fn sign_algorithm(&self) -> Algorithm {
        self.signing.sign_algorithm()
    }

    #[must_use]
    pub fn time_tolerance(&self) -> u64 {
        self.signing.time_tolerance()
    }

    #[must_use]
    pub fn verification_keys(&self) -> &HashMap<String, String> {
        self.signing.verification_keys()
    }

    #[must_use]
    pub fn verification_algorithms(&self) -> &BTreeSet<Algorithm> {
        self.signing.verification_algorithms()
    }

    /// Whether messages are signed on publish and required on receive.
    #[must_use]
    pub fn uses_signatures(&self) -> bool {
        self.signing.uses_signatures()
    }

    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// The command connection, opened on first use.
    async fn connection(&self) -> Result<&dyn Connection, TransportError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                debug!(
                    channel = %self.channel,
                    transport = self.transport.name(),
                    host = %self.options.host,
                    "Opening broker connection"
                );
                self.transport.connect(&self.options).await
            })
            .await?;
        Ok(connection.as_ref())
    }

    /// Publish a message with an optional JSON payload.
    ///
    /// The message and the sequence increment are executed as one atomic
    /// batch.
    ///
    /// # Errors
    ///
    /// Returns a usage error if `name` contains `:`, or the transport error
    /// if the batch fails.
    pub async fn publish(&self, name: &str, payload: Option<&Value>) -> Result<(), BroadcastError> {
        validate_name(name)?;
        let encoded = codec::encode_payload(payload).map_err(|e| codec_error(name, e))?;
        self.publish_encoded(name, &encoded).await
    }

    /// Publish a message with any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the payload cannot be serialized, otherwise
    /// as [`Broadcast::publish`].
    pub async fn publish_json<P>(&self, name: &str, payload: &P) -> Result<(), BroadcastError>
    where
        P: Serialize + ?Sized + Sync,
    {
        validate_name(name)?;
        let encoded = codec::encode_payload_from(payload).map_err(|e| codec_error(name, e))?;
        self.publish_encoded(name, &encoded).await
    }

    async fn publish_encoded(&self, name: &str, encoded: &str) -> Result<(), BroadcastError> {
        let signature = self.signing.sign(name, encoded);
        let wire = codec::encode(name, signature.as_ref(), encoded)
            .map_err(|e| BroadcastError::Usage(e.to_string()))?;
        let key = self.sequence_key();

        self.connection()
            .await?
            .execute_atomic(sequence::publish_batch(&self.channel, &key, wire))
            .await?;

        debug!(
            channel = %self.channel,
            name = %name,
            signed = signature.is_some(),
            "Published broadcast"
        );
        Ok(())
    }

    /// The current value of this channel's sequence counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be reached or the stored value
    /// is not a counter.
    pub async fn sequence(&self) -> Result<u64, BroadcastError> {
        let raw = self.connection().await?.get(&self.sequence_key()).await?;
        Ok(sequence::parse_sequence(raw.as_deref())?)
    }

    /// Listen for messages until stopped, timed out or failed.
    ///
    /// `timeout` is the idle timeout of the subscription connection;
    /// `Duration::ZERO` waits indefinitely. A connection error within one
    /// second of the timeout ends the session as [`ListenEnd::TimedOut`].
    ///
    /// # Errors
    ///
    /// Returns the first receive-side error: a refused or undecodable
    /// message, a message without handler, a failed handler, or a
    /// connection failure.
    pub async fn listen(&self, timeout: Duration) -> Result<ListenEnd, BroadcastError> {
        ListenSession::new(self, timeout).run().await
    }

    /// Ask the running session to unsubscribe once the current event has
    /// been processed.
    pub fn stop(&self) {
        debug!(channel = %self.channel, "Stop requested");
        self.stopped.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_stop(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub(crate) fn notify_listen(&self, sequence: u64) {
        debug!(
            channel = %self.channel,
            sequence,
            callbacks = self.listen_callbacks.len(),
            "Subscribed"
        );
        for callback in &self.listen_callbacks {
            callback(sequence);
        }
    }

    /// Decode, verify and dispatch one received frame.
    pub(crate) async fn receive(&self, raw: &str) -> Dispatch {
        self.dispatch(raw).await.into()
    }

    async fn dispatch(&self, raw: &str) -> Result<Flow, BroadcastError> {
        let frame = codec::decode(raw);
        trace!(
            channel = %self.channel,
            name = %frame.name,
            signed = frame.signature.is_some(),
            len = raw.len(),
            "Received broadcast"
        );

        if let Err(e) = self.signing.verify(&frame) {
            warn!(channel = %self.channel, error = %e, "Refused broadcast");
            return Err(e.into());
        }

        let Some(handler) = self.handlers.get(frame.name) else {
            warn!(channel = %self.channel, name = %frame.name, "Unhandled broadcast");
            return Err(BroadcastError::Unhandled {
                name: frame.name.to_string(),
            });
        };

        let payload = frame
            .decode_payload()
            .map_err(|e| codec_error(frame.name, e))?;

        handler
            .handle(payload, self, frame.name)
            .await
            .map_err(|source| BroadcastError::Handler {
                name: frame.name.to_string(),
                source,
            })
    }
}

fn validate_name(name: &str) -> Result<(), BroadcastError> {
    codec::validate_name(name).map_err(|e| BroadcastError::Usage(e.to_string()))
}

fn codec_error(name: &str, source: ProtocolError) -> BroadcastError {
    BroadcastError::Codec {
        name: name.to_string(),
        source,
    }
}

impl fmt::Debug for Broadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("transport", &self.transport.name())
            .field("options", &self.options)
            .field("channel", &self.channel)
            .field("sequence_prefix", &self.sequence_prefix)
            .field("signing", &self.signing)
            .field("handlers", &self.handlers)
            .field("listen_callbacks", &self.listen_callbacks.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use sysbroadcast_protocol::VerifyError;
    use sysbroadcast_transport::{Command, MemoryTransport};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const CHANNEL: &str = "system";

    fn client(broker: &MemoryTransport) -> Broadcast {
        Broadcast::new(broker.clone(), ConnectionOptions::new("memory"), CHANNEL)
    }

    /// A listener with a readiness signal and a record of `greet` payloads.
    struct Listener {
        client: Arc<Broadcast>,
        ready: mpsc::UnboundedReceiver<u64>,
        greeted: mpsc::UnboundedReceiver<Option<Value>>,
    }

    impl Listener {
        fn new(mut client: Broadcast) -> Self {
            let (ready_tx, ready) = mpsc::unbounded_channel();
            let (greet_tx, greeted) = mpsc::unbounded_channel();
            client
                .on_listen(move |sequence| {
                    let _ = ready_tx.send(sequence);
                })
                .handler_fn("greet", move |payload, _, _| {
                    let _ = greet_tx.send(payload);
                    Ok(Flow::Continue)
                })
                .handler_fn("halt", |_, _, _| Ok(Flow::Stop))
                .handler_fn("stop", |_, client, _| {
                    client.stop();
                    Ok(Flow::Continue)
                });
            Self {
                client: Arc::new(client),
                ready,
                greeted,
            }
        }

        /// Spawn a session and wait until it is subscribed.
        async fn start(
            &mut self,
            timeout: Duration,
        ) -> (JoinHandle<Result<ListenEnd, BroadcastError>>, u64) {
            let client = Arc::clone(&self.client);
            let task = tokio::spawn(async move { client.listen(timeout).await });
            let sequence = self.ready.recv().await.unwrap();
            (task, sequence)
        }
    }

    const LONG: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_sequence_counts_publishes() {
        let broker = MemoryTransport::new();
        let client = client(&broker);

        assert_eq!(client.sequence().await.unwrap(), 0);
        client.publish("greet", None).await.unwrap();
        assert_eq!(client.sequence().await.unwrap(), 1);
        client.publish("greet", Some(&json!({"a": 1}))).await.unwrap();
        assert_eq!(client.sequence().await.unwrap(), 2);

        assert_eq!(
            broker.value("system_broadcast_sequence_system").as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_sequence_prefix() {
        let broker = MemoryTransport::new();
        let client = client(&broker).with_sequence_prefix("seq:");
        assert_eq!(client.sequence_key(), "seq:system");

        client.publish("greet", None).await.unwrap();
        assert_eq!(broker.value("seq:system").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_name_with_delimiter_is_usage_error() {
        let broker = MemoryTransport::new();
        let client = client(&broker);

        let err = client.publish("a:b", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(client.sequence().await.unwrap(), 0);
    }

    #[test]
    fn test_zero_tolerance_is_usage_error() {
        let broker = MemoryTransport::new();
        let err = client(&broker).with_time_tolerance(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);

        let client = client(&broker).with_time_tolerance(60).unwrap();
        assert_eq!(client.time_tolerance(), 60);
    }

    #[test]
    fn test_accessors() {
        let broker = MemoryTransport::new();
        let client = client(&broker)
            .with_sign_key("secret")
            .with_sign_key_name("node1")
            .unwrap()
            .with_sign_algorithm(Algorithm::Sha512)
            .with_verification_algorithms([Algorithm::Sha256]);

        assert_eq!(client.channel(), CHANNEL);
        assert_eq!(client.connection_options().host, "memory");
        assert!(client.uses_signatures());
        assert_eq!(client.sign_key(), Some("secret"));
        assert_eq!(client.sign_key_name(), Some("node1"));
        assert_eq!(client.sign_algorithm(), Algorithm::Sha512);
        assert!(client.verification_algorithms().contains(&Algorithm::Sha256));
        assert!(client.verification_keys().is_empty());
        assert!(!format!("{client:?}").contains("secret"));
    }

    #[tokio::test]
    async fn test_publish_unreachable_broker() {
        let broker = MemoryTransport::new();
        broker.set_unreachable(true);

        let err = client(&broker).publish("greet", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_delivery_then_unhandled_message() {
        let broker = MemoryTransport::new();
        let mut listener = Listener::new(client(&broker));
        let (task, captured) = listener.start(LONG).await;
        assert_eq!(captured, 0);

        let publisher = client(&broker);
        publisher.publish("greet", Some(&json!({"a": 1}))).await.unwrap();
        assert_eq!(listener.greeted.recv().await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(publisher.sequence().await.unwrap(), captured + 1);

        publisher.publish("bye", None).await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(&err, BroadcastError::Unhandled { name } if name == "bye"));
        assert!(listener.greeted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_listen_captures_current_sequence() {
        let broker = MemoryTransport::new();
        let publisher = client(&broker);
        publisher.publish("greet", None).await.unwrap();
        publisher.publish("greet", None).await.unwrap();

        let mut listener = Listener::new(client(&broker));
        let (task, captured) = listener.start(LONG).await;
        assert_eq!(captured, 2);

        publisher.publish("halt", None).await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), ListenEnd::HandlerStopped);
    }

    #[tokio::test]
    async fn test_null_and_absent_payloads() {
        let broker = MemoryTransport::new();
        let mut listener = Listener::new(client(&broker));
        let (task, _) = listener.start(LONG).await;

        let publisher = client(&broker);
        publisher.publish("greet", None).await.unwrap();
        publisher.publish("greet", Some(&Value::Null)).await.unwrap();
        publisher
            .publish_json("greet", &vec!["x:y", "z"])
            .await
            .unwrap();
        publisher.publish("halt", None).await.unwrap();

        assert_eq!(listener.greeted.recv().await.unwrap(), None);
        assert_eq!(listener.greeted.recv().await.unwrap(), None);
        assert_eq!(
            listener.greeted.recv().await.unwrap(),
            Some(json!(["x:y", "z"]))
        );
        assert_eq!(task.await.unwrap().unwrap(), ListenEnd::HandlerStopped);
    }

    #[tokio::test]
    async fn test_handler_stop_skips_queued_messages() {
        let broker = MemoryTransport::new();
        let mut listener = Listener::new(client(&broker));
        let (task, _) = listener.start(LONG).await;

        let publisher = client(&broker);
        publisher.publish("halt", None).await.unwrap();
        publisher.publish("greet", None).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), ListenEnd::HandlerStopped);
        assert!(listener.greeted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_from_handler_unsubscribes() {
        let broker = MemoryTransport::new();
        let mut listener = Listener::new(client(&broker));
        let (task, _) = listener.start(LONG).await;
        assert_eq!(broker.subscriber_count(CHANNEL), 1);

        client(&broker).publish("stop", None).await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), ListenEnd::Stopped);
        assert_eq!(broker.subscriber_count(CHANNEL), 0);
    }

    #[tokio::test]
    async fn test_stop_checked_after_current_event() {
        let broker = MemoryTransport::new();
        let mut listener = Listener::new(client(&broker));
        let (task, _) = listener.start(LONG).await;

        listener.client.stop();
        client(&broker).publish("greet", None).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), ListenEnd::Stopped);
        assert_eq!(listener.greeted.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_listen_again_resets_stop() {
        let broker = MemoryTransport::new();
        let publisher = client(&broker);
        let mut listener = Listener::new(client(&broker));

        let (task, _) = listener.start(LONG).await;
        publisher.publish("stop", None).await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), ListenEnd::Stopped);
        assert!(listener.client.is_stopped());

        let (task, captured) = listener.start(LONG).await;
        assert_eq!(captured, 1);
        assert!(!listener.client.is_stopped());

        publisher.publish("greet", None).await.unwrap();
        publisher.publish("halt", None).await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), ListenEnd::HandlerStopped);
        assert_eq!(listener.greeted.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_every_listener_receives() {
        let broker = MemoryTransport::new();
        let mut first = Listener::new(client(&broker));
        let mut second = Listener::new(client(&broker));
        let (first_task, _) = first.start(LONG).await;
        let (second_task, _) = second.start(LONG).await;

        let publisher = client(&broker);
        publisher.publish("greet", Some(&json!(1))).await.unwrap();
        publisher.publish("halt", None).await.unwrap();

        assert_eq!(first.greeted.recv().await.unwrap(), Some(json!(1)));
        assert_eq!(second.greeted.recv().await.unwrap(), Some(json!(1)));
        assert_eq!(first_task.await.unwrap().unwrap(), ListenEnd::HandlerStopped);
        assert_eq!(second_task.await.unwrap().unwrap(), ListenEnd::HandlerStopped);
    }

    #[tokio::test]
    async fn test_signed_round_trip() {
        let broker = MemoryTransport::new();
        let mut listener = Listener::new(client(&broker).with_sign_key("secret"));
        let (task, _) = listener.start(LONG).await;

        let publisher = client(&broker).with_sign_key("secret");
        publisher.publish("greet", Some(&json!({"a": 1}))).await.unwrap();
        publisher.publish("halt", None).await.unwrap();

        assert_eq!(listener.greeted.recv().await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(task.await.unwrap().unwrap(), ListenEnd::HandlerStopped);
    }

    #[tokio::test]
    async fn test_verification_keys_accept_other_identities() {
        let broker = MemoryTransport::new();
        let keys = HashMap::from([("node2".to_string(), "s2".to_string())]);
        let mut listener = Listener::new(
            client(&broker)
                .with_sign_key("s1")
                .with_sign_key_name("node1")
                .unwrap()
                .with_verification_keys(keys)
                .with_verification_algorithms([Algorithm::Sha3_256]),
        );
        let (task, _) = listener.start(LONG).await;

        client(&broker)
            .with_sign_key("s2")
            .with_sign_key_name("node2")
            .unwrap()
            .with_sign_algorithm(Algorithm::Sha3_256)
            .publish("greet", None)
            .await
            .unwrap();
        client(&broker)
            .with_sign_key("s1")
            .with_sign_key_name("node1")
            .unwrap()
            .publish("halt", None)
            .await
            .unwrap();

        assert_eq!(listener.greeted.recv().await.unwrap(), None);
        assert_eq!(task.await.unwrap().unwrap(), ListenEnd::HandlerStopped);
    }

    #[tokio::test]
    async fn test_mismatched_secret_is_refused() {
        let broker = MemoryTransport::new();
        let keys = HashMap::from([("node2".to_string(), "other".to_string())]);
        let mut listener = Listener::new(
            client(&broker)
                .with_sign_key("s1")
                .with_verification_keys(keys),
        );
        let (task, _) = listener.start(LONG).await;

        client(&broker)
            .with_sign_key("s2")
            .with_sign_key_name("node2")
            .unwrap()
            .publish("greet", None)
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            BroadcastError::Verification(VerifyError::InvalidSignature { .. })
        ));
        assert!(listener.greeted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsigned_message_refused_by_signing_receiver() {
        let broker = MemoryTransport::new();
        let mut listener = Listener::new(client(&broker).with_sign_key("secret"));
        let (task, _) = listener.start(LONG).await;

        client(&broker).publish("greet", None).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Verification);
        assert_eq!(err.message_name(), Some("greet"));
        assert!(matches!(
            err,
            BroadcastError::Verification(VerifyError::Unauthenticated { .. })
        ));
    }

    #[tokio::test]
    async fn test_receiver_without_key_refuses_unknown_key_name() {
        let broker = MemoryTransport::new();
        let mut listener = Listener::new(client(&broker));
        let (task, _) = listener.start(LONG).await;

        client(&broker)
            .with_sign_key("secret")
            .publish("greet", None)
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.message_name(), Some("greet"));
        assert!(matches!(
            err,
            BroadcastError::Verification(VerifyError::UnknownKey { .. })
        ));
        assert!(listener.greeted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_receiver_without_key_accepts_known_key_name() {
        let broker = MemoryTransport::new();
        let keys = HashMap::from([("default".to_string(), "secret".to_string())]);
        let mut listener = Listener::new(client(&broker).with_verification_keys(keys));
        let (task, _) = listener.start(LONG).await;

        let publisher = client(&broker).with_sign_key("secret");
        publisher.publish("greet", None).await.unwrap();
        publisher.publish("halt", None).await.unwrap();

        assert_eq!(listener.greeted.recv().await.unwrap(), None);
        assert_eq!(task.await.unwrap().unwrap(), ListenEnd::HandlerStopped);
    }

    #[test]
    fn test_sign_key_name_rejects_delimiters() {
        let broker = MemoryTransport::new();
        for name in ["node:1", "node|1"] {
            let err = client(&broker).with_sign_key_name(name).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
        let named = client(&broker).with_sign_key_name("node-1").unwrap();
        assert_eq!(named.sign_key_name(), Some("node-1"));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_codec_error() {
        let broker = MemoryTransport::new();
        let mut listener = Listener::new(client(&broker));
        let (task, _) = listener.start(LONG).await;

        let raw = broker.connect(&ConnectionOptions::new("memory")).await.unwrap();
        raw.execute_atomic(vec![Command::publish(CHANNEL, "greet::{not json")])
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Codec);
        assert_eq!(err.message_name(), Some("greet"));
        assert!(listener.greeted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_error_ends_session() {
        let broker = MemoryTransport::new();
        let mut failing = client(&broker);
        failing.handler_fn("fail", |_, _, _| Err("boom".into()));
        let mut listener = Listener::new(failing);
        let (task, _) = listener.start(LONG).await;

        client(&broker).publish("fail", None).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Handler);
        assert!(err.to_string().contains("boom"));
    }

    struct Pong;

    #[async_trait]
    impl MessageHandler for Pong {
        async fn handle(
            &self,
            _payload: Option<Value>,
            client: &Broadcast,
            _name: &str,
        ) -> Result<Flow, HandlerError> {
            client.publish("pong", None).await?;
            Ok(Flow::Stop)
        }
    }

    #[tokio::test]
    async fn test_async_handler_can_publish() {
        let broker = MemoryTransport::new();
        let mut ponger = client(&broker);
        ponger.handler("ping", Pong);
        let mut listener = Listener::new(ponger);
        let (task, _) = listener.start(LONG).await;

        let publisher = client(&broker);
        publisher.publish("ping", None).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), ListenEnd::HandlerStopped);
        assert_eq!(publisher.sequence().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_is_clean_end() {
        let broker = MemoryTransport::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut listening = client(&broker);
        for label in ["first", "second"] {
            let order = Arc::clone(&order);
            listening.on_listen(move |sequence| order.lock().unwrap().push((label, sequence)));
        }

        let end = listening.listen(Duration::from_secs(5)).await.unwrap();
        assert_eq!(end, ListenEnd::TimedOut);
        assert_eq!(*order.lock().unwrap(), vec![("first", 0), ("second", 0)]);
    }

    #[tokio::test]
    async fn test_early_disconnect_is_error() {
        let broker = MemoryTransport::new();
        let mut listener = Listener::new(client(&broker));
        let (task, _) = listener.start(Duration::from_secs(10)).await;

        broker.close_subscriptions();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            BroadcastError::Transport(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_zero_timeout_never_times_out() {
        let broker = MemoryTransport::new();
        let mut listener = Listener::new(client(&broker));
        let (task, _) = listener.start(Duration::ZERO).await;

        broker.close_subscriptions();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_error() {
        let broker = MemoryTransport::new();
        broker.set_unreachable(true);

        let err = client(&broker)
            .listen(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BroadcastError::Transport(TransportError::Connect(_))
        ));
    }

    #[test]
    fn test_client_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Broadcast>();
    }
}
