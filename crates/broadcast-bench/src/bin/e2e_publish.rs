//! End-to-end publish benchmark for sysbroadcast.
//!
//! Publishes a batch of signed messages through a real Redis server and
//! measures how fast a listener receives them.
//!
//! Usage: `e2e_publish [messages]`. The broker is taken from
//! `sysbroadcast.toml` if present, otherwise from `SYSBROADCAST_REDIS_HOST`
//! (default `127.0.0.1`).

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysbroadcast::{
    Broadcast, BroadcastConfig, ConfigError, ConnectionOptions, Flow, ListenEnd, RedisTransport,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_MESSAGES: u64 = 10_000;
const LISTEN_TIMEOUT: Duration = Duration::from_secs(30);

fn config() -> Result<BroadcastConfig> {
    match BroadcastConfig::load() {
        Ok(config) => Ok(config),
        Err(ConfigError::NotFound(_)) => {
            let mut config = BroadcastConfig::new("sysbroadcast-bench");
            if config.connection.host.is_empty() {
                config.connection = ConnectionOptions::new("127.0.0.1");
            }
            config.signing = config.signing.with_sign_key("bench secret");
            Ok(config)
        }
        Err(e) => Err(e).context("Failed to load configuration"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sysbroadcast=debug")),
        )
        .init();

    let messages: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("message count must be a number")?,
        None => DEFAULT_MESSAGES,
    };

    let config = config()?;
    info!(
        channel = %config.channel,
        host = %config.connection.host,
        port = config.connection.port,
        signed = config.signing.uses_signatures(),
        messages,
        "Starting end-to-end benchmark"
    );

    let publisher = Broadcast::from_config(RedisTransport::new(), config.clone())?;

    let received = Arc::new(AtomicU64::new(0));
    let (ready_tx, mut ready) = mpsc::unbounded_channel();
    let mut listener = Broadcast::from_config(RedisTransport::new(), config)?;
    {
        let received = Arc::clone(&received);
        listener
            .on_listen(move |sequence| {
                let _ = ready_tx.send(sequence);
            })
            .handler_fn("bench-tick", move |_, _, _| {
                received.fetch_add(1, Ordering::Relaxed);
                Ok(Flow::Continue)
            })
            .handler_fn("bench-done", |_, _, _| Ok(Flow::Stop));
    }
    let listener = Arc::new(listener);

    let session = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.listen(LISTEN_TIMEOUT).await })
    };
    let start_sequence = ready
        .recv()
        .await
        .context("listener ended before subscribing")?;

    let start = Instant::now();
    for i in 0..messages {
        publisher
            .publish("bench-tick", Some(&json!({"i": i})))
            .await
            .with_context(|| format!("publish {i} failed"))?;
    }
    let publish_elapsed = start.elapsed();
    publisher.publish("bench-done", None).await?;

    let end = session.await.context("listener task panicked")??;
    let total_elapsed = start.elapsed();
    if end != ListenEnd::HandlerStopped {
        bail!("listener ended unexpectedly: {end:?}");
    }

    let received = received.load(Ordering::Relaxed);
    let end_sequence = publisher.sequence().await?;
    let published = end_sequence.saturating_sub(start_sequence);
    if received != messages {
        warn!(received, messages, "Listener missed messages");
    }

    println!("Messages:          {messages:>10}");
    println!("Received:          {received:>10}");
    println!("Sequence advanced: {published:>10}");
    println!(
        "Publish rate:      {:>10.0} msg/s",
        messages as f64 / publish_elapsed.as_secs_f64()
    );
    println!(
        "Delivery rate:     {:>10.0} msg/s",
        received as f64 / total_elapsed.as_secs_f64()
    );
    Ok(())
}
