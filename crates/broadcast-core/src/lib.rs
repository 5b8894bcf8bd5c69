//! # sysbroadcast
//!
//! Named, optionally signed broadcast messages over a Redis-compatible
//! pub/sub channel.
//!
//! This crate provides the client:
//!
//! - **Broadcast** - Publish, listen, and read the sequence counter
//! - **Handlers** - Message name to handler dispatch
//! - **Listen loop** - Subscription state machine with cooperative stop
//! - **Sequence** - Publish counter for detecting missed messages
//! - **Config** - TOML configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  publish()  │────▶│  Codec +    │────▶│  Transport  │
//! └─────────────┘     │  Signing    │     │  (atomic)   │
//!                     └─────────────┘     └─────────────┘
//!                                                │
//! ┌─────────────┐     ┌─────────────┐     ┌──────▼──────┐
//! │  Handlers   │◀────│   Verify    │◀────│ Listen loop │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use sysbroadcast::{Broadcast, ConnectionOptions, Flow, ListenEnd, MemoryTransport};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), sysbroadcast::BroadcastError> {
//! let broker = MemoryTransport::new();
//! let options = ConnectionOptions::new("memory");
//!
//! let publisher = Broadcast::new(broker.clone(), options.clone(), "system");
//! publisher.publish("reload", None).await?;
//! assert_eq!(publisher.sequence().await?, 1);
//!
//! let mut listener = Broadcast::new(broker, options, "system");
//! listener.handler_fn("reload", |_payload, _client, _name| Ok(Flow::Stop));
//! let end = listener.listen(Duration::from_millis(10)).await?;
//! assert_eq!(end, ListenEnd::TimedOut);
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod handler;
pub mod listen;
pub mod sequence;

pub use broadcast::Broadcast;
pub use config::{BroadcastConfig, ConfigError};
pub use error::{BroadcastError, ErrorKind};
pub use handler::{Flow, FnHandler, HandlerError, HandlerRegistry, MessageHandler};
pub use listen::{ListenEnd, ListenState};

pub use sysbroadcast_protocol::{Algorithm, SigningConfig, VerifyError};
#[cfg(feature = "redis")]
pub use sysbroadcast_transport::RedisTransport;
pub use sysbroadcast_transport::{
    ConnectionOptions, MemoryTransport, Transport, TransportError,
};
