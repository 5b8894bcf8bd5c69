//! # sysbroadcast-transport
//!
//! Broker transport layer for system broadcasts.
//!
//! The broadcast client needs little from its broker:
//!
//! - **Atomic batches** - publish and counter increment as one unit
//! - **Key reads** - the sequence counter
//! - **Subscriptions** - a pull-style event stream with an idle timeout
//!
//! Implementations:
//!
//! - **Redis** - any Redis-compatible broker (feature `redis`, on by default)
//! - **Memory** - an in-process broker for tests and benchmarks
//!
//! ```rust,ignore
//! use sysbroadcast_transport::{ConnectionOptions, RedisTransport, Transport};
//!
//! async fn watch(transport: &RedisTransport) -> Result<(), TransportError> {
//!     let options = ConnectionOptions::new("127.0.0.1");
//!     let mut sub = transport.subscribe(&options, "system").await?;
//!     while let Some(event) = sub.next_event().await? {
//!         // Process event
//!     }
//!     Ok(())
//! }
//! ```

pub mod memory;
pub mod options;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryTransport;
pub use options::ConnectionOptions;
pub use traits::{Command, Connection, Subscription, SubscriptionEvent, Transport, TransportError};

#[cfg(feature = "redis")]
pub use crate::redis::RedisTransport;
