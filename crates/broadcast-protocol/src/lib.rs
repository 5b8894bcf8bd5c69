//! # sysbroadcast-protocol
//!
//! Wire format and message authentication for system broadcasts.
//!
//! A broadcast message travels over a pub/sub channel as a single string:
//!
//! ```text
//! {name}:{signature}:{payload}
//! ```
//!
//! - `name` identifies the handler to invoke and never contains `:`
//! - `signature` is empty for unsigned messages, otherwise
//!   `{algorithm}|{key name}|{timestamp}|{hex mac}`
//! - `payload` is JSON (or empty) and may itself contain `:`
//!
//! ## Example
//!
//! ```rust
//! use sysbroadcast_protocol::{codec, SigningConfig};
//!
//! let signing = SigningConfig::default().with_sign_key("secret");
//! let payload = codec::encode_payload(Some(&serde_json::json!({"a": 1}))).unwrap();
//!
//! let block = signing.sign_at("greet", &payload, 1_700_000_000);
//! let wire = codec::encode("greet", block.as_ref(), &payload).unwrap();
//!
//! let frame = codec::decode(&wire);
//! assert_eq!(frame.name, "greet");
//! signing.verify_at(&frame, 1_700_000_000).unwrap();
//! ```

pub mod algorithm;
pub mod codec;
pub mod signature;
pub mod signing;

pub use algorithm::{Algorithm, UnknownAlgorithm};
pub use codec::{decode, encode, ProtocolError, WireMessage};
pub use signature::{SignatureBlock, SignatureFields, DEFAULT_KEY_NAME};
pub use signing::{is_valid_key_name, SigningConfig, VerifyError, DEFAULT_TIME_TOLERANCE};
