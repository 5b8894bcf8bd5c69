//! Message signing and verification.
//!
//! A signed message carries an HMAC over `{name}:{timestamp}:{payload}`.
//! The receiver accepts it when:
//!
//! - the algorithm is its own sign algorithm or one of its verification algorithms
//! - the key name resolves to a known secret (its own sign key under its own
//!   key name, or one of its verification keys)
//! - the timestamp is within the configured tolerance of the current time
//! - the MAC matches, compared in constant time
//!
//! A receiver with a sign key refuses unsigned messages. A receiver without
//! one accepts unsigned messages but still verifies signed ones.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::algorithm::Algorithm;
use crate::codec::{WireMessage, DELIMITER};
use crate::signature::{
    SignatureBlock, SignatureFields, DEFAULT_KEY_NAME, SIGNATURE_DELIMITER,
};

/// Default maximum clock difference for signed messages, in seconds.
pub const DEFAULT_TIME_TOLERANCE: u64 = 3600;

/// Reasons a received message is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// Message carries no signature but the receiver requires one.
    #[error("Refused unauthenticated broadcast message \"{name}\"")]
    Unauthenticated { name: String },

    /// Signature algorithm is not accepted.
    #[error("Refused broadcast message \"{name}\" with unaccepted signature algorithm \"{algorithm}\"")]
    UnknownAlgorithm { name: String, algorithm: String },

    /// Key name is missing or has no known secret.
    #[error("Refused broadcast message \"{name}\" with unknown signature key \"{key_name}\"")]
    UnknownKey { name: String, key_name: String },

    /// Timestamp is missing or not numeric.
    #[error("Refused broadcast message \"{name}\" with invalid timestamp \"{timestamp}\"")]
    InvalidTimestamp { name: String, timestamp: String },

    /// Timestamp is too far from the receiver's clock.
    #[error(
        "Refused broadcast message \"{name}\" with timestamp {timestamp} exceeding the tolerance of {tolerance}s (now {now})"
    )]
    TimestampOutOfTolerance {
        name: String,
        timestamp: i64,
        tolerance: u64,
        now: i64,
    },

    /// MAC is missing or does not match.
    #[error("Refused broadcast message \"{name}\" with invalid signature")]
    InvalidSignature { name: String },
}

impl VerifyError {
    /// Name of the refused message.
    #[must_use]
    pub fn message_name(&self) -> &str {
        match self {
            VerifyError::Unauthenticated { name }
            | VerifyError::UnknownAlgorithm { name, .. }
            | VerifyError::UnknownKey { name, .. }
            | VerifyError::InvalidTimestamp { name, .. }
            | VerifyError::TimestampOutOfTolerance { name, .. }
            | VerifyError::InvalidSignature { name } => name,
        }
    }
}

fn default_time_tolerance() -> u64 {
    DEFAULT_TIME_TOLERANCE
}

/// Signing identity and verification policy of a client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Secret used for signing. `None` disables signing.
    #[serde(default)]
    sign_key: Option<String>,

    /// Name announced with signatures.
    #[serde(default)]
    sign_key_name: Option<String>,

    /// Algorithm used for signing.
    #[serde(default)]
    sign_algorithm: Algorithm,

    /// Maximum clock difference in seconds.
    #[serde(default = "default_time_tolerance")]
    time_tolerance: u64,

    /// Additional accepted identities, key name to secret.
    #[serde(default)]
    verification_keys: HashMap<String, String>,

    /// Additional accepted algorithms.
    #[serde(default)]
    verification_algorithms: BTreeSet<Algorithm>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            sign_key: None,
            sign_key_name: None,
            sign_algorithm: Algorithm::default(),
            time_tolerance: DEFAULT_TIME_TOLERANCE,
            verification_keys: HashMap::new(),
            verification_algorithms: BTreeSet::new(),
        }
    }
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut key_names: Vec<&String> = self.verification_keys.keys().collect();
        key_names.sort();

        f.debug_struct("SigningConfig")
            .field("sign_key", &self.sign_key.as_ref().map(|_| "<redacted>"))
            .field("sign_key_name", &self.sign_key_name)
            .field("sign_algorithm", &self.sign_algorithm)
            .field("time_tolerance", &self.time_tolerance)
            .field("verification_keys", &key_names)
            .field("verification_algorithms", &self.verification_algorithms)
            .finish()
    }
}

impl SigningConfig {
    /// Set the signing secret.
    #[must_use]
    pub fn with_sign_key(mut self, key: impl Into<String>) -> Self {
        self.sign_key = Some(key.into());
        self
    }

    /// Set or clear the signing secret.
    #[must_use]
    pub fn with_optional_sign_key(mut self, key: Option<String>) -> Self {
        self.sign_key = key;
        self
    }

    /// Set or clear the key name announced with signatures.
    #[must_use]
    pub fn with_sign_key_name(mut self, name: Option<String>) -> Self {
        self.sign_key_name = name;
        self
    }

    /// Set the signing algorithm.
    #[must_use]
    pub fn with_sign_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.sign_algorithm = algorithm;
        self
    }

    /// Set the time tolerance in seconds. See [`SigningConfig::validate`].
    #[must_use]
    pub fn with_time_tolerance(mut self, seconds: u64) -> Self {
        self.time_tolerance = seconds;
        self
    }

    /// Replace the additional verification keys.
    #[must_use]
    pub fn with_verification_keys(mut self, keys: HashMap<String, String>) -> Self {
        self.verification_keys = keys;
        self
    }

    /// Replace the additional verification algorithms.
    #[must_use]
    pub fn with_verification_algorithms(
        mut self,
        algorithms: impl IntoIterator<Item = Algorithm>,
    ) -> Self {
        self.verification_algorithms = algorithms.into_iter().collect();
        self
    }

    /// Check the configuration for values that can never work.
    ///
    /// # Errors
    ///
    /// Returns an error message if the time tolerance is zero or the sign
    /// key name contains a wire delimiter.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.time_tolerance == 0 {
            return Err("Time tolerance must be greater than 0");
        }
        if let Some(name) = self.sign_key_name.as_deref() {
            if !is_valid_key_name(name) {
                return Err("Sign key name must not contain ':' or '|'");
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn sign_key(&self) -> Option<&str> {
        self.sign_key.as_deref()
    }

    /// The configured key name, without the default applied.
    #[must_use]
    pub fn sign_key_name(&self) -> Option<&str> {
        self.sign_key_name.as_deref()
    }

    /// The key name announced with signatures.
    #[must_use]
    pub fn effective_key_name(&self) -> &str {
        self.sign_key_name.as_deref().unwrap_or(DEFAULT_KEY_NAME)
    }

    #[must_use]
    pub fn sign_algorithm(&self) -> Algorithm {
        self.sign_algorithm
    }

    #[must_use]
    pub fn time_tolerance(&self) -> u64 {
        self.time_tolerance
    }

    #[must_use]
    pub fn verification_keys(&self) -> &HashMap<String, String> {
        &self.verification_keys
    }

    #[must_use]
    pub fn verification_algorithms(&self) -> &BTreeSet<Algorithm> {
        &self.verification_algorithms
    }

    /// Whether outgoing messages are signed and incoming ones must be.
    #[must_use]
    pub fn uses_signatures(&self) -> bool {
        self.sign_key.is_some()
    }

    /// Whether signatures made with `algorithm` are accepted.
    #[must_use]
    pub fn accepts_algorithm(&self, algorithm: Algorithm) -> bool {
        algorithm == self.sign_algorithm || self.verification_algorithms.contains(&algorithm)
    }

    /// Resolve the secret for a key name.
    ///
    /// The local sign key takes precedence over a verification key of the
    /// same name.
    #[must_use]
    pub fn verification_secret(&self, key_name: &str) -> Option<&str> {
        if let Some(key) = self.sign_key.as_deref() {
            if key_name == self.effective_key_name() {
                return Some(key);
            }
        }
        self.verification_keys.get(key_name).map(String::as_str)
    }

    /// Sign a message with the current time.
    #[must_use]
    pub fn sign(&self, name: &str, encoded_payload: &str) -> Option<SignatureBlock> {
        self.sign_at(name, encoded_payload, unix_now())
    }

    /// Sign a message as of `now` (unix seconds).
    ///
    /// Returns `None` when no sign key is configured.
    #[must_use]
    pub fn sign_at(&self, name: &str, encoded_payload: &str, now: i64) -> Option<SignatureBlock> {
        let key = self.sign_key.as_deref()?;
        let signature = self
            .sign_algorithm
            .mac_hex(key.as_bytes(), string_to_sign(name, now, encoded_payload).as_bytes());

        Some(SignatureBlock {
            algorithm: self.sign_algorithm.name().to_string(),
            key_name: self.effective_key_name().to_string(),
            timestamp: now,
            signature,
        })
    }

    /// Verify a received message against the current time.
    ///
    /// # Errors
    ///
    /// Returns the reason the message is refused.
    pub fn verify(&self, message: &WireMessage<'_>) -> Result<(), VerifyError> {
        self.verify_at(message, unix_now())
    }

    /// Verify a received message as of `now` (unix seconds).
    ///
    /// # Errors
    ///
    /// Returns the reason the message is refused.
    pub fn verify_at(&self, message: &WireMessage<'_>, now: i64) -> Result<(), VerifyError> {
        let name = message.name;

        let Some(field) = message.signature else {
            if self.uses_signatures() {
                return Err(VerifyError::Unauthenticated {
                    name: name.to_string(),
                });
            }
            return Ok(());
        };

        let fields = SignatureFields::parse(field);

        let algorithm = fields
            .algorithm
            .parse::<Algorithm>()
            .ok()
            .filter(|a| self.accepts_algorithm(*a))
            .ok_or_else(|| VerifyError::UnknownAlgorithm {
                name: name.to_string(),
                algorithm: fields.algorithm.to_string(),
            })?;

        let key_name = fields.key_name.unwrap_or_default();
        let secret = fields
            .key_name
            .and_then(|k| self.verification_secret(k))
            .ok_or_else(|| VerifyError::UnknownKey {
                name: name.to_string(),
                key_name: key_name.to_string(),
            })?;

        let raw_timestamp = fields.timestamp.unwrap_or_default();
        let timestamp: i64 = raw_timestamp
            .parse()
            .map_err(|_| VerifyError::InvalidTimestamp {
                name: name.to_string(),
                timestamp: raw_timestamp.to_string(),
            })?;

        if now.abs_diff(timestamp) > self.time_tolerance {
            return Err(VerifyError::TimestampOutOfTolerance {
                name: name.to_string(),
                timestamp,
                tolerance: self.time_tolerance,
                now,
            });
        }

        let invalid = || VerifyError::InvalidSignature {
            name: name.to_string(),
        };
        let signature = fields.signature.ok_or_else(invalid)?;
        let expected = algorithm.mac_hex(
            secret.as_bytes(),
            string_to_sign(name, timestamp, message.payload).as_bytes(),
        );

        if bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            Ok(())
        } else {
            Err(invalid())
        }
    }
}

/// Whether a key name can be carried in a signature field.
#[must_use]
pub fn is_valid_key_name(name: &str) -> bool {
    !name.contains(DELIMITER) && !name.contains(SIGNATURE_DELIMITER)
}

/// The MAC input for a message.
fn string_to_sign(name: &str, timestamp: i64, encoded_payload: &str) -> String {
    format!("{name}:{timestamp}:{encoded_payload}")
}

/// Current unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
