//! Signature blocks.
//!
//! The signature field of a message is `{algorithm}|{key name}|{timestamp}|{mac}`.

/// Delimiter between signature block fields.
pub const SIGNATURE_DELIMITER: char = '|';

/// Key name used when none is configured.
pub const DEFAULT_KEY_NAME: &str = "default";

/// A signature authenticating a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    /// Name of the HMAC algorithm.
    pub algorithm: String,
    /// Name of the shared secret used.
    pub key_name: String,
    /// Unix seconds at signing time.
    pub timestamp: i64,
    /// Hex encoded MAC.
    pub signature: String,
}

impl SignatureBlock {
    /// Encode the block as a signature field.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}{d}{}{d}{}{d}{}",
            self.algorithm,
            self.key_name,
            self.timestamp,
            self.signature,
            d = SIGNATURE_DELIMITER
        )
    }
}

/// The raw fields of a received signature.
///
/// Fields are kept unparsed so verification can report exactly which one
/// was unacceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureFields<'a> {
    pub algorithm: &'a str,
    pub key_name: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub signature: Option<&'a str>,
}

impl<'a> SignatureFields<'a> {
    /// Split a signature field into at most four parts.
    #[must_use]
    pub fn parse(field: &'a str) -> Self {
        let mut parts = field.splitn(4, SIGNATURE_DELIMITER);
        let non_empty = |p: Option<&'a str>| p.filter(|s| !s.is_empty());

        Self {
            algorithm: parts.next().unwrap_or_default(),
            key_name: non_empty(parts.next()),
            timestamp: non_empty(parts.next()),
            signature: non_empty(parts.next()),
        }
    }
}
