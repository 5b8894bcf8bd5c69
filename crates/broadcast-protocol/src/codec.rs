//! Codec for encoding and decoding broadcast messages.
//!
//! Messages are framed as `{name}:{signature}:{payload}`. The payload is
//! placed last since serialized JSON may contain the delimiter; a decoder
//! splits at most twice so the payload is never re-split.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::signature::SignatureBlock;

/// Field delimiter of the wire format.
pub const DELIMITER: char = ':';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message name contains the field delimiter.
    #[error("Message name \"{0}\" must not contain '{DELIMITER}'")]
    InvalidName(String),

    /// Payload could not be serialized.
    #[error("Payload encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Payload is not valid JSON.
    #[error("Payload decoding error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A message as split from its wire representation.
///
/// Fields borrow from the raw string. `signature` is `None` when the
/// signature field is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireMessage<'a> {
    /// Message name.
    pub name: &'a str,
    /// Raw signature field, if present.
    pub signature: Option<&'a str>,
    /// Encoded payload, empty when the message carries none.
    pub payload: &'a str,
}

impl<'a> WireMessage<'a> {
    /// Decode the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON.
    pub fn decode_payload(&self) -> Result<Option<Value>, ProtocolError> {
        decode_payload(self.payload)
    }
}

/// Check that a message name can be framed.
///
/// # Errors
///
/// Returns an error if the name contains the field delimiter.
pub fn validate_name(name: &str) -> Result<(), ProtocolError> {
    if name.contains(DELIMITER) {
        return Err(ProtocolError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Encode a message to its wire representation.
///
/// # Errors
///
/// Returns an error if the name contains the field delimiter.
pub fn encode(
    name: &str,
    signature: Option<&SignatureBlock>,
    encoded_payload: &str,
) -> Result<String, ProtocolError> {
    validate_name(name)?;

    let signature = signature.map(SignatureBlock::encode).unwrap_or_default();

    let mut out = String::with_capacity(name.len() + signature.len() + encoded_payload.len() + 2);
    out.push_str(name);
    out.push(DELIMITER);
    out.push_str(&signature);
    out.push(DELIMITER);
    out.push_str(encoded_payload);
    Ok(out)
}

/// Decode a wire message.
///
/// Missing trailing fields decode as empty.
#[must_use]
pub fn decode(raw: &str) -> WireMessage<'_> {
    let mut parts = raw.splitn(3, DELIMITER);
    let name = parts.next().unwrap_or_default();
    let signature = parts.next().filter(|s| !s.is_empty());
    let payload = parts.next().unwrap_or_default();

    WireMessage {
        name,
        signature,
        payload,
    }
}

/// Serialize a payload to its wire form.
///
/// Absent and `null` payloads encode as the empty string.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_payload(payload: Option<&Value>) -> Result<String, ProtocolError> {
    match payload {
        None | Some(Value::Null) => Ok(String::new()),
        Some(value) => serde_json::to_string(value).map_err(ProtocolError::Encode),
    }
}

/// Serialize any serializable value to its wire form.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_payload_from<T: Serialize + ?Sized>(payload: &T) -> Result<String, ProtocolError> {
    let value = serde_json::to_value(payload).map_err(ProtocolError::Encode)?;
    encode_payload(Some(&value))
}

/// Deserialize a wire payload. The empty string decodes as `None`.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON.
pub fn decode_payload(encoded: &str) -> Result<Option<Value>, ProtocolError> {
    if encoded.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(encoded)
        .map(Some)
        .map_err(ProtocolError::Decode)
}
