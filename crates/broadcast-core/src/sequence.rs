//! Broadcast sequence counter.
//!
//! Every publish increments a counter stored next to the channel, in the
//! same atomic batch as the publish itself. A listener compares the value
//! captured when it started listening with a value it saw earlier to find
//! out whether it missed messages in between. Missed content is gone; only
//! the gap is detectable.

use sysbroadcast_transport::{Command, TransportError};

/// Default prefix of the counter key.
pub const DEFAULT_SEQUENCE_PREFIX: &str = "system_broadcast_sequence_";

/// The counter key for a channel.
#[must_use]
pub fn sequence_key(prefix: &str, channel: &str) -> String {
    format!("{prefix}{channel}")
}

/// The atomic batch publishing `wire` and advancing the counter.
#[must_use]
pub fn publish_batch(channel: &str, key: &str, wire: String) -> Vec<Command> {
    vec![Command::publish(channel, wire), Command::increment(key)]
}

/// Parse a stored counter value. An absent key is the zero baseline.
///
/// # Errors
///
/// Returns an error if the stored value is not a non-negative integer.
pub fn parse_sequence(raw: Option<&str>) -> Result<u64, TransportError> {
    match raw {
        None => Ok(0),
        Some(value) => value.trim().parse().map_err(|_| {
            TransportError::Command(format!("sequence value \"{value}\" is not a counter"))
        }),
    }
}

/// Number of publishes between two captured sequence values.
///
/// Returns zero if `current` is not ahead of `since`.
#[must_use]
pub fn missed_since(since: u64, current: u64) -> u64 {
    current.saturating_sub(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_key() {
        assert_eq!(
            sequence_key(DEFAULT_SEQUENCE_PREFIX, "system"),
            "system_broadcast_sequence_system"
        );
    }

    #[test]
    fn test_publish_batch_order() {
        let batch = publish_batch("ch", "seq_ch", "msg::".to_string());
        assert_eq!(
            batch,
            vec![Command::publish("ch", "msg::"), Command::increment("seq_ch")]
        );
    }

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence(None).unwrap(), 0);
        assert_eq!(parse_sequence(Some("17")).unwrap(), 17);
        assert!(parse_sequence(Some("-1")).is_err());
        assert!(parse_sequence(Some("seventeen")).is_err());
    }

    #[test]
    fn test_missed_since() {
        assert_eq!(missed_since(5, 8), 3);
        assert_eq!(missed_since(5, 5), 0);
        assert_eq!(missed_since(5, 2), 0);
    }
}
