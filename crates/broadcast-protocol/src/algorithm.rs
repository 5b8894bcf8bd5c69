//! Keyed-hash algorithms usable for message signatures.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// An algorithm name that does not map to a supported HMAC.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unsupported signature algorithm: {0}")]
pub struct UnknownAlgorithm(pub String);

/// HMAC hash algorithms, identified on the wire by their lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Algorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Sha512_256,
    Sha3_256,
    Sha3_384,
    Sha3_512,
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::Sha256
    }
}

impl Algorithm {
    /// All supported algorithms.
    pub const ALL: [Algorithm; 8] = [
        Algorithm::Sha224,
        Algorithm::Sha256,
        Algorithm::Sha384,
        Algorithm::Sha512,
        Algorithm::Sha512_256,
        Algorithm::Sha3_256,
        Algorithm::Sha3_384,
        Algorithm::Sha3_512,
    ];

    /// The name used in signature blocks.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Algorithm::Sha224 => "sha224",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
            Algorithm::Sha512_256 => "sha512/256",
            Algorithm::Sha3_256 => "sha3-256",
            Algorithm::Sha3_384 => "sha3-384",
            Algorithm::Sha3_512 => "sha3-512",
        }
    }

    /// Compute the HMAC of `data` under `secret`, hex encoded.
    #[must_use]
    pub fn mac_hex(self, secret: &[u8], data: &[u8]) -> String {
        match self {
            Algorithm::Sha224 => mac::<Hmac<sha2::Sha224>>(secret, data),
            Algorithm::Sha256 => mac::<Hmac<sha2::Sha256>>(secret, data),
            Algorithm::Sha384 => mac::<Hmac<sha2::Sha384>>(secret, data),
            Algorithm::Sha512 => mac::<Hmac<sha2::Sha512>>(secret, data),
            Algorithm::Sha512_256 => mac::<Hmac<sha2::Sha512_256>>(secret, data),
            Algorithm::Sha3_256 => mac::<Hmac<sha3::Sha3_256>>(secret, data),
            Algorithm::Sha3_384 => mac::<Hmac<sha3::Sha3_384>>(secret, data),
            Algorithm::Sha3_512 => mac::<Hmac<sha3::Sha3_512>>(secret, data),
        }
    }
}

fn mac<M: Mac + hmac::digest::KeyInit>(secret: &[u8], data: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("HMAC key size is always valid"));
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| UnknownAlgorithm(s.to_string()))
    }
}

impl From<Algorithm> for String {
    fn from(a: Algorithm) -> String {
        a.name().to_string()
    }
}

impl TryFrom<String> for Algorithm {
    type Error = UnknownAlgorithm;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
