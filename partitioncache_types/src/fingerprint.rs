//! Fragment fingerprints: a stable 40-hex-character SHA-1 digest over a
//! canonical fragment text (spec §3 "Fragment fingerprint").

use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// A 40-hex-character SHA-1 digest of a canonical fragment's text.
///
/// Two logically equivalent queries produce the same fingerprint, because
/// the canonicaliser normalises the text before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    /// Compute the fingerprint of already-canonicalised fragment text.
    pub fn of(canonical_text: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(canonical_text.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Render as the 40-character lowercase hex string used as a cache key.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Error parsing a [`Fingerprint`] from a string that isn't 40 hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("fingerprint must be 40 hex characters")]
pub struct ParseFingerprintError;

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(ParseFingerprintError);
        }
        let mut bytes = [0u8; 20];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let byte_str = std::str::from_utf8(chunk).map_err(|_| ParseFingerprintError)?;
            bytes[i] = u8::from_str_radix(byte_str, 16).map_err(|_| ParseFingerprintError)?;
        }
        Ok(Self(bytes))
    }
}

// Minimal hex encoding so we don't need to pull in the `hex` crate just for
// this one call site.
mod hex {
    pub fn encode(bytes: [u8; 20]) -> String {
        let mut s = String::with_capacity(40);
        for b in bytes {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_stable_length() {
        let a = Fingerprint::of("select 1");
        let b = Fingerprint::of("select 1");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 40);
    }

    #[test]
    fn different_text_different_fingerprint() {
        let a = Fingerprint::of("select 1");
        let b = Fingerprint::of("select 2");
        assert_ne!(a, b);
    }

    #[test]
    fn round_trips_through_display_and_parse() {
        let fp = Fingerprint::of("select * from t1 where t1.zip = 1001");
        let parsed: Fingerprint = fp.to_string().parse().unwrap();
        assert_eq!(fp, parsed);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!("not-a-fingerprint".parse::<Fingerprint>().is_err());
        assert!("abcd".parse::<Fingerprint>().is_err());
    }
}
