//! Digest newtypes.
//!
//! `Sha256Digest` verifies upstream source archives. `DagHash` is the
//! BLAKE3 identity of a concrete spec node.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of the hash prefix embedded in install prefixes.
pub const PREFIX_HASH_LEN: usize = 32;

/// Error produced when a digest string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} digest '{value}': {reason}")]
pub struct DigestError {
    kind: &'static str,
    value: String,
    reason: String,
}

fn validate_hex(kind: &'static str, s: &str) -> Result<String, DigestError> {
    if s.len() != 64 {
        return Err(DigestError {
            kind,
            value: s.to_string(),
            reason: format!("expected 64 hex characters, got {}", s.len()),
        });
    }
    if !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DigestError {
            kind,
            value: s.to_string(),
            reason: "contains non-hex characters".to_string(),
        });
    }
    Ok(s.to_ascii_lowercase())
}

/// A validated SHA256 digest (64 hex characters).
///
/// Validated at deserialization time so malformed checksums in recipes are
/// rejected when the recipe is loaded, not when the archive is verified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Create a new `Sha256Digest`, validating the input.
    ///
    /// Accepts strings with or without a `sha256:` prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the hex portion is not exactly 64 ASCII hex characters.
    pub fn new(s: impl AsRef<str>) -> Result<Self, DigestError> {
        let s = s.as_ref();
        let hex = s.strip_prefix("sha256:").unwrap_or(s);
        validate_hex("sha256", hex).map(Self)
    }

    /// Hash a byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Finish a streaming hasher.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// Get the digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// BLAKE3 identity hash of a concrete spec node.
///
/// Two concrete nodes with the same `DagHash` are the same node: it keys the
/// install prefix, the install database and graph deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DagHash(String);

impl DagHash {
    /// Compute the hash of a canonical byte encoding.
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    /// Parse a stored hash.
    ///
    /// # Errors
    ///
    /// Returns an error unless `s` is 64 hex characters.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        validate_hex("dag", s).map(Self)
    }

    /// Full 64-character hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix used in install directory names.
    pub fn prefix_component(&self) -> &str {
        &self.0[..PREFIX_HASH_LEN]
    }

    /// Seven-character abbreviation for display.
    pub fn short(&self) -> &str {
        &self.0[..7]
    }
}

impl<'de> Deserialize<'de> for DagHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for DagHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_accepts_prefix_and_lowercases() {
        let upper = "A".repeat(64);
        let digest = Sha256Digest::new(format!("sha256:{upper}")).unwrap();
        assert_eq!(digest.as_str(), "a".repeat(64));
    }

    #[test]
    fn sha256_rejects_bad_input() {
        assert!(Sha256Digest::new("abc").is_err());
        assert!(Sha256Digest::new("z".repeat(64)).is_err());
        let err = serde_json::from_str::<Sha256Digest>("\"1234\"").unwrap_err();
        assert!(err.to_string().contains("expected 64 hex characters"));
    }

    #[test]
    fn sha256_of_bytes_matches_known_value() {
        assert_eq!(
            Sha256Digest::of_bytes(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn dag_hash_prefixes() {
        let h = DagHash::compute(b"zlib");
        assert_eq!(h.as_str().len(), 64);
        assert_eq!(h.prefix_component().len(), PREFIX_HASH_LEN);
        assert_eq!(h.short().len(), 7);
        assert_eq!(DagHash::parse(h.as_str()).unwrap(), h);
    }
}
