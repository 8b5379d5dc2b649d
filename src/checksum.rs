//! SHA-256 checksums and their textual hex encoding.
//!
//! A single fixed SHA-256 digest type, rather than a multi-algorithm enum --
//! every object in this store is addressed the same way.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::Error;

/// A 32-byte SHA-256 digest, the identity of every object in the store.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Wrap a raw 32-byte digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Checksum {
        Checksum(bytes)
    }

    /// Compute the checksum of a single in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Checksum {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Checksum(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex representation, as used for object paths and refs.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for byte in &self.0 {
            s.push_str(&format!("{:02x}", byte));
        }
        s
    }

    /// Parse a 64-character lowercase hex string.
    pub fn from_hex(s: &str) -> Result<Checksum, Error> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidFormat {
                context: "checksum".into(),
                detail: format!("{:?} is not 64 hex characters", s),
            });
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| {
                Error::InvalidFormat {
                    context: "checksum".into(),
                    detail: format!("{:?} contains invalid hex", s),
                }
            })?;
        }
        Ok(Checksum(bytes))
    }

    /// First two hex characters -- the loose-object shard directory name.
    pub fn shard(&self) -> String {
        format!("{:02x}", self.0[0])
    }

    /// Remaining 62 hex characters -- the loose-object file stem.
    pub fn remainder(&self) -> String {
        let hex = self.to_hex();
        hex[2..].to_string()
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Checksum {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Checksum::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_bytes_known_vector() {
        // SHA-256("") is a well known test vector.
        let sum = Checksum::of_bytes(b"");
        assert_eq!(
            sum.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let sum = Checksum::of_bytes(b"hello");
        let hex = sum.to_hex();
        let parsed = Checksum::from_hex(&hex).unwrap();
        assert_eq!(sum, parsed);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(Checksum::from_hex("too-short").is_err());
        assert!(Checksum::from_hex(&"z".repeat(64)).is_err());
    }

    #[test]
    fn test_shard_and_remainder() {
        let sum = Checksum::of_bytes(b"hello");
        let hex = sum.to_hex();
        assert_eq!(sum.shard(), hex[0..2].to_string());
        assert_eq!(sum.remainder(), hex[2..].to_string());
    }

    #[test]
    fn test_ordering_is_lexicographic_on_bytes() {
        let a = Checksum::from_bytes([0u8; 32]);
        let mut b_bytes = [0u8; 32];
        b_bytes[31] = 1;
        let b = Checksum::from_bytes(b_bytes);
        assert!(a < b);
    }
}
