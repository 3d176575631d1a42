//! Content addressing for oplogs and merkle nodes.
//!
//! A 32-byte SHA-256 digest serves both as the tamper-evidence hash on an
//! oplog and as the address of a merkle tree node.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Addr([u8; 32]);

impl Addr {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Addr(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The all-zero address, used for empty merkle buckets.
    pub fn zero() -> Self {
        Addr([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Truncated display for logs (first 8 hex chars).
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({}..)", self.short())
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Default for Addr {
    fn default() -> Self {
        Addr::zero()
    }
}

/// Incremental SHA-256 hasher producing an [`Addr`].
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Hasher {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> Addr {
        let digest = self.inner.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Addr(bytes)
    }

    /// One-shot digest.
    pub fn digest(data: &[u8]) -> Addr {
        let mut h = Self::new();
        h.update(data);
        h.finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_deterministic() {
        assert_eq!(Hasher::digest(b"oplog"), Hasher::digest(b"oplog"));
        assert_ne!(Hasher::digest(b"oplog"), Hasher::digest(b"opweave"));
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut h = Hasher::new();
        h.update(b"op");
        h.update(b"log");
        assert_eq!(h.finalize(), Hasher::digest(b"oplog"));
    }

    #[test]
    fn test_zero() {
        assert!(Addr::zero().is_zero());
        assert!(!Hasher::digest(b"x").is_zero());
    }

    #[test]
    fn test_hex_length() {
        let a = Hasher::digest(b"hex");
        assert_eq!(a.to_hex().len(), 64);
        assert_eq!(a.short().len(), 8);
    }
}
