//! Time-ordered content identifiers.
//!
//! Every entity, object, oplog and key is named by a 32-byte [`Id`]. The
//! first 8 bytes are the big-endian creation time in milliseconds, the
//! remaining 24 bytes are a SHA-256 digest of (creator, timestamp, salt).
//! Plain lexicographic comparison therefore orders ids by creation time,
//! which the merkle bucketing and the sibling tie-break both rely on.

use crate::hash::Hasher;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte width of an [`Id`].
pub const SIZE_ID: usize = 32;

/// A fixed-size, globally unique, time-ordered identifier.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Id([u8; SIZE_ID]);

impl Id {
    /// Derive an id from creator material, a timestamp and a salt.
    ///
    /// Deterministic: the same inputs always produce the same id. Callers
    /// that need uniqueness supply a random salt via [`Id::generate`].
    pub fn derive(creator: &[u8], ts: Timestamp, salt: &[u8]) -> Self {
        let mut h = Hasher::new();
        h.update(creator);
        h.update(&ts.as_millis().to_be_bytes());
        h.update(salt);
        let digest = h.finalize();

        let mut bytes = [0u8; SIZE_ID];
        bytes[..8].copy_from_slice(&ts.as_millis().to_be_bytes());
        bytes[8..].copy_from_slice(&digest.as_bytes()[..SIZE_ID - 8]);
        Id(bytes)
    }

    /// Derive a fresh id with a random salt.
    pub fn generate(creator: &[u8], ts: Timestamp) -> Self {
        let salt: [u8; 16] = rand::random();
        Self::derive(creator, ts, &salt)
    }

    pub fn from_bytes(bytes: [u8; SIZE_ID]) -> Self {
        Id(bytes)
    }

    /// Decode from a raw key slice; fails if the width is wrong.
    pub fn from_slice(slice: &[u8]) -> Result<Self, crate::error::Error> {
        if slice.len() != SIZE_ID {
            return Err(crate::error::Error::InvalidKey(slice.len()));
        }
        let mut bytes = [0u8; SIZE_ID];
        bytes.copy_from_slice(slice);
        Ok(Id(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SIZE_ID] {
        &self.0
    }

    /// The creation time embedded in the id prefix.
    pub fn timestamp(&self) -> Timestamp {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        Timestamp::from_millis(u64::from_be_bytes(prefix))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Truncated display for logs.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({}..)", self.short())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
