//! Shared error taxonomy.
//!
//! Validation and storage failures are real errors and always propagate.
//! Causal gaps and superseded siblings are steady-state conditions; the
//! engine reports them through its own outcome type, and the variants here
//! exist only for callers that must surface them.

use crate::id::Id;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Bad signature, unauthorized quorum or malformed payload.
    /// The offending oplog is permanently rejected.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The oplog's causal predecessor is not yet known locally.
    #[error("missing causal predecessor {0}")]
    CausalGap(Id),

    /// Underlying storage failure, propagated verbatim.
    #[error("storage failure: {0}")]
    Storage(String),

    /// The identifier's lock could not be acquired within the bound.
    #[error("lock timed out for {0}")]
    LockTimeout(Id),

    /// A peer reconciliation attempt exceeded its deadline.
    #[error("sync attempt timed out")]
    SyncTimeout,

    /// Requested record does not exist (or is not yet synced).
    #[error("not found")]
    NotFound,

    /// The record exists but every version was already deleted.
    #[error("already deleted")]
    AlreadyDeleted,

    /// A raw key failed to decode to the expected fixed width.
    #[error("invalid key width {0}")]
    InvalidKey(usize),

    /// An object status change violated the monotonic transition rule.
    #[error("invalid status transition")]
    InvalidTransition,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;

    #[test]
    fn test_display() {
        let id = Id::derive(b"c", Timestamp::from_millis(1), b"s");
        let msg = Error::CausalGap(id).to_string();
        assert!(msg.contains("missing causal predecessor"));
        assert!(Error::NotFound.to_string().contains("not found"));
    }
}
