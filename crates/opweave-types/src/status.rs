//! Lifecycle status codes for objects and oplogs.

use serde::{Deserialize, Serialize};

/// Status of a replicated object or an oplog.
///
/// Objects move monotonically `Init -> Pending -> Alive -> Deleted ->
/// Terminal`, with the single exception that `Alive` and `Migrated` may
/// alternate during multi-device migration. `Internal` and `Invalid` are
/// oplog-only outcomes: `Internal` marks a superseded sibling kept for
/// audit, `Invalid` a permanently rejected log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Init,
    Pending,
    Alive,
    Internal,
    Invalid,
    Migrated,
    Deleted,
    Terminal,
}

impl Status {
    /// Rank used for the monotonicity check.
    fn rank(&self) -> u8 {
        match self {
            Status::Init => 0,
            Status::Pending => 1,
            Status::Alive => 2,
            Status::Internal => 3,
            Status::Invalid => 3,
            Status::Migrated => 4,
            Status::Deleted => 5,
            Status::Terminal => 6,
        }
    }

    /// Whether an object may move from `self` to `next`.
    ///
    /// Transitions are monotonic by rank, except that a migrated record may
    /// come back alive when the owning device set changes again.
    pub fn can_become(&self, next: Status) -> bool {
        if *self == Status::Migrated && next == Status::Alive {
            return true;
        }
        next.rank() >= self.rank()
    }

    /// Alive or migrated records are readable application state.
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Alive | Status::Migrated)
    }

    /// No further transitions expected.
    pub fn is_final(&self) -> bool {
        matches!(self, Status::Terminal)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Init
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_forward() {
        assert!(Status::Init.can_become(Status::Pending));
        assert!(Status::Pending.can_become(Status::Alive));
        assert!(Status::Alive.can_become(Status::Deleted));
        assert!(Status::Deleted.can_become(Status::Terminal));
    }

    #[test]
    fn test_no_regression() {
        assert!(!Status::Alive.can_become(Status::Pending));
        assert!(!Status::Deleted.can_become(Status::Alive));
        assert!(!Status::Terminal.can_become(Status::Deleted));
    }

    #[test]
    fn test_migration_exception() {
        assert!(Status::Alive.can_become(Status::Migrated));
        assert!(Status::Migrated.can_become(Status::Alive));
        assert!(!Status::Deleted.can_become(Status::Migrated));
    }
}
