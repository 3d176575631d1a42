//! Per-identifier lock registry.
//!
//! A process-wide table mapping an [`Id`] to a reader-writer lock. Entries
//! are created lazily on first use and never removed, so the table is
//! bounded by the number of live ids in the process. Acquisition is async
//! and retried with bounded backoff; a lock that stays contended past the
//! retry budget surfaces [`Error::LockTimeout`] to the caller.

use crate::error::{Error, Result};
use crate::id::Id;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// How long one acquisition attempt may wait before it counts as contended.
const ACQUIRE_SLICE: Duration = Duration::from_millis(10);

/// Retry attempts before escalating to [`Error::LockTimeout`].
const MAX_ATTEMPTS: u32 = 5;

/// Guard for exclusive access to one identifier.
pub type WriteGuard = OwnedRwLockWriteGuard<()>;

/// Guard for shared access to one identifier.
pub type ReadGuard = OwnedRwLockReadGuard<()>;

/// Process-wide exclusive/shared lock table keyed by [`Id`].
pub struct LockRegistry {
    locks: Mutex<HashMap<Id, Arc<RwLock<()>>>>,
    slice: Duration,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::with_slice(ACQUIRE_SLICE)
    }

    /// Custom acquisition slice, mainly for tests.
    pub fn with_slice(slice: Duration) -> Self {
        LockRegistry {
            locks: Mutex::new(HashMap::new()),
            slice,
        }
    }

    fn entry(&self, id: &Id) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        locks.entry(*id).or_default().clone()
    }

    /// Acquire the exclusive lock for `id`.
    pub async fn lock(&self, id: &Id) -> Result<WriteGuard> {
        let cell = self.entry(id);
        for attempt in 0..MAX_ATTEMPTS {
            match tokio::time::timeout(self.slice, cell.clone().write_owned()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => {
                    // Contended: back off linearly and retry.
                    tokio::time::sleep(self.slice * (attempt + 1)).await;
                }
            }
        }
        Err(Error::LockTimeout(*id))
    }

    /// Acquire the shared lock for `id`.
    pub async fn rlock(&self, id: &Id) -> Result<ReadGuard> {
        let cell = self.entry(id);
        for attempt in 0..MAX_ATTEMPTS {
            match tokio::time::timeout(self.slice, cell.clone().read_owned()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => {
                    tokio::time::sleep(self.slice * (attempt + 1)).await;
                }
            }
        }
        Err(Error::LockTimeout(*id))
    }

    /// Number of identifiers that ever acquired a lock.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}
