//! Millisecond-resolution timestamps.
//!
//! Every identifier, oplog and merkle bucket is anchored to one of these.
//! The value is unix time in milliseconds, totally ordered and serializable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unix time in milliseconds.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp (unix epoch).
    pub const ZERO: Timestamp = Timestamp(0);

    /// Current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(millis)
    }

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Whole seconds since the epoch.
    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Shift backwards, saturating at the epoch.
    pub fn saturating_sub(&self, d: Duration) -> Self {
        Timestamp(self.0.saturating_sub(d.as_millis() as u64))
    }

    /// Shift forwards.
    pub fn saturating_add(&self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_millis() as u64))
    }

    /// Apply a signed millisecond offset (peer clock-skew correction).
    pub fn offset(&self, millis: i64) -> Self {
        if millis >= 0 {
            Timestamp(self.0.saturating_add(millis as u64))
        } else {
            Timestamp(self.0.saturating_sub(millis.unsigned_abs()))
        }
    }

    /// Round down to the start of a bucket of the given width.
    pub fn bucket_start(&self, width: Duration) -> Self {
        let w = width.as_millis() as u64;
        if w == 0 {
            return *self;
        }
        Timestamp(self.0 - self.0 % w)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
