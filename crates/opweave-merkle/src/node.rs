//! Merkle node definition and bucket arithmetic.
//!
//! Confirmed oplogs are summarized at four fixed-width resolutions. An Hour
//! bucket's address hashes the sorted oplog hashes inside it; each coarser
//! bucket hashes its children's addresses. Bucket widths nest exactly
//! (24 hours per day, 30 days per month, 12 months per year), so every
//! bucket has one parent at the next level up and both peers compute the
//! same partition from the same oplog set.

use opweave_types::{Addr, Hasher, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resolution of one merkle bucket, finest to coarsest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    Hour,
    Day,
    Month,
    Year,
}

impl Level {
    /// Bucket width. Calendar-shaped but fixed-width: months are 30 days
    /// and years 12 such months, so buckets nest without remainders.
    pub fn width(&self) -> Duration {
        match self {
            Level::Hour => Duration::from_secs(3_600),
            Level::Day => Duration::from_secs(24 * 3_600),
            Level::Month => Duration::from_secs(30 * 24 * 3_600),
            Level::Year => Duration::from_secs(12 * 30 * 24 * 3_600),
        }
    }

    /// The next finer level, `None` below Hour.
    pub fn finer(&self) -> Option<Level> {
        match self {
            Level::Year => Some(Level::Month),
            Level::Month => Some(Level::Day),
            Level::Day => Some(Level::Hour),
            Level::Hour => None,
        }
    }

    /// The next coarser level, `None` above Year.
    pub fn coarser(&self) -> Option<Level> {
        match self {
            Level::Hour => Some(Level::Day),
            Level::Day => Some(Level::Month),
            Level::Month => Some(Level::Year),
            Level::Year => None,
        }
    }

    /// The start of the bucket containing `ts` at this level.
    pub fn bucket_start(&self, ts: Timestamp) -> Timestamp {
        ts.bucket_start(self.width())
    }

    /// Starts of the finer buckets contained in the bucket at `ts`.
    /// Purely arithmetic, so both peers enumerate the same children
    /// without exchanging them.
    pub fn child_buckets(&self, ts: Timestamp) -> Vec<Timestamp> {
        let Some(finer) = self.finer() else {
            return Vec::new();
        };
        let n = self.width().as_millis() / finer.width().as_millis();
        (0..n as u32)
            .map(|i| ts.saturating_add(finer.width() * i))
            .collect()
    }

    /// Coarsest-to-finest traversal order for reconciliation.
    pub const DESCENDING: [Level; 4] = [Level::Year, Level::Month, Level::Day, Level::Hour];
}

/// One summarized bucket: its resolution, start time, address and the
/// number of children it covers (oplogs for Hour, buckets otherwise).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    pub level: Level,
    pub ts: Timestamp,
    pub addr: Addr,
    pub n_children: u32,
}

impl MerkleNode {
    /// Hash a sorted slice of oplog hashes into an Hour-bucket node.
    pub fn leaf(ts: Timestamp, oplog_hashes: &[Addr]) -> Self {
        let mut h = Hasher::new();
        for addr in oplog_hashes {
            h.update(addr.as_bytes());
        }
        MerkleNode {
            level: Level::Hour,
            ts,
            addr: h.finalize(),
            n_children: oplog_hashes.len() as u32,
        }
    }

    /// Hash child bucket addresses (in time order) into a coarser node.
    pub fn parent(level: Level, ts: Timestamp, children: &[MerkleNode]) -> Self {
        let mut h = Hasher::new();
        for child in children {
            h.update(&child.ts.as_millis().to_be_bytes());
            h.update(child.addr.as_bytes());
        }
        MerkleNode {
            level,
            ts,
            addr: h.finalize(),
            n_children: children.len() as u32,
        }
    }
}
