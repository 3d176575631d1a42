//! Snapshot construction and persisted generation metadata.
//!
//! A [`TreeSnapshot`] is rebuilt wholesale from the confirmed oplog stream
//! on a fixed cadence, replacing the prior snapshot; nothing is patched
//! incrementally. Only oplogs older than a safety cutoff are summarized,
//! so a bucket never changes after both sides could have sealed it.
//! Generation, sync and failure timestamps plus the summarized-oplog count
//! are persisted per (entity, category) so a restarted node knows where
//! its reconciliation left off.

use crate::node::{Level, MerkleNode};
use opweave_oplog::{Category, LogStore, Oplog};
use opweave_store::kv::{storage_err, KvStore};
use opweave_types::{Addr, Id, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default safety cutoff: only oplogs at least this old are summarized.
pub const SYNC_CUTOFF: Duration = Duration::from_secs(3_600);

/// An immutable multi-resolution summary of one confirmed stream.
///
/// Peers never exchange whole snapshots; the sync protocol ships node
/// lists and leaf lists, so this stays a local in-memory structure.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TreeSnapshot {
    /// Every bucket with at least one descendant oplog, keyed by
    /// (level, bucket start).
    nodes: BTreeMap<(Level, Timestamp), MerkleNode>,
    /// Hour-bucket contents: (oplog id, oplog hash), sorted by hash.
    leaves: BTreeMap<Timestamp, Vec<(Id, Addr)>>,
    /// Upper bound (exclusive) of the summarized range.
    pub cutoff: Timestamp,
}

impl TreeSnapshot {
    /// Summarize `logs` (already filtered to confirmed-and-older-than-
    /// cutoff) into a fresh snapshot.
    pub fn build(logs: &[Oplog], cutoff: Timestamp) -> Self {
        let mut leaves: BTreeMap<Timestamp, Vec<(Id, Addr)>> = BTreeMap::new();
        for log in logs {
            let bucket = Level::Hour.bucket_start(log.create_ts);
            leaves.entry(bucket).or_default().push((log.id, log.hash));
        }

        let mut nodes = BTreeMap::new();
        for (ts, entries) in &mut leaves {
            entries.sort_by_key(|(_, hash)| *hash);
            let hashes: Vec<Addr> = entries.iter().map(|(_, hash)| *hash).collect();
            nodes.insert((Level::Hour, *ts), MerkleNode::leaf(*ts, &hashes));
        }

        // Roll finer buckets up into their parents, level by level.
        let mut level = Level::Hour;
        while let Some(coarser) = level.coarser() {
            let mut groups: BTreeMap<Timestamp, Vec<MerkleNode>> = BTreeMap::new();
            for ((l, _), node) in nodes.iter().filter(|((l, _), _)| *l == level) {
                debug_assert_eq!(*l, level);
                groups
                    .entry(coarser.bucket_start(node.ts))
                    .or_default()
                    .push(*node);
            }
            for (ts, children) in groups {
                nodes.insert((coarser, ts), MerkleNode::parent(coarser, ts, &children));
            }
            level = coarser;
        }

        TreeSnapshot {
            nodes,
            leaves,
            cutoff,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total summarized oplog count.
    pub fn oplog_count(&self) -> usize {
        self.leaves.values().map(|v| v.len()).sum()
    }

    /// All buckets at one level, in time order.
    pub fn nodes_at(&self, level: Level) -> Vec<MerkleNode> {
        self.nodes
            .range((level, Timestamp::from_millis(0))..=(level, Timestamp::from_millis(u64::MAX)))
            .map(|(_, node)| *node)
            .collect()
    }

    pub fn node(&self, level: Level, ts: Timestamp) -> Option<MerkleNode> {
        self.nodes.get(&(level, ts)).copied()
    }

    /// Child buckets of one coarser bucket.
    pub fn children_of(&self, level: Level, ts: Timestamp) -> Vec<MerkleNode> {
        let Some(finer) = level.finer() else {
            return Vec::new();
        };
        let end = ts.saturating_add(level.width());
        self.nodes_at(finer)
            .into_iter()
            .filter(|n| n.ts >= ts && n.ts < end)
            .collect()
    }

    /// The (id, hash) pairs of one Hour bucket.
    pub fn leaf_entries(&self, ts: Timestamp) -> Vec<(Id, Addr)> {
        self.leaves.get(&ts).cloned().unwrap_or_default()
    }

    /// Every summarized oplog id, for the empty-peer degradation path.
    pub fn all_ids(&self) -> Vec<Id> {
        self.leaves
            .values()
            .flat_map(|v| v.iter().map(|(id, _)| *id))
            .collect()
    }
}

/// Persisted generation/sync bookkeeping per (entity, category).
#[derive(Clone)]
pub struct MetaStore {
    kv: Arc<dyn KvStore>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMeta {
    pub generated_at: Option<Timestamp>,
    pub last_sync_at: Option<Timestamp>,
    pub last_fail_at: Option<Timestamp>,
    pub oplog_count: u64,
}

impl MetaStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        MetaStore { kv }
    }

    fn key(category: Category, entity_id: &Id) -> Vec<u8> {
        let mut key = Vec::with_capacity(4 + 32);
        key.extend_from_slice(&category.meta_prefix());
        key.extend_from_slice(entity_id.as_bytes());
        key
    }

    pub fn load(&self, category: Category, entity_id: &Id) -> Result<TreeMeta> {
        match self.kv.get(&Self::key(category, entity_id))? {
            Some(value) => serde_json::from_slice(&value).map_err(storage_err),
            None => Ok(TreeMeta::default()),
        }
    }

    pub fn store(&self, category: Category, entity_id: &Id, meta: &TreeMeta) -> Result<()> {
        let value = serde_json::to_vec(meta).map_err(storage_err)?;
        self.kv.put(&Self::key(category, entity_id), &value)
    }
}

/// Regeneration knobs.
#[derive(Clone, Copy, Debug)]
pub struct MerkleConfig {
    /// Only oplogs older than this are summarized.
    pub cutoff: Duration,
}

impl Default for MerkleConfig {
    fn default() -> Self {
        MerkleConfig {
            cutoff: SYNC_CUTOFF,
        }
    }
}

/// The live merkle summary of one (entity, category) stream.
pub struct MerkleTree {
    entity_id: Id,
    category: Category,
    logs: LogStore,
    meta: MetaStore,
    config: MerkleConfig,
    snapshot: TreeSnapshot,
}

impl MerkleTree {
    pub fn new(
        kv: Arc<dyn KvStore>,
        entity_id: Id,
        category: Category,
        config: MerkleConfig,
    ) -> Self {
        MerkleTree {
            entity_id,
            category,
            logs: LogStore::new(kv.clone()),
            meta: MetaStore::new(kv),
            config,
            snapshot: TreeSnapshot::default(),
        }
    }

    pub fn snapshot(&self) -> &TreeSnapshot {
        &self.snapshot
    }

    pub fn meta(&self) -> Result<TreeMeta> {
        self.meta.load(self.category, &self.entity_id)
    }

    /// Rebuild the snapshot from the confirmed stream as of `now`,
    /// replacing the prior one, and persist the generation bookkeeping.
    pub fn regenerate(&mut self, now: Timestamp) -> Result<&TreeSnapshot> {
        let cutoff = now.saturating_sub(self.config.cutoff);
        let confirmed = self
            .logs
            .confirmed_until(self.category, &self.entity_id, cutoff)?;
        self.snapshot = TreeSnapshot::build(&confirmed, cutoff);

        let mut meta = self.meta.load(self.category, &self.entity_id)?;
        meta.generated_at = Some(now);
        meta.oplog_count = self.snapshot.oplog_count() as u64;
        self.meta.store(self.category, &self.entity_id, &meta)?;

        debug!(
            entity = %self.entity_id.short(),
            category = ?self.category,
            oplogs = self.snapshot.oplog_count(),
            "merkle snapshot regenerated"
        );
        Ok(&self.snapshot)
    }

    /// Record a completed reconciliation.
    pub fn mark_synced(&self, at: Timestamp) -> Result<()> {
        let mut meta = self.meta.load(self.category, &self.entity_id)?;
        meta.last_sync_at = Some(at);
        self.meta.store(self.category, &self.entity_id, &meta)
    }

    /// Record a failed reconciliation attempt.
    pub fn mark_failed(&self, at: Timestamp) -> Result<()> {
        let mut meta = self.meta.load(self.category, &self.entity_id)?;
        meta.last_fail_at = Some(at);
        self.meta.store(self.category, &self.entity_id, &meta)
    }
}
