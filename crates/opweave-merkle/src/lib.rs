//! Multi-resolution merkle summaries for oplog anti-entropy.
//!
//! Confirmed oplog streams are summarized into fixed-width time buckets at
//! four resolutions; two peers discover their divergence by walking the
//! levels coarsest-first and finish with explicit leaf lists. This crate
//! is transport-free: `opweave-node` moves the request/response types and
//! feeds the resulting fetch plans back into the oplog engine.

pub mod node;
pub mod sync;
pub mod tree;

pub use node::{Level, MerkleNode};
pub use sync::{
    answer_leaf_list, answer_node_list, mismatched_buckets, reconcile, LeafListRequest,
    LeafListResponse, NodeListRequest, NodeListResponse, SyncError, SyncPlan,
};
pub use tree::{MerkleConfig, MerkleTree, MetaStore, TreeMeta, TreeSnapshot, SYNC_CUTOFF};
