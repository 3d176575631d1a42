//! Divergence discovery between two merkle summaries.
//!
//! Reconciliation walks the levels coarsest-first: compare Year buckets,
//! recurse into mismatched buckets' children, and at Hour level exchange
//! explicit (oplog id, hash) lists. Each level costs one request/response
//! round, so a small delta is located in at most one round per level plus
//! the final leaf exchange. A peer with an empty tree degrades to
//! fetch-everything in a single round.
//!
//! Clock skew is handled with the peer-supplied offset: bucket timestamps
//! are objective (they come from oplog creation times), so skew only moves
//! the horizon below which both sides have sealed their buckets.

use crate::node::{Level, MerkleNode};
use crate::tree::TreeSnapshot;
use opweave_types::{Addr, Id, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Reconciliation failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// The walk did not converge within the round budget.
    RoundBudget(usize),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::RoundBudget(rounds) => {
                write!(f, "reconciliation exceeded {} rounds", rounds)
            }
        }
    }
}

impl std::error::Error for SyncError {}

/// Wire shape of one level exchange: the responder's nodes for the
/// requested buckets (all buckets when `buckets` is empty).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeListRequest {
    pub level: Level,
    pub buckets: Vec<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeListResponse {
    pub level: Level,
    pub nodes: Vec<MerkleNode>,
}

/// Wire shape of the final leaf exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeafListRequest {
    pub buckets: Vec<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeafListResponse {
    pub buckets: Vec<(Timestamp, Vec<(Id, Addr)>)>,
}

/// Responder side: answer a node-list request from the local snapshot.
pub fn answer_node_list(snapshot: &TreeSnapshot, req: &NodeListRequest) -> NodeListResponse {
    let nodes = if req.buckets.is_empty() {
        snapshot.nodes_at(req.level)
    } else {
        req.buckets
            .iter()
            .filter_map(|ts| snapshot.node(req.level, *ts))
            .collect()
    };
    NodeListResponse {
        level: req.level,
        nodes,
    }
}

/// Responder side: answer a leaf-list request.
pub fn answer_leaf_list(snapshot: &TreeSnapshot, req: &LeafListRequest) -> LeafListResponse {
    LeafListResponse {
        buckets: req
            .buckets
            .iter()
            .map(|ts| (*ts, snapshot.leaf_entries(*ts)))
            .collect(),
    }
}

/// What each side must fetch, plus the rounds the walk took.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Ids the local side is missing.
    pub missing_local: Vec<Id>,
    /// Ids the remote side is missing.
    pub missing_remote: Vec<Id>,
    pub rounds: usize,
}

impl SyncPlan {
    pub fn is_converged(&self) -> bool {
        self.missing_local.is_empty() && self.missing_remote.is_empty()
    }
}

/// Buckets (at one level) where the two node lists disagree. The horizon
/// seals at leaf granularity only: an Hour bucket is comparable once its
/// end lies at or before the horizon, while coarser buckets always
/// compare, because the still-open day/month/year contains sealed hours
/// that would otherwise stay invisible.
pub fn mismatched_buckets(
    local: &[MerkleNode],
    remote: &[MerkleNode],
    level: Level,
    horizon: Timestamp,
) -> Vec<Timestamp> {
    let comparable =
        |ts: Timestamp| level != Level::Hour || ts.saturating_add(level.width()) <= horizon;
    let index = |nodes: &[MerkleNode]| -> BTreeMap<Timestamp, MerkleNode> {
        nodes
            .iter()
            .filter(|n| n.level == level && comparable(n.ts))
            .map(|n| (n.ts, *n))
            .collect()
    };
    let ours = index(local);
    let theirs = index(remote);

    let all: BTreeSet<Timestamp> = ours.keys().chain(theirs.keys()).copied().collect();
    all.into_iter()
        .filter(|ts| match (ours.get(ts), theirs.get(ts)) {
            (Some(a), Some(b)) => a.addr != b.addr,
            _ => true,
        })
        .collect()
}

/// Walk two snapshots down to the diverging oplog ids. `peer_offset_ms`
/// is the peer-reported clock offset (peer clock minus local clock),
/// applied to the peer's cutoff so the comparable horizon is honest on
/// both sides. The simulated transport costs one round per level exchange
/// and one for the leaf lists; `max_rounds` bounds the walk.
pub fn reconcile(
    local: &TreeSnapshot,
    remote: &TreeSnapshot,
    peer_offset_ms: i64,
    max_rounds: usize,
) -> Result<SyncPlan, SyncError> {
    let horizon = local.cutoff.min(remote.cutoff.offset(-peer_offset_ms));
    let sealed_id = |id: &Id| id.timestamp().saturating_add(Level::Hour.width()) <= horizon;

    // A freshly joined peer has nothing: skip the walk and ship the world.
    if local.is_empty() || remote.is_empty() {
        let mut plan = SyncPlan {
            rounds: 1,
            ..SyncPlan::default()
        };
        plan.missing_local = remote.all_ids().into_iter().filter(|id| sealed_id(id)).collect();
        plan.missing_remote = local.all_ids().into_iter().filter(|id| sealed_id(id)).collect();
        return Ok(plan);
    }

    let mut rounds = 0usize;
    let mut frontier: Option<Vec<Timestamp>> = None; // None = whole level

    for level in Level::DESCENDING {
        rounds += 1;
        if rounds > max_rounds {
            return Err(SyncError::RoundBudget(max_rounds));
        }

        let req = NodeListRequest {
            level,
            buckets: frontier.clone().unwrap_or_default(),
        };
        let theirs = answer_node_list(remote, &req);
        let ours = answer_node_list(local, &req);
        let mismatched = mismatched_buckets(&ours.nodes, &theirs.nodes, level, horizon);

        if mismatched.is_empty() {
            return Ok(SyncPlan {
                rounds,
                ..SyncPlan::default()
            });
        }
        match level.finer() {
            Some(_) => {
                // Recurse into the children of every mismatched bucket.
                let children: BTreeSet<Timestamp> = mismatched
                    .iter()
                    .flat_map(|ts| {
                        local
                            .children_of(level, *ts)
                            .into_iter()
                            .chain(remote.children_of(level, *ts))
                            .map(|n| n.ts)
                    })
                    .collect();
                frontier = Some(children.into_iter().collect());
            }
            None => {
                // Hour level: exchange explicit leaf lists.
                rounds += 1;
                if rounds > max_rounds {
                    return Err(SyncError::RoundBudget(max_rounds));
                }
                let req = LeafListRequest {
                    buckets: mismatched.clone(),
                };
                let theirs = answer_leaf_list(remote, &req);
                let ours = answer_leaf_list(local, &req);

                let our_ids: BTreeSet<Id> = ours
                    .buckets
                    .iter()
                    .flat_map(|(_, entries)| entries.iter().map(|(id, _)| *id))
                    .collect();
                let their_ids: BTreeSet<Id> = theirs
                    .buckets
                    .iter()
                    .flat_map(|(_, entries)| entries.iter().map(|(id, _)| *id))
                    .collect();

                return Ok(SyncPlan {
                    missing_local: their_ids.difference(&our_ids).copied().collect(),
                    missing_remote: our_ids.difference(&their_ids).copied().collect(),
                    rounds,
                });
            }
        }
    }
    Err(SyncError::RoundBudget(max_rounds))
}
