//! The transport seam.
//!
//! Sync traffic is plain request/response: node lists and leaf lists for
//! the divergence walk, oplog fetches for the repair, and a handshake that
//! carries the peer's clock for skew correction. Everything serializes
//! with serde so a wire transport can be dropped in later; the in-memory
//! implementation here routes requests to registered handlers and is what
//! the tests and the simulation driver run on.

use async_trait::async_trait;
use opweave_merkle::{LeafListRequest, LeafListResponse, NodeListRequest, NodeListResponse};
use opweave_oplog::{Category, Oplog};
use opweave_types::{Error, Id, Result, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Opaque peer name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One sync request, always scoped to an entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SyncRequest {
    /// Clock/cutoff exchange opening a sync pass.
    Handshake { entity_id: Id },
    NodeList {
        entity_id: Id,
        category: Category,
        inner: NodeListRequest,
    },
    LeafList {
        entity_id: Id,
        category: Category,
        inner: LeafListRequest,
    },
    FetchOplogs {
        entity_id: Id,
        category: Category,
        ids: Vec<Id>,
    },
}

impl SyncRequest {
    /// The entity a request is scoped to, for routing.
    pub fn entity_id(&self) -> Id {
        match self {
            SyncRequest::Handshake { entity_id }
            | SyncRequest::NodeList { entity_id, .. }
            | SyncRequest::LeafList { entity_id, .. }
            | SyncRequest::FetchOplogs { entity_id, .. } => *entity_id,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SyncResponse {
    Handshake {
        /// The responder's wall clock, for skew correction.
        clock: Timestamp,
        /// Snapshot cutoffs per category.
        cutoffs: Vec<(Category, Timestamp)>,
    },
    NodeList(NodeListResponse),
    LeafList(LeafListResponse),
    Oplogs(Vec<Oplog>),
}

/// Server side of the seam: answer one request from local state.
#[async_trait]
pub trait SyncHandler: Send + Sync + 'static {
    async fn handle(&self, request: SyncRequest) -> Result<SyncResponse>;
}

/// Client side of the seam.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Issue one request and await the peer's response. Unreachable peers
    /// surface `Error::SyncTimeout`; the caller's sync attempt aborts and
    /// the next cycle retries.
    async fn request(&self, peer: &PeerId, request: SyncRequest) -> Result<SyncResponse>;
}

/// In-memory transport: a registry of handlers, one per peer, with an
/// offline set for simulating partitions. Every request is bounded by a
/// deadline so a stuck responder surfaces as `SyncTimeout` rather than
/// wedging the caller's sync pass.
pub struct MemoryTransport {
    handlers: RwLock<HashMap<PeerId, Arc<dyn SyncHandler>>>,
    offline: RwLock<HashSet<PeerId>>,
    deadline: Duration,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        MemoryTransport::with_deadline(Duration::from_secs(5))
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport::default()
    }

    /// Transport with a custom per-request deadline.
    pub fn with_deadline(deadline: Duration) -> Self {
        MemoryTransport {
            handlers: RwLock::new(HashMap::new()),
            offline: RwLock::new(HashSet::new()),
            deadline,
        }
    }

    pub fn register(&self, peer: PeerId, handler: Arc<dyn SyncHandler>) {
        self.handlers.write().insert(peer, handler);
    }

    /// Simulate a partition: requests to this peer time out.
    pub fn set_offline(&self, peer: &PeerId, offline: bool) {
        if offline {
            self.offline.write().insert(peer.clone());
        } else {
            self.offline.write().remove(peer);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request(&self, peer: &PeerId, request: SyncRequest) -> Result<SyncResponse> {
        if self.offline.read().contains(peer) {
            return Err(Error::SyncTimeout);
        }
        let handler = self
            .handlers
            .read()
            .get(peer)
            .cloned()
            .ok_or(Error::SyncTimeout)?;
        tokio::time::timeout(self.deadline, handler.handle(request))
            .await
            .map_err(|_| Error::SyncTimeout)?
    }
}
