//! Per-entity service: engines, merkle trees and the sync walk.
//!
//! One `EntityService` bundles everything a node keeps for one entity:
//! the shared master ledger, one oplog engine per category, and one merkle
//! tree per category. Sync with a peer is pull-based: handshake for the
//! clock offset, walk each category's tree coarsest-first against the
//! peer's, fetch the oplogs we are missing and feed them to the engines.
//! Categories are walked in [`Category::ALL`] order so master oplogs land
//! before the member/key/entity oplogs they authorize.

use crate::config::NodeConfig;
use crate::transport::{PeerId, SyncRequest, SyncResponse, Transport};
use opweave_merkle::{
    answer_leaf_list, answer_node_list, mismatched_buckets, LeafListRequest, Level, MerkleConfig,
    MerkleTree, NodeListRequest, TreeMeta, TreeSnapshot,
};
use opweave_oplog::{
    current_op_key, pubkey_extra, rotation_logs, AllMasters, ApplyOp, Category, MasterInfo,
    MasterLedger, MemberInfo, OpCode, OpKeyInfo, Oplog, OplogEngine,
};
use opweave_store::{KvStore, ObjectCore, Replicated};
use opweave_types::{Error, Id, Keypair, LockRegistry, Result, Status, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The entity record itself: the top-level replicated object whose
/// `entity_id` equals its own id.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EntityInfo {
    pub core: ObjectCore,
    pub name: String,
}

impl Replicated for EntityInfo {
    const PREFIX: [u8; 4] = *b".end";
    const IDX_PREFIX: [u8; 4] = *b".enx";

    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ObjectCore {
        &mut self.core
    }
}

impl ApplyOp for EntityInfo {
    fn from_genesis(log: &Oplog) -> Result<Self> {
        if log.op != OpCode::CreateEntity {
            return Err(Error::Validation("entity genesis must be CreateEntity".into()));
        }
        let name = key_extra_name(log)?;
        let mut core = ObjectCore::new(
            log.obj_id,
            log.entity_id,
            log.creator_id,
            log.create_ts,
            log.id,
        );
        core.set_status(Status::Alive)?;
        Ok(EntityInfo { core, name })
    }

    fn apply(&mut self, log: &Oplog) -> Result<()> {
        match log.op {
            OpCode::UpdateEntity => {
                self.name = key_extra_name(log)?;
                Ok(())
            }
            OpCode::DeleteEntity => self.core.set_status(Status::Deleted),
            OpCode::MigrateEntity => self.core.set_status(Status::Migrated),
            other => Err(Error::Validation(format!(
                "op {:?} not valid for an entity record",
                other
            ))),
        }
    }
}

/// The `key_extra` payload carrying an entity name.
pub fn name_extra(name: &str) -> serde_json::Value {
    serde_json::json!({ "name": name })
}

fn key_extra_name(log: &Oplog) -> Result<String> {
    log.key_extra
        .as_ref()
        .and_then(|e| e.get("name"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Validation("key_extra has no name".into()))
}

/// Everything one node keeps for one entity.
pub struct EntityService {
    entity_id: Id,
    keypair: Keypair,
    /// Seed material for operational-key derivation.
    seed: Vec<u8>,
    config: NodeConfig,
    ledger: Arc<RwLock<MasterLedger>>,
    masters: OplogEngine<MasterInfo>,
    members: OplogEngine<MemberInfo>,
    op_keys: OplogEngine<OpKeyInfo>,
    entities: OplogEngine<EntityInfo>,
    trees: HashMap<Category, MerkleTree>,
}

impl EntityService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        locks: Arc<LockRegistry>,
        keypair: Keypair,
        seed: Vec<u8>,
        entity_id: Id,
        config: NodeConfig,
    ) -> Self {
        let ledger = Arc::new(RwLock::new(MasterLedger::new()));
        let policy: Arc<dyn opweave_oplog::QuorumPolicy> = Arc::new(AllMasters);
        let masters = OplogEngine::new(
            kv.clone(),
            locks.clone(),
            ledger.clone(),
            policy.clone(),
            entity_id,
            Category::Master,
        );
        let members = OplogEngine::new(
            kv.clone(),
            locks.clone(),
            ledger.clone(),
            policy.clone(),
            entity_id,
            Category::Member,
        );
        let op_keys = OplogEngine::new(
            kv.clone(),
            locks.clone(),
            ledger.clone(),
            policy.clone(),
            entity_id,
            Category::OpKey,
        );
        let entities = OplogEngine::new(
            kv.clone(),
            locks.clone(),
            ledger.clone(),
            policy.clone(),
            entity_id,
            Category::Entity,
        );

        let merkle_config = MerkleConfig {
            cutoff: config.sync_cutoff,
        };
        let trees = Category::ALL
            .into_iter()
            .map(|cat| (cat, MerkleTree::new(kv.clone(), entity_id, cat, merkle_config)))
            .collect();

        EntityService {
            entity_id,
            keypair,
            seed,
            config,
            ledger,
            masters,
            members,
            op_keys,
            entities,
            trees,
        }
    }

    pub fn entity_id(&self) -> Id {
        self.entity_id
    }

    pub fn ledger(&self) -> &Arc<RwLock<MasterLedger>> {
        &self.ledger
    }

    pub fn members(&self) -> &OplogEngine<MemberInfo> {
        &self.members
    }

    pub fn op_keys(&self) -> &OplogEngine<OpKeyInfo> {
        &self.op_keys
    }

    pub fn entities(&self) -> &OplogEngine<EntityInfo> {
        &self.entities
    }

    pub fn tree(&self, category: Category) -> &MerkleTree {
        &self.trees[&category]
    }

    pub fn tree_meta(&self, category: Category) -> Result<TreeMeta> {
        self.trees[&category].meta()
    }

    /// Create the entity locally: self-authorizing master genesis, the
    /// creator's member record, the entity record, and the first
    /// operational key.
    pub async fn bootstrap(&mut self, name: &str, now: Timestamp) -> Result<()> {
        let mut genesis = Oplog::new(
            self.keypair.id(),
            self.entity_id,
            Category::Master,
            OpCode::AddMaster,
            None,
            Id::default(),
            self.keypair.id(),
            now,
            Some(pubkey_extra(&self.keypair.public())),
        );
        genesis.master_log_id = genesis.id;
        genesis.hash = genesis.compute_hash();
        genesis.sign_creator(&self.keypair);
        self.masters.submit(genesis.clone()).await?;

        let mut join = Oplog::new(
            self.keypair.id(),
            self.entity_id,
            Category::Member,
            OpCode::AddMember,
            None,
            genesis.id,
            self.keypair.id(),
            now,
            Some(pubkey_extra(&self.keypair.public())),
        );
        join.sign_creator(&self.keypair);
        join.sign_master(&self.keypair);
        self.members.submit(join).await?;

        let mut create = Oplog::new(
            self.entity_id,
            self.entity_id,
            Category::Entity,
            OpCode::CreateEntity,
            None,
            genesis.id,
            self.keypair.id(),
            now,
            Some(name_extra(name)),
        );
        create.sign_creator(&self.keypair);
        create.sign_master(&self.keypair);
        self.entities.submit(create).await?;

        self.rotate_op_key(now).await?;
        info!(entity = %self.entity_id.short(), name, "entity bootstrapped");
        Ok(())
    }

    /// Replay persisted state into every engine, master stream first so
    /// the shared ledger can validate the rest. Cheap after the first
    /// call.
    async fn hydrate(&mut self) -> Result<()> {
        self.masters.hydrate().await?;
        self.members.hydrate().await?;
        self.op_keys.hydrate().await?;
        self.entities.hydrate().await?;
        Ok(())
    }

    /// Route one oplog to the engine for its category.
    pub async fn submit(&mut self, log: Oplog) -> Result<()> {
        self.hydrate().await?;
        match log.category {
            Category::Master => self.masters.submit(log).await?,
            Category::Member => self.members.submit(log).await?,
            Category::OpKey => self.op_keys.submit(log).await?,
            Category::Entity => self.entities.submit(log).await?,
        };
        Ok(())
    }

    /// Rebuild every category's merkle snapshot as of `now`.
    pub fn regenerate(&mut self, now: Timestamp) -> Result<()> {
        for tree in self.trees.values_mut() {
            tree.regenerate(now)?;
        }
        Ok(())
    }

    /// Rotate the operational key: derive a fresh key and revoke the
    /// current one. Runs on the rotation timer for mastered entities and
    /// on operator demand. With a multi-master set the rotation logs
    /// still need the other masters' co-signatures before peers accept
    /// them; this node signs as creator and as itself.
    pub async fn rotate_op_key(&mut self, now: Timestamp) -> Result<()> {
        self.hydrate().await?;
        let prior = current_op_key(self.op_keys.objects(), &self.entity_id).await?;
        let taken: Vec<Id> = self
            .op_keys
            .objects()
            .list_entity(&self.entity_id)
            .await?
            .into_iter()
            .map(|k| k.core.id)
            .collect();

        let logs = {
            let ledger = self.ledger.read();
            rotation_logs(
                &self.keypair,
                &ledger,
                self.entity_id,
                prior.as_ref(),
                &self.seed,
                &taken,
                now,
            )?
        };
        for log in logs {
            self.op_keys.submit(log).await?;
        }
        debug!(entity = %self.entity_id.short(), "operational key rotated");
        Ok(())
    }

    /// Answer one peer request from local state.
    pub fn handle(&self, request: SyncRequest) -> Result<SyncResponse> {
        match request {
            SyncRequest::Handshake { .. } => Ok(SyncResponse::Handshake {
                clock: Timestamp::now(),
                cutoffs: Category::ALL
                    .into_iter()
                    .map(|cat| (cat, self.trees[&cat].snapshot().cutoff))
                    .collect(),
            }),
            SyncRequest::NodeList {
                category, inner, ..
            } => Ok(SyncResponse::NodeList(answer_node_list(
                self.trees[&category].snapshot(),
                &inner,
            ))),
            SyncRequest::LeafList {
                category, inner, ..
            } => Ok(SyncResponse::LeafList(answer_leaf_list(
                self.trees[&category].snapshot(),
                &inner,
            ))),
            SyncRequest::FetchOplogs { category, ids, .. } => {
                // The log store is keyed by category prefix, so any
                // engine's handle serves every stream.
                let logs = self
                    .masters
                    .logs()
                    .get_many(category, &self.entity_id, &ids)?;
                Ok(SyncResponse::Oplogs(logs))
            }
        }
    }

    /// One full pull-based sync pass with `peer`: handshake, then walk and
    /// repair every category in authorization order.
    ///
    /// The service lock is taken only while local state is read or
    /// written, never across a transport round trip, so this node keeps
    /// answering the peer's own requests while its pass is in flight.
    pub async fn sync_with(
        service: &Mutex<EntityService>,
        transport: &dyn Transport,
        peer: &PeerId,
    ) -> Result<usize> {
        let now = Timestamp::now();
        let (entity_id, max_rounds, snapshots) = {
            let s = service.lock().await;
            let snapshots: HashMap<Category, TreeSnapshot> = Category::ALL
                .into_iter()
                .map(|cat| (cat, s.trees[&cat].snapshot().clone()))
                .collect();
            (s.entity_id, s.config.max_sync_rounds, snapshots)
        };

        let handshake = transport
            .request(peer, SyncRequest::Handshake { entity_id })
            .await;
        let (peer_clock, peer_cutoffs) = match handshake {
            Ok(SyncResponse::Handshake { clock, cutoffs }) => (clock, cutoffs),
            Ok(_) => return Err(Error::Validation("unexpected handshake response".into())),
            Err(e) => {
                service.lock().await.mark_all_failed(now)?;
                return Err(e);
            }
        };
        let offset_ms = peer_clock.as_millis() as i64 - now.as_millis() as i64;

        let mut fetched_total = 0usize;
        for category in Category::ALL {
            let peer_cutoff = peer_cutoffs
                .iter()
                .find(|(cat, _)| *cat == category)
                .map(|(_, cutoff)| *cutoff)
                .unwrap_or(Timestamp::ZERO);

            let walk = CategoryWalk {
                transport,
                peer,
                entity_id,
                category,
                max_rounds,
            };
            let missing = match walk
                .discover(&snapshots[&category], peer_cutoff, offset_ms)
                .await
            {
                Ok(missing) => missing,
                Err(e) => {
                    service.lock().await.trees[&category].mark_failed(now)?;
                    return Err(e);
                }
            };
            if missing.is_empty() {
                service.lock().await.trees[&category].mark_synced(now)?;
                continue;
            }

            let response = transport
                .request(
                    peer,
                    SyncRequest::FetchOplogs {
                        entity_id,
                        category,
                        ids: missing,
                    },
                )
                .await;
            let logs = match response {
                Ok(SyncResponse::Oplogs(logs)) => logs,
                Ok(_) => return Err(Error::Validation("unexpected fetch response".into())),
                Err(e) => {
                    service.lock().await.trees[&category].mark_failed(now)?;
                    return Err(e);
                }
            };

            // Id order is time order, which minimizes buffering.
            let mut logs = logs;
            logs.sort_by_key(|l| l.id);
            let mut s = service.lock().await;
            for mut log in logs {
                log.is_sync = false;
                log.is_newer = false;
                log.status = Status::Pending;
                match s.submit(log.clone()).await {
                    Ok(()) => fetched_total += 1,
                    Err(e) => {
                        warn!(log = %log.id.short(), %e, "peer oplog rejected during sync")
                    }
                }
            }
            s.trees[&category].mark_synced(now)?;
        }
        Ok(fetched_total)
    }

    fn mark_all_failed(&self, now: Timestamp) -> Result<()> {
        for tree in self.trees.values() {
            tree.mark_failed(now)?;
        }
        Ok(())
    }
}

/// One category's divergence walk against one peer, run over a cloned
/// snapshot so the caller holds no service lock during the exchange.
struct CategoryWalk<'a> {
    transport: &'a dyn Transport,
    peer: &'a PeerId,
    entity_id: Id,
    category: Category,
    max_rounds: usize,
}

impl CategoryWalk<'_> {
    /// Walk the local snapshot against the peer's and return the oplog
    /// ids the local side is missing.
    async fn discover(
        &self,
        snapshot: &TreeSnapshot,
        peer_cutoff: Timestamp,
        offset_ms: i64,
    ) -> Result<Vec<Id>> {
        let horizon = snapshot.cutoff.min(peer_cutoff.offset(-offset_ms));
        let mut rounds = 0usize;

        // Nothing local: skip the walk, ask for their sealed hours outright.
        let mut frontier: Option<Vec<Timestamp>> = if snapshot.is_empty() {
            let theirs = self
                .node_list(Level::Hour, Vec::new(), &mut rounds)
                .await?;
            Some(
                theirs
                    .into_iter()
                    .filter(|n| n.ts.saturating_add(Level::Hour.width()) <= horizon)
                    .map(|n| n.ts)
                    .collect(),
            )
        } else {
            None
        };

        if frontier.is_none() {
            let mut next: Vec<Timestamp> = Vec::new();
            for level in Level::DESCENDING {
                let req = NodeListRequest {
                    level,
                    buckets: next.clone(),
                };
                let theirs = self
                    .node_list(level, req.buckets.clone(), &mut rounds)
                    .await?;
                let ours = answer_node_list(snapshot, &req);
                let mismatched = mismatched_buckets(&ours.nodes, &theirs, level, horizon);
                if mismatched.is_empty() {
                    return Ok(Vec::new());
                }
                match level.finer() {
                    Some(_) => {
                        next = mismatched
                            .iter()
                            .flat_map(|ts| level.child_buckets(*ts))
                            .collect();
                    }
                    None => {
                        frontier = Some(mismatched);
                    }
                }
            }
        }

        let Some(buckets) = frontier else {
            return Ok(Vec::new());
        };
        if buckets.is_empty() {
            return Ok(Vec::new());
        }

        rounds += 1;
        if rounds > self.max_rounds {
            return Err(Error::SyncTimeout);
        }
        let req = LeafListRequest {
            buckets: buckets.clone(),
        };
        let response = self
            .transport
            .request(
                self.peer,
                SyncRequest::LeafList {
                    entity_id: self.entity_id,
                    category: self.category,
                    inner: req.clone(),
                },
            )
            .await?;
        let SyncResponse::LeafList(theirs) = response else {
            return Err(Error::Validation("unexpected leaf-list response".into()));
        };
        let ours = answer_leaf_list(snapshot, &req);

        let our_ids: BTreeSet<Id> = ours
            .buckets
            .iter()
            .flat_map(|(_, entries)| entries.iter().map(|(id, _)| *id))
            .collect();
        let missing: Vec<Id> = theirs
            .buckets
            .iter()
            .flat_map(|(_, entries)| entries.iter().map(|(id, _)| *id))
            .filter(|id| !our_ids.contains(id))
            .collect();
        Ok(missing)
    }

    async fn node_list(
        &self,
        level: Level,
        buckets: Vec<Timestamp>,
        rounds: &mut usize,
    ) -> Result<Vec<opweave_merkle::MerkleNode>> {
        *rounds += 1;
        if *rounds > self.max_rounds {
            return Err(Error::SyncTimeout);
        }
        let response = self
            .transport
            .request(
                self.peer,
                SyncRequest::NodeList {
                    entity_id: self.entity_id,
                    category: self.category,
                    inner: NodeListRequest { level, buckets },
                },
            )
            .await?;
        match response {
            SyncResponse::NodeList(resp) => Ok(resp.nodes),
            _ => Err(Error::Validation("unexpected node-list response".into())),
        }
    }
}
