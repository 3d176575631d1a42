//! The oplog engine: validate, merge, buffer, tie-break.
//!
//! One engine instance manages one (entity, category) stream and its target
//! objects. A submitted oplog - locally created or fetched from a peer -
//! goes through four checks in order: content hash and creator signature,
//! master-log resolution, master quorum, causal predecessor. Quorum or
//! signature failure rejects the log permanently; a missing predecessor
//! buffers it until the predecessor arrives, at which point buffered
//! children cascade.
//!
//! Sibling races (two logs sharing a `pre_log_id`) are resolved by the
//! deterministic `(create_ts, id)` order. The engine re-derives the whole
//! per-object winner chain on every merge, so the final winner never
//! depends on arrival order; demoted siblings stay merged with status
//! `Internal` for audit and merkle hashing.

use crate::auth::{key_extra_pubkey, MasterLedger, QuorumPolicy};
use crate::logstore::LogStore;
use crate::record::{Category, OpCode, Oplog};
use opweave_store::{KvStore, ObjectStore, Replicated};
use opweave_types::{Error, Id, LockRegistry, Result, Status};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Object behavior under confirmed oplogs.
pub trait ApplyOp: Replicated {
    /// Construct the object from the first confirmed oplog of its chain.
    fn from_genesis(log: &Oplog) -> Result<Self>;

    /// Apply a later confirmed oplog per its op semantics.
    fn apply(&mut self, log: &Oplog) -> Result<()>;
}

/// What happened to a submitted oplog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Validated, confirmed and applied to the target object.
    Merged(Id),
    /// Predecessor unknown; buffered under the missing id.
    Buffered(Id),
    /// Validated and retained, but a sibling won the tie-break.
    Superseded { winner: Id },
    /// Already merged; idempotent no-op.
    Duplicate,
}

/// Engine for one (entity, category) oplog stream.
pub struct OplogEngine<O: ApplyOp> {
    entity_id: Id,
    category: Category,
    objects: ObjectStore<O>,
    logs: LogStore,
    ledger: Arc<RwLock<MasterLedger>>,
    policy: Arc<dyn QuorumPolicy>,
    /// Merged logs (Alive or Internal), keyed by log id.
    merged: HashMap<Id, Oplog>,
    /// Buffered logs keyed by their missing predecessor.
    pending: HashMap<Id, Vec<Oplog>>,
    /// Whether persisted logs have been replayed into the maps above.
    hydrated: bool,
}

impl<O: ApplyOp> OplogEngine<O> {
    pub fn new(
        kv: Arc<dyn KvStore>,
        locks: Arc<LockRegistry>,
        ledger: Arc<RwLock<MasterLedger>>,
        policy: Arc<dyn QuorumPolicy>,
        entity_id: Id,
        category: Category,
    ) -> Self {
        OplogEngine {
            entity_id,
            category,
            objects: ObjectStore::new(kv.clone(), locks),
            logs: LogStore::new(kv),
            ledger,
            policy,
            merged: HashMap::new(),
            pending: HashMap::new(),
            hydrated: false,
        }
    }

    pub fn entity_id(&self) -> Id {
        self.entity_id
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn objects(&self) -> &ObjectStore<O> {
        &self.objects
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub fn ledger(&self) -> &Arc<RwLock<MasterLedger>> {
        &self.ledger
    }

    /// Number of logs waiting on unresolved predecessors.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|v| v.len()).sum()
    }

    /// Whether a log id has been merged (confirmed or internal).
    pub fn is_merged(&self, log_id: &Id) -> bool {
        self.merged.contains_key(log_id)
    }

    /// Replay persisted logs into the in-memory merge state. Runs once,
    /// lazily, so a restarted process sees the predecessors it already
    /// holds instead of buffering their children forever. Confirmed Add*
    /// logs re-teach the shared ledger, so hydrate master streams before
    /// the streams they authorize.
    pub async fn hydrate(&mut self) -> Result<()> {
        if self.hydrated {
            return Ok(());
        }
        self.hydrated = true;
        let persisted = self.logs.list(self.category, &self.entity_id)?;
        if persisted.is_empty() {
            return Ok(());
        }

        let mut unsettled = Vec::new();
        for log in persisted {
            match log.status {
                Status::Alive | Status::Internal => {
                    self.merged.insert(log.id, log);
                }
                Status::Pending => unsettled.push(log),
                _ => {}
            }
        }

        // Confirmed logs re-teach the shared ledger what the previous
        // process learned through replay.
        {
            let mut ledger = self.ledger.write();
            for log in self.merged.values().filter(|l| l.status == Status::Alive) {
                if self.category == Category::Master
                    && matches!(log.op, OpCode::AddMaster | OpCode::RemoveMaster)
                {
                    ledger.record(log)?;
                }
                if matches!(log.op, OpCode::AddMaster | OpCode::AddMember) {
                    if let Ok(pubkey) = key_extra_pubkey(log) {
                        ledger.learn_key(log.obj_id, pubkey);
                    }
                }
            }
        }

        // Logs persisted mid-buffer either merge now or wait again.
        // `list` is id (= time) ordered, so chained buffered logs merge
        // in one pass.
        for log in unsettled {
            if let Some(pre) = log.pre_log_id {
                if self.merged.contains_key(&pre) {
                    self.merge_one(log).await?;
                } else {
                    self.pending.entry(pre).or_default().push(log);
                }
            }
        }
        Ok(())
    }

    /// Submit a candidate oplog. Validation failures reject permanently;
    /// causal gaps buffer; everything else merges exactly once.
    pub async fn submit(&mut self, log: Oplog) -> Result<MergeOutcome> {
        self.hydrate().await?;
        if self.merged.contains_key(&log.id) {
            return Ok(MergeOutcome::Duplicate);
        }
        if self
            .pending
            .values()
            .any(|logs| logs.iter().any(|l| l.id == log.id))
        {
            return Ok(MergeOutcome::Duplicate);
        }

        if let Err(e) = self.validate(&log) {
            warn!(log = %log.id.short(), %e, "oplog rejected");
            let mut rejected = log;
            rejected.status = Status::Invalid;
            self.logs.save(&rejected)?;
            return Err(e);
        }

        if let Some(pre) = log.pre_log_id {
            if !self.merged.contains_key(&pre) {
                debug!(log = %log.id.short(), pre = %pre.short(), "buffered on causal gap");
                let mut buffered = log;
                buffered.status = Status::Pending;
                self.logs.save(&buffered)?;
                self.pending.entry(pre).or_default().push(buffered);
                return Ok(MergeOutcome::Buffered(pre));
            }
        }

        let submitted = log.id;
        let mut outcome = self.merge_one(log).await?;

        // Cascade: each merged log may release buffered children.
        let mut queue: VecDeque<Id> = VecDeque::from([submitted]);
        while let Some(parent) = queue.pop_front() {
            let Some(children) = self.pending.remove(&parent) else {
                continue;
            };
            for child in children {
                let child_id = child.id;
                match self.merge_one(child).await {
                    Ok(_) => queue.push_back(child_id),
                    Err(e) => warn!(log = %child_id.short(), %e, "buffered child rejected"),
                }
            }
        }

        // The submitted log's status may have shifted during the cascade
        // (a buffered earlier sibling can win the tie-break late).
        if let Some(merged) = self.merged.get(&submitted) {
            outcome = match merged.status {
                Status::Alive => MergeOutcome::Merged(submitted),
                Status::Internal => MergeOutcome::Superseded {
                    winner: self.winner_over(&merged.clone()),
                },
                _ => outcome,
            };
        }
        Ok(outcome)
    }

    /// Validate signatures, then master-log resolution, then quorum.
    fn validate(&self, log: &Oplog) -> Result<()> {
        if log.entity_id != self.entity_id || log.category != self.category {
            return Err(Error::Validation("log addressed to another stream".into()));
        }
        if !log.verify_hash() {
            return Err(Error::Validation("content hash mismatch".into()));
        }

        let ledger = self.ledger.read();

        // Genesis of the master chain authorizes itself.
        if log.is_self_authorizing() {
            if !ledger.is_empty() {
                return Err(Error::Validation("duplicate master genesis".into()));
            }
            let pubkey = key_extra_pubkey(log)?;
            let sig = log
                .creator_sig
                .ok_or_else(|| Error::Validation("unsigned oplog".into()))?;
            if !pubkey.verify(log.hash.as_bytes(), &sig) {
                return Err(Error::Validation("bad creator signature".into()));
            }
            return Ok(());
        }

        // (a) creator signature against the learned key.
        let creator_key = ledger
            .pubkey_of(&log.creator_id)
            .ok_or_else(|| Error::Validation("unknown creator".into()))?;
        let sig = log
            .creator_sig
            .ok_or_else(|| Error::Validation("unsigned oplog".into()))?;
        if !creator_key.verify(log.hash.as_bytes(), &sig) {
            return Err(Error::Validation("bad creator signature".into()));
        }

        // (b) the claimed master oplog must have been alive at create_ts.
        if !ledger.log_alive_at(&log.master_log_id, log.create_ts) {
            return Err(Error::Validation(
                "master log not alive at create_ts".into(),
            ));
        }
        let masters = ledger
            .masters_at_log(&log.master_log_id)
            .ok_or_else(|| Error::Validation("unresolvable master log".into()))?;

        // (c) quorum: every counted signature must verify and belong to a
        // master active under the claimed master log.
        let mut signers = Vec::with_capacity(log.master_signs.len());
        for ms in &log.master_signs {
            let key = ledger
                .pubkey_of(&ms.signer)
                .ok_or_else(|| Error::Validation("unknown master signer".into()))?;
            if !key.verify(log.hash.as_bytes(), &ms.sig) {
                return Err(Error::Validation("bad master signature".into()));
            }
            signers.push(ms.signer);
        }
        if !self.policy.satisfied(&masters, &signers) {
            return Err(Error::Validation("master quorum not satisfied".into()));
        }

        Ok(())
    }

    /// Merge one validated, causally ready log: record it, re-derive the
    /// object's winner chain, persist changed statuses and the object.
    /// Holds the object's exclusive lock for the full duration.
    async fn merge_one(&mut self, mut log: Oplog) -> Result<MergeOutcome> {
        if self.merged.contains_key(&log.id) {
            return Ok(MergeOutcome::Duplicate);
        }
        let obj_id = log.obj_id;
        let log_id = log.id;

        // Idempotence backstop: the object already reflects this log.
        if let Some(existing) = self.objects.get_new_obj_by_id(&self.entity_id, &obj_id, false).await? {
            if existing.core().update_log_id == Some(log_id) {
                return Ok(MergeOutcome::Duplicate);
            }
        }

        let _guard = self.objects.locks().lock(&obj_id).await?;

        log.is_sync = true;
        self.merged.insert(log_id, log);
        self.replay_object(obj_id).await?;

        let status = self
            .merged
            .get(&log_id)
            .map(|l| l.status)
            .unwrap_or(Status::Internal);
        match status {
            Status::Alive => {
                debug!(log = %log_id.short(), obj = %obj_id.short(), "oplog merged");
                Ok(MergeOutcome::Merged(log_id))
            }
            _ => {
                let winner = self.winner_over(&self.merged[&log_id].clone());
                debug!(log = %log_id.short(), winner = %winner.short(), "sibling superseded");
                Ok(MergeOutcome::Superseded { winner })
            }
        }
    }

    /// Deterministically re-derive statuses and object state for one
    /// object's chain from its merged logs. Chains are short, so a full
    /// replay keeps the winner decision independent of arrival order.
    async fn replay_object(&mut self, obj_id: Id) -> Result<()> {
        let mut chain: Vec<Oplog> = self
            .merged
            .values()
            .filter(|l| l.obj_id == obj_id)
            .cloned()
            .collect();
        chain.sort_by_key(|l| l.tie_break_key());

        let mut statuses: HashMap<Id, Status> = HashMap::new();
        let mut obj: Option<O> = None;
        let mut frontier: Option<Id> = None;

        loop {
            let winner = chain
                .iter()
                .filter(|l| l.pre_log_id == frontier && !statuses.contains_key(&l.id))
                .min_by_key(|l| l.tie_break_key())
                .cloned();
            let Some(winner) = winner else { break };

            // Same-predecessor competitors lose deterministically.
            for sibling in chain
                .iter()
                .filter(|l| l.pre_log_id == frontier && l.id != winner.id)
            {
                statuses.insert(sibling.id, Status::Internal);
            }
            statuses.insert(winner.id, Status::Alive);

            match &mut obj {
                None => {
                    obj = Some(O::from_genesis(&winner)?);
                }
                Some(obj) => {
                    obj.apply(&winner)?;
                    obj.core_mut()
                        .set_updated(winner.creator_id, winner.create_ts, winner.id);
                }
            }
            frontier = Some(winner.id);
        }

        // Descendants of demoted siblings are superseded along with them.
        for log in &chain {
            statuses.entry(log.id).or_insert(Status::Internal);
        }

        for log in &mut chain {
            let next = statuses[&log.id];
            if log.status != next {
                log.status = next;
                self.logs.save(log)?;
                if let Some(merged) = self.merged.get_mut(&log.id) {
                    merged.status = next;
                }
            } else if self.logs.get(self.category, &self.entity_id, &log.id)?.is_none() {
                self.logs.save(log)?;
            }
        }

        if let Some(obj) = obj {
            self.objects.save(&obj, true).await?;
        }

        // Master engines feed the shared ledger as the chain settles.
        if self.category == Category::Master {
            let mut ledger = self.ledger.write();
            for log in chain.iter().filter(|l| l.status == Status::Alive) {
                if matches!(log.op, OpCode::AddMaster | OpCode::RemoveMaster) {
                    ledger.record(log)?;
                }
                if log.op == OpCode::AddMaster {
                    if let Ok(pubkey) = key_extra_pubkey(log) {
                        ledger.learn_key(log.obj_id, pubkey);
                    }
                }
            }
        } else {
            // Confirmed Add* logs in any stream teach signer keys.
            let mut ledger = self.ledger.write();
            for log in chain.iter().filter(|l| l.status == Status::Alive) {
                if log.op == OpCode::AddMember {
                    if let Ok(pubkey) = key_extra_pubkey(log) {
                        ledger.learn_key(log.obj_id, pubkey);
                    }
                }
            }
        }

        Ok(())
    }

    /// The confirmed sibling that beat `loser`.
    fn winner_over(&self, loser: &Oplog) -> Id {
        self.merged
            .values()
            .filter(|l| {
                l.obj_id == loser.obj_id
                    && l.pre_log_id == loser.pre_log_id
                    && l.status == Status::Alive
            })
            .map(|l| l.id)
            .next()
            .unwrap_or(loser.id)
    }
}
