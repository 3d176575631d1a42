//! Master/member authorization.
//!
//! Master oplogs form a self-authorizing chain: the genesis log (the entity
//! creator adding itself) needs no prior quorum, and every later
//! AddMaster/RemoveMaster must carry a quorum valid at its own
//! `master_log_id`. The [`MasterLedger`] replays that chain so "the master
//! set at log L" is always answerable, which is what makes authorization a
//! function of the set active when an oplog claimed it - not of the
//! present set.

use crate::engine::ApplyOp;
use crate::record::{OpCode, Oplog};
use opweave_store::{ObjectCore, Replicated};
use opweave_types::{Error, Id, PubKey, Result, Status, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Extract the public key an Add* oplog carries in `key_extra`.
pub fn key_extra_pubkey(log: &Oplog) -> Result<PubKey> {
    let extra = log
        .key_extra
        .as_ref()
        .ok_or_else(|| Error::Validation("missing key_extra".into()))?;
    let value = extra
        .get("pubkey")
        .ok_or_else(|| Error::Validation("key_extra has no pubkey".into()))?;
    serde_json::from_value(value.clone())
        .map_err(|e| Error::Validation(format!("malformed pubkey: {}", e)))
}

/// Build the `key_extra` payload carrying a public key.
pub fn pubkey_extra(pubkey: &PubKey) -> serde_json::Value {
    serde_json::json!({ "pubkey": pubkey })
}

/// One confirmed master-oplog in the authorization chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterChange {
    pub log_id: Id,
    pub create_ts: Timestamp,
    pub op: OpCode,
    /// The master being added or removed (the oplog's `obj_id`).
    pub master_id: Id,
}

/// Replayed view of an entity's master chain plus every signer key the
/// node has learned from confirmed Add* oplogs.
#[derive(Clone, Debug, Default)]
pub struct MasterLedger {
    keys: HashMap<Id, PubKey>,
    chain: Vec<MasterChange>,
}

impl MasterLedger {
    pub fn new() -> Self {
        MasterLedger::default()
    }

    /// Remember a signer's public key (from a confirmed Add* oplog).
    pub fn learn_key(&mut self, id: Id, pubkey: PubKey) {
        self.keys.insert(id, pubkey);
    }

    pub fn pubkey_of(&self, id: &Id) -> Option<PubKey> {
        self.keys.get(id).copied()
    }

    /// Record a confirmed master oplog in the chain. Changes for
    /// different master objects can merge out of creation order across
    /// peers, so the chain is kept sorted by `(create_ts, log_id)` and
    /// the replay always walks the order the changes were made in.
    pub fn record(&mut self, log: &Oplog) -> Result<()> {
        if !matches!(log.op, OpCode::AddMaster | OpCode::RemoveMaster) {
            return Err(Error::Validation("not a master oplog".into()));
        }
        if self.chain.iter().any(|c| c.log_id == log.id) {
            return Ok(()); // idempotent under retransmission
        }
        let change = MasterChange {
            log_id: log.id,
            create_ts: log.create_ts,
            op: log.op,
            master_id: log.obj_id,
        };
        let at = self
            .chain
            .partition_point(|c| (c.create_ts, c.log_id) <= (change.create_ts, change.log_id));
        self.chain.insert(at, change);
        Ok(())
    }

    pub fn has_log(&self, log_id: &Id) -> bool {
        self.chain.iter().any(|c| c.log_id == *log_id)
    }

    /// Whether the master oplog existed (was confirmed) at `ts`.
    pub fn log_alive_at(&self, log_id: &Id, ts: Timestamp) -> bool {
        self.chain
            .iter()
            .any(|c| c.log_id == *log_id && c.create_ts <= ts)
    }

    fn masters_through(&self, upto: impl Fn(&MasterChange) -> bool) -> Vec<Id> {
        let mut masters = Vec::new();
        for change in &self.chain {
            match change.op {
                OpCode::AddMaster => {
                    if !masters.contains(&change.master_id) {
                        masters.push(change.master_id);
                    }
                }
                OpCode::RemoveMaster => masters.retain(|m| *m != change.master_id),
                _ => {}
            }
            if upto(change) {
                break;
            }
        }
        masters
    }

    /// The master set active under a given master oplog: every confirmed
    /// change up to and including that log. `None` if the log is unknown.
    pub fn masters_at_log(&self, master_log_id: &Id) -> Option<Vec<Id>> {
        if !self.has_log(master_log_id) {
            return None;
        }
        Some(self.masters_through(|c| c.log_id == *master_log_id))
    }

    /// The master set as of a timestamp.
    pub fn masters_at_ts(&self, ts: Timestamp) -> Vec<Id> {
        let mut masters = Vec::new();
        for change in self.chain.iter().filter(|c| c.create_ts <= ts) {
            match change.op {
                OpCode::AddMaster => {
                    if !masters.contains(&change.master_id) {
                        masters.push(change.master_id);
                    }
                }
                OpCode::RemoveMaster => masters.retain(|m| *m != change.master_id),
                _ => {}
            }
        }
        masters
    }

    /// The newest master oplog id, used as `master_log_id` on fresh logs.
    pub fn head_log(&self) -> Option<Id> {
        self.chain.last().map(|c| c.log_id)
    }

    pub fn current_masters(&self) -> Vec<Id> {
        self.masters_through(|_| false)
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

/// Pluggable rule for how many master signatures confirm an oplog.
pub trait QuorumPolicy: Send + Sync {
    /// Whether `signers` satisfies the quorum over `masters`.
    fn satisfied(&self, masters: &[Id], signers: &[Id]) -> bool;
}

/// Default policy: every current master must sign.
pub struct AllMasters;

impl QuorumPolicy for AllMasters {
    fn satisfied(&self, masters: &[Id], signers: &[Id]) -> bool {
        !masters.is_empty() && masters.iter().all(|m| signers.contains(m))
    }
}

/// Alternate policy: strict majority of the master set.
pub struct Majority;

impl QuorumPolicy for Majority {
    fn satisfied(&self, masters: &[Id], signers: &[Id]) -> bool {
        if masters.is_empty() {
            return false;
        }
        let signed = masters.iter().filter(|m| signers.contains(m)).count();
        signed * 2 > masters.len()
    }
}

/// A master record: an identity authorized to co-sign oplogs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MasterInfo {
    pub core: ObjectCore,
    pub pubkey: PubKey,
}

impl Replicated for MasterInfo {
    const PREFIX: [u8; 4] = *b".mad";
    const IDX_PREFIX: [u8; 4] = *b".max";

    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ObjectCore {
        &mut self.core
    }
}

impl ApplyOp for MasterInfo {
    fn from_genesis(log: &Oplog) -> Result<Self> {
        if log.op != OpCode::AddMaster {
            return Err(Error::Validation("master genesis must be AddMaster".into()));
        }
        let pubkey = key_extra_pubkey(log)?;
        let mut core = ObjectCore::new(
            log.obj_id,
            log.entity_id,
            log.creator_id,
            log.create_ts,
            log.id,
        );
        core.set_status(Status::Alive)?;
        Ok(MasterInfo { core, pubkey })
    }

    fn apply(&mut self, log: &Oplog) -> Result<()> {
        match log.op {
            OpCode::RemoveMaster => self.core.set_status(Status::Deleted),
            other => Err(Error::Validation(format!(
                "op {:?} not valid for a master record",
                other
            ))),
        }
    }
}

/// A member record, authorized by the current master set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub core: ObjectCore,
    pub pubkey: PubKey,
}

impl Replicated for MemberInfo {
    const PREFIX: [u8; 4] = *b".mbd";
    const IDX_PREFIX: [u8; 4] = *b".mbx";

    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ObjectCore {
        &mut self.core
    }
}

impl ApplyOp for MemberInfo {
    fn from_genesis(log: &Oplog) -> Result<Self> {
        if log.op != OpCode::AddMember {
            return Err(Error::Validation("member genesis must be AddMember".into()));
        }
        let pubkey = key_extra_pubkey(log)?;
        let mut core = ObjectCore::new(
            log.obj_id,
            log.entity_id,
            log.creator_id,
            log.create_ts,
            log.id,
        );
        core.set_status(Status::Alive)?;
        Ok(MemberInfo { core, pubkey })
    }

    fn apply(&mut self, log: &Oplog) -> Result<()> {
        match log.op {
            OpCode::RemoveMember => self.core.set_status(Status::Deleted),
            // Multi-device join: the superseded record steps aside while a
            // fresh record carries the expanded owner set.
            OpCode::MigrateEntity => self.core.set_status(Status::Migrated),
            other => Err(Error::Validation(format!(
                "op {:?} not valid for a member record",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Category;
    use opweave_types::Keypair;

    fn master_log(kp: &Keypair, entity: Id, op: OpCode, target: Id, ts: u64) -> Oplog {
        Oplog::new(
            target,
            entity,
            Category::Master,
            op,
            None,
            Id::default(),
            kp.id(),
            Timestamp::from_millis(ts),
            Some(pubkey_extra(&kp.public())),
        )
    }

    #[test]
    fn test_chain_replay_masters_at_log() {
        let entity = Id::derive(b"e", Timestamp::from_millis(1), b"s");
        let a = Keypair::generate();
        let b = Keypair::generate();

        let m1 = master_log(&a, entity, OpCode::AddMaster, a.id(), 1000);
        let m2 = master_log(&a, entity, OpCode::AddMaster, b.id(), 2000);
        let m3 = master_log(&a, entity, OpCode::RemoveMaster, a.id(), 3000);

        let mut ledger = MasterLedger::new();
        ledger.record(&m1).unwrap();
        ledger.record(&m2).unwrap();
        ledger.record(&m3).unwrap();

        assert_eq!(ledger.masters_at_log(&m1.id).unwrap(), vec![a.id()]);
        assert_eq!(
            ledger.masters_at_log(&m2.id).unwrap(),
            vec![a.id(), b.id()]
        );
        assert_eq!(ledger.masters_at_log(&m3.id).unwrap(), vec![b.id()]);
        assert_eq!(ledger.current_masters(), vec![b.id()]);
    }

    #[test]
    fn test_masters_at_ts() {
        let entity = Id::derive(b"e", Timestamp::from_millis(1), b"s");
        let a = Keypair::generate();
        let b = Keypair::generate();

        let mut ledger = MasterLedger::new();
        ledger
            .record(&master_log(&a, entity, OpCode::AddMaster, a.id(), 1000))
            .unwrap();
        ledger
            .record(&master_log(&a, entity, OpCode::AddMaster, b.id(), 2000))
            .unwrap();

        assert_eq!(ledger.masters_at_ts(Timestamp::from_millis(1500)), vec![a.id()]);
        assert_eq!(
            ledger.masters_at_ts(Timestamp::from_millis(2500)),
            vec![a.id(), b.id()]
        );
    }

    #[test]
    fn test_record_out_of_order_replays_sorted() {
        let entity = Id::derive(b"e", Timestamp::from_millis(1), b"s");
        let a = Keypair::generate();
        let b = Keypair::generate();

        let m1 = master_log(&a, entity, OpCode::AddMaster, a.id(), 1000);
        let m2 = master_log(&a, entity, OpCode::AddMaster, b.id(), 2000);
        let m3 = master_log(&a, entity, OpCode::RemoveMaster, a.id(), 3000);

        // The removal merges first when it arrives via a faster peer.
        let mut ledger = MasterLedger::new();
        ledger.record(&m3).unwrap();
        ledger.record(&m1).unwrap();
        ledger.record(&m2).unwrap();

        assert_eq!(ledger.masters_at_log(&m1.id).unwrap(), vec![a.id()]);
        assert_eq!(
            ledger.masters_at_log(&m2.id).unwrap(),
            vec![a.id(), b.id()]
        );
        assert_eq!(ledger.current_masters(), vec![b.id()]);
        assert_eq!(ledger.head_log(), Some(m3.id));
    }

    #[test]
    fn test_record_idempotent() {
        let entity = Id::derive(b"e", Timestamp::from_millis(1), b"s");
        let a = Keypair::generate();
        let m1 = master_log(&a, entity, OpCode::AddMaster, a.id(), 1000);

        let mut ledger = MasterLedger::new();
        ledger.record(&m1).unwrap();
        ledger.record(&m1).unwrap();
        assert_eq!(ledger.current_masters(), vec![a.id()]);
    }

    #[test]
    fn test_unknown_master_log_unresolvable() {
        let ledger = MasterLedger::new();
        let unknown = Id::derive(b"x", Timestamp::from_millis(9), b"s");
        assert!(ledger.masters_at_log(&unknown).is_none());
        assert!(!ledger.log_alive_at(&unknown, Timestamp::from_millis(9999)));
    }

    #[test]
    fn test_all_masters_policy() {
        let a = Id::derive(b"a", Timestamp::from_millis(1), b"s");
        let b = Id::derive(b"b", Timestamp::from_millis(2), b"s");

        let policy = AllMasters;
        assert!(policy.satisfied(&[a], &[a]));
        assert!(policy.satisfied(&[a, b], &[b, a]));
        assert!(!policy.satisfied(&[a, b], &[a]));
        assert!(!policy.satisfied(&[], &[a]));
    }

    #[test]
    fn test_majority_policy() {
        let a = Id::derive(b"a", Timestamp::from_millis(1), b"s");
        let b = Id::derive(b"b", Timestamp::from_millis(2), b"s");
        let c = Id::derive(b"c", Timestamp::from_millis(3), b"s");

        let policy = Majority;
        assert!(policy.satisfied(&[a, b, c], &[a, b]));
        assert!(!policy.satisfied(&[a, b, c], &[a]));
        assert!(!policy.satisfied(&[a, b], &[a])); // half is not a majority
    }

    #[test]
    fn test_member_migration_status() {
        let entity = Id::derive(b"e", Timestamp::from_millis(1), b"s");
        let kp = Keypair::generate();
        let genesis = Oplog::new(
            kp.id(),
            entity,
            Category::Member,
            OpCode::AddMember,
            None,
            Id::default(),
            kp.id(),
            Timestamp::from_millis(1000),
            Some(pubkey_extra(&kp.public())),
        );
        let mut member = MemberInfo::from_genesis(&genesis).unwrap();
        assert_eq!(member.core.status, Status::Alive);

        let migrate = Oplog::new(
            kp.id(),
            entity,
            Category::Member,
            OpCode::MigrateEntity,
            Some(genesis.id),
            Id::default(),
            kp.id(),
            Timestamp::from_millis(2000),
            None,
        );
        member.apply(&migrate).unwrap();
        assert_eq!(member.core.status, Status::Migrated);
    }
}
