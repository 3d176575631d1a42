//! Replica convergence under shuffled delivery.
//!
//! Two replicas receiving the same oplog batch in different orders must end
//! with identical object state and identical per-log statuses, including
//! when conflicting siblings and out-of-order causal chains are in the mix.

use opweave_oplog::{
    pubkey_extra, AllMasters, Category, MasterInfo, MasterLedger, MemberInfo, MergeOutcome,
    OpCode, Oplog, OplogEngine,
};
use opweave_store::MemKv;
use opweave_types::{Id, Keypair, LockRegistry, Status, Timestamp};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

struct Replica {
    masters: OplogEngine<MasterInfo>,
    members: OplogEngine<MemberInfo>,
}

fn entity_id() -> Id {
    Id::derive(b"entity", Timestamp::from_millis(1), b"s")
}

/// Self-authorizing genesis: the creator adds itself as sole master.
fn genesis_log(master: &Keypair) -> Oplog {
    let mut log = Oplog::new(
        master.id(),
        entity_id(),
        Category::Master,
        OpCode::AddMaster,
        None,
        Id::default(),
        master.id(),
        Timestamp::from_millis(10),
        Some(pubkey_extra(&master.public())),
    );
    log.master_log_id = log.id;
    log.hash = log.compute_hash();
    log.sign_creator(master);
    log
}

async fn replica(genesis: &Oplog) -> Replica {
    let kv = Arc::new(MemKv::new());
    let locks = Arc::new(LockRegistry::new());
    let ledger = Arc::new(RwLock::new(MasterLedger::new()));

    let mut masters = OplogEngine::new(
        kv.clone(),
        locks.clone(),
        ledger.clone(),
        Arc::new(AllMasters),
        genesis.entity_id,
        Category::Master,
    );
    let members = OplogEngine::new(
        kv,
        locks,
        ledger,
        Arc::new(AllMasters),
        genesis.entity_id,
        Category::Member,
    );

    let outcome = masters.submit(genesis.clone()).await.unwrap();
    assert_eq!(outcome, MergeOutcome::Merged(genesis.id));
    Replica { masters, members }
}

fn add_member(master: &Keypair, target: &Keypair, master_log: Id, ts: u64) -> Oplog {
    let mut log = Oplog::new(
        target.id(),
        entity_id(),
        Category::Member,
        OpCode::AddMember,
        None,
        master_log,
        master.id(),
        Timestamp::from_millis(ts),
        Some(pubkey_extra(&target.public())),
    );
    log.sign_creator(master);
    log.sign_master(master);
    log
}

fn remove_member(master: &Keypair, target: &Keypair, master_log: Id, pre: Id, ts: u64) -> Oplog {
    let mut log = Oplog::new(
        target.id(),
        entity_id(),
        Category::Member,
        OpCode::RemoveMember,
        Some(pre),
        master_log,
        master.id(),
        Timestamp::from_millis(ts),
        None,
    );
    log.sign_creator(master);
    log.sign_master(master);
    log
}

/// (member statuses, member update logs, log statuses) snapshot.
async fn snapshot(replica: &Replica, members: &[Id]) -> Vec<(Id, Status, Option<Id>)> {
    let mut out = Vec::new();
    for id in members {
        let obj = replica
            .members
            .objects()
            .get_by_id(&entity_id(), id, false)
            .await
            .unwrap();
        out.push((*id, obj.core.status, obj.core.update_log_id));
    }
    out
}

#[tokio::test]
async fn test_shuffled_delivery_converges() {
    let master = Keypair::generate();
    let genesis = genesis_log(&master);
    let mlog = genesis.id;

    let m1 = Keypair::generate();
    let m2 = Keypair::generate();
    let m3 = Keypair::generate();

    let add1 = add_member(&master, &m1, mlog, 1000);
    let add2 = add_member(&master, &m2, mlog, 1001);
    // Conflicting sibling: a second genesis for m2 at the same timestamp.
    let add2b = add_member(&master, &m2, mlog, 1001);
    let add3 = add_member(&master, &m3, mlog, 1002);
    let rm1 = remove_member(&master, &m1, mlog, add1.id, 3000);
    let batch = vec![add1, add2, add2b, add3, rm1];
    let member_ids = [m1.id(), m2.id(), m3.id()];

    let mut baseline = replica(&genesis).await;
    for log in &batch {
        baseline.members.submit(log.clone()).await.unwrap();
    }
    let expected = snapshot(&baseline, &member_ids).await;

    for seed in 0..12u64 {
        let mut shuffled = batch.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));

        let mut node = replica(&genesis).await;
        for log in shuffled {
            node.members.submit(log).await.unwrap();
        }
        assert_eq!(node.members.pending_count(), 0, "seed {}", seed);
        assert_eq!(snapshot(&node, &member_ids).await, expected, "seed {}", seed);

        // Per-log statuses agree too (winner and demoted sibling).
        for log in &batch {
            let ours = node
                .members
                .logs()
                .get(Category::Member, &entity_id(), &log.id)
                .unwrap()
                .unwrap();
            let theirs = baseline
                .members
                .logs()
                .get(Category::Member, &entity_id(), &log.id)
                .unwrap()
                .unwrap();
            assert_eq!(ours.status, theirs.status, "seed {}", seed);
        }
    }
}

#[tokio::test]
async fn test_remerge_is_idempotent() {
    let master = Keypair::generate();
    let genesis = genesis_log(&master);
    let m1 = Keypair::generate();

    let add = add_member(&master, &m1, genesis.id, 1000);
    let rm = remove_member(&master, &m1, genesis.id, add.id, 2000);

    let mut node = replica(&genesis).await;
    node.members.submit(add.clone()).await.unwrap();
    node.members.submit(rm.clone()).await.unwrap();
    let before = snapshot(&node, &[m1.id()]).await;

    for log in [add, rm, genesis.clone()] {
        let outcome = if log.category == Category::Master {
            node.masters.submit(log).await.unwrap()
        } else {
            node.members.submit(log).await.unwrap()
        };
        assert_eq!(outcome, MergeOutcome::Duplicate);
    }
    assert_eq!(snapshot(&node, &[m1.id()]).await, before);
}

#[tokio::test]
async fn test_delete_is_logical_not_physical() {
    let master = Keypair::generate();
    let genesis = genesis_log(&master);
    let m1 = Keypair::generate();

    let add = add_member(&master, &m1, genesis.id, 1000);
    let rm = remove_member(&master, &m1, genesis.id, add.id, 2000);

    let mut node = replica(&genesis).await;
    node.members.submit(add.clone()).await.unwrap();
    node.members.submit(rm.clone()).await.unwrap();

    // The record stays fetchable with Deleted status and its whole chain
    // stays in the log store.
    let obj = node
        .members
        .objects()
        .get_by_id(&entity_id(), &m1.id(), false)
        .await
        .unwrap();
    assert_eq!(obj.core.status, Status::Deleted);
    assert_eq!(
        node.members
            .logs()
            .count(Category::Member, &entity_id())
            .unwrap(),
        2
    );
}
