//! Two-peer convergence over the in-memory transport.
//!
//! Node A bootstraps an entity and keeps mutating it; node B joins empty
//! and pulls its way to the same state. Oplogs are created at a fixed
//! past instant so their hour buckets are sealed relative to the real
//! clock the merkle horizon uses.

use opweave_node::{MemoryTransport, Node, NodeConfig, PeerId};
use opweave_oplog::{current_op_key, pubkey_extra, Category, OpCode, Oplog};
use opweave_store::MemKv;
use opweave_types::{Error, Id, Keypair, Status, Timestamp};
use std::sync::Arc;
use std::time::Duration;

// 2023-11-14, comfortably older than any sync cutoff.
const BASE_TS: u64 = 1_700_000_000_000;

fn ts(offset_ms: u64) -> Timestamp {
    Timestamp::from_millis(BASE_TS + offset_ms)
}

struct Net {
    transport: Arc<MemoryTransport>,
    a: Arc<Node>,
    b: Arc<Node>,
    entity_id: Id,
}

async fn two_nodes() -> Net {
    let transport = Arc::new(MemoryTransport::new());
    let a = Arc::new(Node::new(
        PeerId::new("a"),
        Keypair::generate(),
        b"seed-a".to_vec(),
        Arc::new(MemKv::new()),
        transport.clone(),
        NodeConfig::default(),
    ));
    let b = Arc::new(Node::new(
        PeerId::new("b"),
        Keypair::generate(),
        b"seed-b".to_vec(),
        Arc::new(MemKv::new()),
        transport.clone(),
        NodeConfig::default(),
    ));
    transport.register(PeerId::new("a"), a.router());
    transport.register(PeerId::new("b"), b.router());

    let entity_id = Id::generate(b"entity", ts(0));
    a.join_entity(entity_id);
    b.join_entity(entity_id);
    {
        let service = a.service(&entity_id).unwrap();
        service.lock().await.bootstrap("shared-space", ts(0)).await.unwrap();
    }
    Net {
        transport,
        a,
        b,
        entity_id,
    }
}

/// A-signed AddMember for a fresh identity.
async fn add_member_on_a(net: &Net, target: &Keypair, at: Timestamp) {
    let service = net.a.service(&net.entity_id).unwrap();
    let mut service = service.lock().await;
    let master_log = service.ledger().read().head_log().unwrap();

    let mut log = Oplog::new(
        target.id(),
        net.entity_id,
        Category::Member,
        OpCode::AddMember,
        None,
        master_log,
        net.a.keypair().id(),
        at,
        Some(pubkey_extra(&target.public())),
    );
    log.sign_creator(net.a.keypair());
    log.sign_master(net.a.keypair());
    service.submit(log).await.unwrap();
}

async fn regenerate(node: &Node, entity_id: &Id) {
    let service = node.service(entity_id).unwrap();
    service.lock().await.regenerate(Timestamp::now()).unwrap();
}

#[tokio::test]
async fn test_empty_joiner_pulls_everything() {
    let net = two_nodes().await;
    let m1 = Keypair::generate();
    add_member_on_a(&net, &m1, ts(60_000)).await;

    regenerate(&net.a, &net.entity_id).await;
    regenerate(&net.b, &net.entity_id).await;
    let merged = net.b.sync_all(&PeerId::new("a")).await.unwrap();
    assert!(merged >= 5); // genesis, two members, entity, op key

    let service = net.b.service(&net.entity_id).unwrap();
    let service = service.lock().await;
    assert!(!service.ledger().read().is_empty());

    let entity = service
        .entities()
        .objects()
        .get_by_id(&net.entity_id, &net.entity_id, false)
        .await
        .unwrap();
    assert_eq!(entity.name, "shared-space");
    assert_eq!(entity.core.status, Status::Alive);

    let member = service
        .members()
        .objects()
        .get_by_id(&net.entity_id, &m1.id(), false)
        .await
        .unwrap();
    assert_eq!(member.core.status, Status::Alive);

    let key = current_op_key(service.op_keys().objects(), &net.entity_id)
        .await
        .unwrap();
    assert!(key.is_some());
}

#[tokio::test]
async fn test_second_pass_finds_nothing() {
    let net = two_nodes().await;
    regenerate(&net.a, &net.entity_id).await;
    regenerate(&net.b, &net.entity_id).await;
    net.b.sync_all(&PeerId::new("a")).await.unwrap();

    regenerate(&net.b, &net.entity_id).await;
    let merged = net.b.sync_all(&PeerId::new("a")).await.unwrap();
    assert_eq!(merged, 0);
}

#[tokio::test]
async fn test_offline_peer_catches_up_key_rotation() {
    let net = two_nodes().await;
    regenerate(&net.a, &net.entity_id).await;
    regenerate(&net.b, &net.entity_id).await;
    net.b.sync_all(&PeerId::new("a")).await.unwrap();

    let a_key = {
        let service = net.a.service(&net.entity_id).unwrap();
        let service = service.lock().await;
        current_op_key(service.op_keys().objects(), &net.entity_id)
            .await
            .unwrap()
            .unwrap()
    };

    // B goes dark; A rotates the operational key meanwhile.
    net.transport.set_offline(&PeerId::new("b"), true);
    net.a
        .force_op_key(&net.entity_id, ts(7_200_000))
        .await
        .unwrap();
    regenerate(&net.a, &net.entity_id).await;

    // B comes back and forces a resync.
    net.transport.set_offline(&PeerId::new("b"), false);
    regenerate(&net.b, &net.entity_id).await;
    net.b.sync_all(&PeerId::new("a")).await.unwrap();

    for node in [&net.a, &net.b] {
        let service = node.service(&net.entity_id).unwrap();
        let service = service.lock().await;
        let keys = service
            .op_keys()
            .objects()
            .list_entity(&net.entity_id)
            .await
            .unwrap();
        let alive: Vec<_> = keys
            .iter()
            .filter(|k| k.core.status == Status::Alive)
            .collect();
        assert_eq!(alive.len(), 1, "exactly one live key per side");
        assert_ne!(alive[0].core.id, a_key.core.id, "old key was revoked");
    }

    // Both sides agree on which key is current.
    let a_now = {
        let service = net.a.service(&net.entity_id).unwrap();
        let service = service.lock().await;
        current_op_key(service.op_keys().objects(), &net.entity_id)
            .await
            .unwrap()
            .unwrap()
    };
    let b_now = {
        let service = net.b.service(&net.entity_id).unwrap();
        let service = service.lock().await;
        current_op_key(service.op_keys().objects(), &net.entity_id)
            .await
            .unwrap()
            .unwrap()
    };
    assert_eq!(a_now.core.id, b_now.core.id);
    assert_eq!(a_now.key, b_now.key);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mutual_sync_passes_complete() {
    let net = two_nodes().await;
    let m1 = Keypair::generate();
    add_member_on_a(&net, &m1, ts(60_000)).await;
    regenerate(&net.a, &net.entity_id).await;
    regenerate(&net.b, &net.entity_id).await;

    // Both sides pull from each other at once; each must keep answering
    // the other's requests while its own pass is in flight.
    let a = net.a.clone();
    let b = net.b.clone();
    let passes = tokio::time::timeout(Duration::from_secs(5), async {
        let a_pass = tokio::spawn(async move { a.sync_all(&PeerId::new("b")).await });
        let b_pass = tokio::spawn(async move { b.sync_all(&PeerId::new("a")).await });
        (a_pass.await.unwrap(), b_pass.await.unwrap())
    })
    .await
    .expect("mutual sync passes did not finish");

    let (a_merged, b_merged) = (passes.0.unwrap(), passes.1.unwrap());
    assert_eq!(a_merged, 0); // b had nothing to offer
    assert!(b_merged >= 5);
}

#[tokio::test]
async fn test_unreachable_peer_aborts_and_records_failure() {
    let net = two_nodes().await;
    regenerate(&net.b, &net.entity_id).await;

    net.transport.set_offline(&PeerId::new("a"), true);
    let err = net.b.sync_all(&PeerId::new("a")).await.unwrap_err();
    assert_eq!(err, Error::SyncTimeout);

    let service = net.b.service(&net.entity_id).unwrap();
    let service = service.lock().await;
    let meta = service.tree_meta(Category::Master).unwrap();
    assert!(meta.last_fail_at.is_some());

    // The next cycle succeeds once the peer is back.
    drop(service);
    net.transport.set_offline(&PeerId::new("a"), false);
    regenerate(&net.a, &net.entity_id).await;
    assert!(net.b.sync_all(&PeerId::new("a")).await.is_ok());
}

#[tokio::test]
async fn test_divergence_walk_fetches_only_the_delta() {
    let net = two_nodes().await;
    regenerate(&net.a, &net.entity_id).await;
    regenerate(&net.b, &net.entity_id).await;
    net.b.sync_all(&PeerId::new("a")).await.unwrap();

    // One new member on A, hours after the rest.
    let late = Keypair::generate();
    add_member_on_a(&net, &late, ts(10_800_000)).await;
    regenerate(&net.a, &net.entity_id).await;
    regenerate(&net.b, &net.entity_id).await;

    let merged = net.b.sync_all(&PeerId::new("a")).await.unwrap();
    assert_eq!(merged, 1);

    let service = net.b.service(&net.entity_id).unwrap();
    let service = service.lock().await;
    let member = service
        .members()
        .objects()
        .get_by_id(&net.entity_id, &late.id(), false)
        .await
        .unwrap();
    assert_eq!(member.core.status, Status::Alive);
}
