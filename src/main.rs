//! Two-peer replication demo.
//!
//! Node A bootstraps an entity, admits a member and rotates its
//! operational key while node B is partitioned; B then joins, pulls the
//! whole history over the in-memory transport and prints the converged
//! state of both sides.

use opweave_node::{MemoryTransport, Node, NodeConfig, PeerId};
use opweave_oplog::{current_op_key, pubkey_extra, Category, OpCode, Oplog};
use opweave_store::MemKv;
use opweave_types::{Id, Keypair, Status, Timestamp};
use std::sync::Arc;

fn node(name: &str, transport: &Arc<MemoryTransport>) -> Arc<Node> {
    let node = Arc::new(Node::new(
        PeerId::new(name),
        Keypair::generate(),
        format!("seed-{}", name).into_bytes(),
        Arc::new(MemKv::new()),
        transport.clone(),
        NodeConfig::default(),
    ));
    transport.register(PeerId::new(name), node.router());
    node
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let transport = Arc::new(MemoryTransport::new());
    let a = node("a", &transport);
    let b = node("b", &transport);

    // History is written two hours in the past so every bucket is sealed
    // by the time the merkle snapshots are generated.
    let base = Timestamp::now().saturating_sub(std::time::Duration::from_secs(7200));
    let entity_id = Id::generate(a.keypair().public().as_bytes(), base);
    a.join_entity(entity_id);
    b.join_entity(entity_id);

    let service = a.service(&entity_id).unwrap();
    service
        .lock()
        .await
        .bootstrap("demo-space", base)
        .await
        .unwrap();

    // A admits one more member.
    let member = Keypair::generate();
    {
        let mut service = service.lock().await;
        let master_log = service.ledger().read().head_log().unwrap();
        let mut log = Oplog::new(
            member.id(),
            entity_id,
            Category::Member,
            OpCode::AddMember,
            None,
            master_log,
            a.keypair().id(),
            base.offset(60_000),
            Some(pubkey_extra(&member.public())),
        );
        log.sign_creator(a.keypair());
        log.sign_master(a.keypair());
        service.submit(log).await.unwrap();
    }

    // A rotates the operational key before B has seen anything.
    a.force_op_key(&entity_id, base.offset(120_000)).await.unwrap();

    a.regenerate_all(Timestamp::now()).await.unwrap();
    b.regenerate_all(Timestamp::now()).await.unwrap();

    let merged = b.sync_all(&PeerId::new("a")).await.unwrap();
    println!("node b merged {} oplogs from node a", merged);

    for (name, node) in [("a", &a), ("b", &b)] {
        let service = node.service(&entity_id).unwrap();
        let service = service.lock().await;
        let entity = service
            .entities()
            .objects()
            .get_by_id(&entity_id, &entity_id, false)
            .await
            .unwrap();
        let members = service
            .members()
            .objects()
            .list_entity(&entity_id)
            .await
            .unwrap();
        let alive = members
            .iter()
            .filter(|m| m.core.status == Status::Alive)
            .count();
        let key = current_op_key(service.op_keys().objects(), &entity_id)
            .await
            .unwrap()
            .unwrap();
        println!(
            "node {}: entity '{}' ({:?}), {} live members, op key {}",
            name,
            entity.name,
            entity.core.status,
            alive,
            key.core.id.short(),
        );
    }

    println!("converged");
}
