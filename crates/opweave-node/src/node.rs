//! The node context: entity services, routing and the scheduler task.
//!
//! A `Node` owns one kv store, one lock registry and the services of every
//! entity it participates in. Periodic work (merkle regeneration, key
//! rotation for mastered entities) and forced work (sync, rotation on
//! demand) flow through one mpsc command channel consumed by a single
//! scheduler task, so there is exactly one place where timers and
//! operator commands interleave. Dropping the handle after `shutdown` is
//! the teardown path.

use crate::config::NodeConfig;
use crate::entity::EntityService;
use crate::transport::{PeerId, SyncHandler, SyncRequest, SyncResponse, Transport};
use async_trait::async_trait;
use opweave_store::KvStore;
use opweave_types::{Error, Id, Keypair, LockRegistry, Result, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

type ServiceMap = Arc<RwLock<HashMap<Id, Arc<Mutex<EntityService>>>>>;

/// Work items the scheduler consumes.
#[derive(Clone, Debug)]
pub enum Command {
    /// Rebuild every merkle snapshot now.
    Regenerate,
    /// Pull-sync every entity with one peer now.
    ForceSync(PeerId),
    /// Rotate one entity's operational key now.
    ForceOpKey(Id),
    Shutdown,
}

/// One peer process: identity, storage, entity services.
pub struct Node {
    id: PeerId,
    keypair: Keypair,
    seed: Vec<u8>,
    kv: Arc<dyn KvStore>,
    locks: Arc<LockRegistry>,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    entities: ServiceMap,
}

impl Node {
    pub fn new(
        id: PeerId,
        keypair: Keypair,
        seed: Vec<u8>,
        kv: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        config: NodeConfig,
    ) -> Self {
        Node {
            id,
            keypair,
            seed,
            kv,
            locks: Arc::new(LockRegistry::new()),
            config,
            transport,
            entities: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// The request router to register with the transport.
    pub fn router(&self) -> Arc<EntityRouter> {
        Arc::new(EntityRouter {
            entities: self.entities.clone(),
        })
    }

    fn new_service(&self, entity_id: Id) -> EntityService {
        EntityService::new(
            self.kv.clone(),
            self.locks.clone(),
            self.keypair.clone(),
            self.seed.clone(),
            entity_id,
            self.config,
        )
    }

    /// Create a new entity this node masters.
    pub async fn create_entity(&self, name: &str) -> Result<Id> {
        let now = Timestamp::now();
        let entity_id = Id::generate(self.keypair.public().as_bytes(), now);
        let mut service = self.new_service(entity_id);
        service.bootstrap(name, now).await?;
        self.entities
            .write()
            .insert(entity_id, Arc::new(Mutex::new(service)));
        Ok(entity_id)
    }

    /// Start participating in an existing entity; state arrives via sync.
    pub fn join_entity(&self, entity_id: Id) {
        let service = self.new_service(entity_id);
        self.entities
            .write()
            .insert(entity_id, Arc::new(Mutex::new(service)));
        info!(node = %self.id, entity = %entity_id.short(), "joined entity");
    }

    pub fn service(&self, entity_id: &Id) -> Option<Arc<Mutex<EntityService>>> {
        self.entities.read().get(entity_id).cloned()
    }

    fn services(&self) -> Vec<Arc<Mutex<EntityService>>> {
        self.entities.read().values().cloned().collect()
    }

    /// Rebuild every entity's merkle snapshots as of `now`.
    pub async fn regenerate_all(&self, now: Timestamp) -> Result<()> {
        for service in self.services() {
            service.lock().await.regenerate(now)?;
        }
        Ok(())
    }

    /// One pull-sync pass of every entity against `peer`. Returns the
    /// number of oplogs merged.
    pub async fn sync_all(&self, peer: &PeerId) -> Result<usize> {
        let mut merged = 0;
        for service in self.services() {
            merged += EntityService::sync_with(&service, self.transport.as_ref(), peer).await?;
        }
        Ok(merged)
    }

    /// Rotate one entity's operational key outside the timer cadence.
    pub async fn force_op_key(&self, entity_id: &Id, now: Timestamp) -> Result<()> {
        let service = self.service(entity_id).ok_or(Error::NotFound)?;
        let mut service = service.lock().await;
        service.rotate_op_key(now).await
    }

    /// Timer-driven rotation pass: every entity whose current master set
    /// includes this node gets a fresh operational key.
    pub async fn rotate_keys(&self, now: Timestamp) -> Result<()> {
        for service in self.services() {
            let mut service = service.lock().await;
            let is_master = service
                .ledger()
                .read()
                .current_masters()
                .contains(&self.keypair.id());
            if is_master {
                service.rotate_op_key(now).await?;
            }
        }
        Ok(())
    }

    /// Spawn the scheduler: periodic regeneration plus on-demand commands.
    pub fn spawn_scheduler(self: &Arc<Self>) -> NodeHandle {
        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity);
        let node = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.regen_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Rotation waits a full period before its first tick.
            let mut rotate = tokio::time::interval_at(
                tokio::time::Instant::now() + node.config.rotate_key_interval,
                node.config.rotate_key_interval,
            );
            rotate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = node.regenerate_all(Timestamp::now()).await {
                            warn!(node = %node.id, %e, "scheduled regeneration failed");
                        }
                    }
                    _ = rotate.tick() => {
                        if let Err(e) = node.rotate_keys(Timestamp::now()).await {
                            warn!(node = %node.id, %e, "scheduled key rotation failed");
                        }
                    }
                    cmd = rx.recv() => match cmd {
                        Some(Command::Regenerate) => {
                            if let Err(e) = node.regenerate_all(Timestamp::now()).await {
                                warn!(node = %node.id, %e, "forced regeneration failed");
                            }
                        }
                        Some(Command::ForceSync(peer)) => {
                            match node.sync_all(&peer).await {
                                Ok(merged) => {
                                    info!(node = %node.id, peer = %peer, merged, "forced sync done")
                                }
                                Err(e) => warn!(node = %node.id, peer = %peer, %e, "forced sync failed"),
                            }
                        }
                        Some(Command::ForceOpKey(entity_id)) => {
                            if let Err(e) = node.force_op_key(&entity_id, Timestamp::now()).await {
                                warn!(node = %node.id, %e, "forced key rotation failed");
                            }
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
            }
        });
        NodeHandle { tx, task }
    }
}

/// Control handle for a running scheduler.
pub struct NodeHandle {
    tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::Storage("scheduler task is gone".into()))
    }

    pub async fn regenerate(&self) -> Result<()> {
        self.send(Command::Regenerate).await
    }

    pub async fn force_sync(&self, peer: PeerId) -> Result<()> {
        self.send(Command::ForceSync(peer)).await
    }

    pub async fn force_op_key(&self, entity_id: Id) -> Result<()> {
        self.send(Command::ForceOpKey(entity_id)).await
    }

    /// Stop the scheduler and wait for it to drain.
    pub async fn shutdown(self) -> Result<()> {
        self.send(Command::Shutdown).await?;
        self.task
            .await
            .map_err(|e| Error::Storage(format!("scheduler join failed: {}", e)))
    }
}

/// Routes incoming requests to the owning entity service.
pub struct EntityRouter {
    entities: ServiceMap,
}

#[async_trait]
impl SyncHandler for EntityRouter {
    async fn handle(&self, request: SyncRequest) -> Result<SyncResponse> {
        let service = self
            .entities
            .read()
            .get(&request.entity_id())
            .cloned()
            .ok_or(Error::NotFound)?;
        let service = service.lock().await;
        service.handle(request)
    }
}
