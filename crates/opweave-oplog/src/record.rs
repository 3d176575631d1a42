//! The oplog record: one proposed or confirmed mutation.
//!
//! An oplog is content-addressed: its `hash` digests every immutable field,
//! the creator signs that hash, and each authorizing master co-signs the
//! same hash. Any field tampering invalidates the digest, any signature
//! stripping invalidates authorization.

use opweave_types::{Addr, Hasher, Id, Keypair, Sig, Status, Timestamp};
use serde::{Deserialize, Serialize};

/// Which oplog stream an entry belongs to.
///
/// Each entity keeps independent streams (and merkle trees) per category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Master,
    Member,
    OpKey,
    Entity,
}

impl Category {
    /// Keyspace prefix for persisted oplogs of this category.
    pub fn log_prefix(&self) -> [u8; 4] {
        match self {
            Category::Master => *b".mal",
            Category::Member => *b".mbl",
            Category::OpKey => *b".okl",
            Category::Entity => *b".enl",
        }
    }

    /// Keyspace prefix for merkle metadata of this category.
    pub fn meta_prefix(&self) -> [u8; 4] {
        match self {
            Category::Master => *b".mam",
            Category::Member => *b".mbm",
            Category::OpKey => *b".okm",
            Category::Entity => *b".enm",
        }
    }

    pub const ALL: [Category; 4] = [
        Category::Master,
        Category::Member,
        Category::OpKey,
        Category::Entity,
    ];
}

/// The mutation kind an oplog proposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    AddMaster,
    RemoveMaster,
    AddMember,
    RemoveMember,
    CreateOpKey,
    RevokeOpKey,
    CreateEntity,
    UpdateEntity,
    DeleteEntity,
    MigrateEntity,
}

impl OpCode {
    /// Ops that create their target object (genesis of an object chain).
    pub fn is_genesis(&self) -> bool {
        matches!(
            self,
            OpCode::AddMaster | OpCode::AddMember | OpCode::CreateOpKey | OpCode::CreateEntity
        )
    }
}

/// One authorizing master signature over the oplog hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSign {
    pub signer: Id,
    pub sig: Sig,
}

/// A signed, causally linked record of one proposed mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Oplog {
    pub id: Id,
    /// The target object.
    pub obj_id: Id,
    /// The entity whose stream this log belongs to.
    pub entity_id: Id,
    pub category: Category,
    pub op: OpCode,
    /// Causal predecessor for `obj_id`; `None` for the first log.
    pub pre_log_id: Option<Id>,
    /// The master oplog whose authorization set was active when this log
    /// was authorized.
    pub master_log_id: Id,
    pub creator_id: Id,
    pub create_ts: Timestamp,
    pub update_ts: Timestamp,
    /// Content digest over the immutable fields.
    pub hash: Addr,
    pub creator_sig: Option<Sig>,
    /// Ordered authorizing signatures, one per master.
    pub master_signs: Vec<MasterSign>,
    /// Op-specific payload (e.g. a public key or derived key material).
    pub key_extra: Option<serde_json::Value>,
    /// Whether this peer has locally applied the log's effect.
    pub is_sync: bool,
    /// Tie-break hint for equal-timestamp siblings.
    pub is_newer: bool,
    /// Derived: Pending until merged, then Alive / Internal / Invalid.
    pub status: Status,
}

impl Oplog {
    /// Build an unsigned oplog and compute its content hash.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        obj_id: Id,
        entity_id: Id,
        category: Category,
        op: OpCode,
        pre_log_id: Option<Id>,
        master_log_id: Id,
        creator_id: Id,
        create_ts: Timestamp,
        key_extra: Option<serde_json::Value>,
    ) -> Self {
        let id = Id::generate(creator_id.as_bytes(), create_ts);
        let mut log = Oplog {
            id,
            obj_id,
            entity_id,
            category,
            op,
            pre_log_id,
            master_log_id,
            creator_id,
            create_ts,
            update_ts: create_ts,
            hash: Addr::zero(),
            creator_sig: None,
            master_signs: Vec::new(),
            key_extra,
            is_sync: false,
            is_newer: false,
            status: Status::Pending,
        };
        log.hash = log.compute_hash();
        log
    }

    /// Digest over every immutable field.
    pub fn compute_hash(&self) -> Addr {
        let mut h = Hasher::new();
        h.update(self.id.as_bytes());
        h.update(self.obj_id.as_bytes());
        h.update(self.entity_id.as_bytes());
        h.update(&[category_byte(self.category), op_byte(self.op)]);
        match &self.pre_log_id {
            Some(pre) => {
                h.update(&[1]);
                h.update(pre.as_bytes());
            }
            None => h.update(&[0]),
        }
        h.update(self.master_log_id.as_bytes());
        h.update(self.creator_id.as_bytes());
        h.update(&self.create_ts.as_millis().to_be_bytes());
        if let Some(extra) = &self.key_extra {
            // serde_json renders maps with sorted keys, so this is stable.
            h.update(extra.to_string().as_bytes());
        }
        h.finalize()
    }

    /// Verify the content digest matches the fields.
    pub fn verify_hash(&self) -> bool {
        self.compute_hash() == self.hash
    }

    /// Sign as creator.
    pub fn sign_creator(&mut self, keypair: &Keypair) {
        self.creator_sig = Some(keypair.sign(self.hash.as_bytes()));
    }

    /// Append one master's authorizing signature.
    pub fn sign_master(&mut self, keypair: &Keypair) {
        let sig = keypair.sign(self.hash.as_bytes());
        self.master_signs.push(MasterSign {
            signer: keypair.id(),
            sig,
        });
    }

    /// Ids of all master signers, in signing order.
    pub fn master_signers(&self) -> Vec<Id> {
        self.master_signs.iter().map(|m| m.signer).collect()
    }

    /// The genesis master oplog authorizes itself: first log of the master
    /// stream, adding the entity creator as sole master.
    pub fn is_self_authorizing(&self) -> bool {
        self.category == Category::Master
            && self.op == OpCode::AddMaster
            && self.pre_log_id.is_none()
            && self.master_log_id == self.id
    }

    /// Sibling tie-break key: `(create_ts, id)` ascending, first wins.
    pub fn tie_break_key(&self) -> (Timestamp, Id) {
        (self.create_ts, self.id)
    }
}

fn category_byte(c: Category) -> u8 {
    match c {
        Category::Master => 0,
        Category::Member => 1,
        Category::OpKey => 2,
        Category::Entity => 3,
    }
}

fn op_byte(op: OpCode) -> u8 {
    match op {
        OpCode::AddMaster => 0,
        OpCode::RemoveMaster => 1,
        OpCode::AddMember => 2,
        OpCode::RemoveMember => 3,
        OpCode::CreateOpKey => 4,
        OpCode::RevokeOpKey => 5,
        OpCode::CreateEntity => 6,
        OpCode::UpdateEntity => 7,
        OpCode::DeleteEntity => 8,
        OpCode::MigrateEntity => 9,
    }
}
