//! Append-only oplog engine for Opweave.
//!
//! Mutations travel as signed, causally linked oplog records. This crate
//! owns the record format, its persistence, the validate/merge engine with
//! its pending buffer and sibling tie-break, master/member authorization,
//! and operational-key rotation. Merkle summarization of confirmed streams
//! lives in `opweave-merkle`; orchestration lives in `opweave-node`.

pub mod auth;
pub mod engine;
pub mod logstore;
pub mod opkey;
pub mod record;

pub use auth::{
    key_extra_pubkey, pubkey_extra, AllMasters, Majority, MasterChange, MasterInfo, MasterLedger,
    MemberInfo, QuorumPolicy,
};
pub use engine::{ApplyOp, MergeOutcome, OplogEngine};
pub use logstore::LogStore;
pub use opkey::{
    current_op_key, derive_material, derive_op_key, key_extra_material, material_extra,
    rotation_logs, OpKeyInfo, MAX_DERIVE_ITER,
};
pub use record::{Category, MasterSign, OpCode, Oplog};
