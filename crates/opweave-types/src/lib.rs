//! Core primitives shared by every Opweave crate.
//!
//! This crate is the leaf of the workspace: time-ordered identifiers,
//! millisecond timestamps, object/oplog status codes, content hashing,
//! ed25519 signing wrappers, the per-identifier lock registry and the
//! shared error taxonomy all live here.

pub mod error;
pub mod hash;
pub mod id;
pub mod lockmap;
pub mod sign;
pub mod status;
pub mod time;

pub use error::{Error, Result};
pub use hash::{Addr, Hasher};
pub use id::Id;
pub use lockmap::LockRegistry;
pub use sign::{Keypair, PubKey, Sig};
pub use status::Status;
pub use time::Timestamp;
