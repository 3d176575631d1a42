//! Persistence layer for replicated objects.
//!
//! Two contracts live here:
//!
//! - [`kv::KvStore`]: the storage collaborator the core depends on - point
//!   get/put, prefix-ordered iteration, atomic batched writes and
//!   delete-by-prefix. [`kv::MemKv`] is the in-process implementation used
//!   by tests and the simulation driver.
//! - [`object::Replicated`] + [`object::ObjectStore`]: the lifecycle
//!   contract every replicated object kind (master, member, op-key, domain
//!   entities) implements, with the `{prefix}{entity}{id}` index key layout
//!   and the `is_locked` re-entrant calling convention.

pub mod keys;
pub mod kv;
pub mod object;

pub use kv::{KvStore, MemKv, WriteBatch};
pub use object::{ObjectCore, ObjectStore, Replicated};
