//! Async orchestration for Opweave peers.
//!
//! Ties the lower crates together: per-entity services bundling oplog
//! engines with merkle trees, a request/response transport seam with an
//! in-memory implementation, and a scheduler task driving periodic merkle
//! regeneration plus forced sync and key rotation.

pub mod config;
pub mod entity;
pub mod node;
pub mod transport;

pub use config::NodeConfig;
pub use entity::{name_extra, EntityInfo, EntityService};
pub use node::{Command, EntityRouter, Node, NodeHandle};
pub use transport::{MemoryTransport, PeerId, SyncHandler, SyncRequest, SyncResponse, Transport};
