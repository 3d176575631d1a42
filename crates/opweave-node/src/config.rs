//! Node-level tuning knobs.

use std::time::Duration;

/// Configuration shared by every entity service a node hosts.
#[derive(Clone, Copy, Debug)]
pub struct NodeConfig {
    /// Cadence of wholesale merkle snapshot regeneration.
    pub regen_interval: Duration,
    /// Safety cutoff: only oplogs at least this old are summarized.
    pub sync_cutoff: Duration,
    /// Round budget for one divergence walk with one peer.
    pub max_sync_rounds: usize,
    /// Cadence of scheduled operational-key rotation.
    pub rotate_key_interval: Duration,
    /// Command channel depth for the scheduler task.
    pub channel_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            regen_interval: Duration::from_secs(900),
            sync_cutoff: Duration::from_secs(3_600),
            max_sync_rounds: 6,
            rotate_key_interval: Duration::from_secs(86_400),
            channel_capacity: 64,
        }
    }
}
