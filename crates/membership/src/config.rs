//! Ring configuration.

use std::time::Duration;

use ringmq_ring::DEFAULT_VIRTUAL_NODES;
use serde::{Deserialize, Serialize};

/// Settings for the ring listener and the membership protocol.
///
/// Field aliases accept the camel-case keys of existing configuration files
/// (`joinTimeout`, ...).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Host the ring listener binds to and advertises.
    pub host: String,

    /// Port of the ring listener; 0 picks an ephemeral port.
    pub port: u16,

    /// How long `join` may take before failing.
    #[serde(alias = "joinTimeout")]
    pub join_timeout_ms: u64,

    /// Quiet period after which a joined view counts as converged.
    #[serde(alias = "settle")]
    pub settle_ms: u64,

    /// Interval between anti-entropy sync rounds.
    #[serde(alias = "gossipInterval")]
    pub gossip_interval_ms: u64,

    /// How long a sync round waits for the peer.
    #[serde(alias = "probeTimeout")]
    pub probe_timeout_ms: u64,

    /// Consecutive failed rounds before a peer is declared departed.
    #[serde(alias = "failureThreshold")]
    pub failure_threshold: u32,

    /// Virtual positions per node.
    #[serde(alias = "virtualNodes")]
    pub virtual_nodes: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            join_timeout_ms: 1000,
            settle_ms: 50,
            gossip_interval_ms: 500,
            probe_timeout_ms: 1000,
            failure_threshold: 3,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

impl RingConfig {
    /// Join timeout as a duration.
    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Settle window as a duration.
    #[must_use]
    pub const fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Gossip interval as a duration.
    #[must_use]
    pub const fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    /// Probe timeout as a duration.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
