//! Pod configuration.

use std::time::Duration;

use podfed_core::PodHost;
use podfed_sync::{ApplierConfig, PropagatorConfig};

/// Configuration for a [`Pod`](crate::Pod).
#[derive(Debug, Clone)]
pub struct PodConfig {
    /// This pod's own host.
    pub host: PodHost,
    /// Re-propagate events received from friends to our other friends.
    pub gossip: bool,
    /// How often accumulated views are turned into events.
    pub view_flush_interval: Duration,
    /// How often expired pending events are discarded.
    pub sweep_interval: Duration,
    pub applier: ApplierConfig,
    pub propagator: PropagatorConfig,
}

impl PodConfig {
    /// Default configuration for `host`.
    pub fn new(host: PodHost) -> Self {
        Self {
            host,
            gossip: true,
            view_flush_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            applier: ApplierConfig::default(),
            propagator: PropagatorConfig::default(),
        }
    }

    pub fn with_gossip(mut self, gossip: bool) -> Self {
        self.gossip = gossip;
        self
    }

    pub fn with_view_flush_interval(mut self, interval: Duration) -> Self {
        self.view_flush_interval = interval;
        self
    }
}
