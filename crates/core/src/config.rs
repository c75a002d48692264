//! Router configuration
//!
//! The single struct of knobs the core consumes. Loading it from disk or
//! CLI flags is the embedding application's job.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Reject every tunnel build request when false
    #[serde(default = "default_true")]
    pub accept_tunnels: bool,

    /// Store lease sets and publish the floodfill flag
    #[serde(default)]
    pub is_floodfill: bool,

    /// Shapes transit acceptance probability
    #[serde(default = "default_bandwidth")]
    pub bandwidth_limit_kbps: u32,

    /// Hard cap on concurrent transit tunnels
    #[serde(default = "default_max_transit")]
    pub max_transit_tunnels: usize,

    /// Reseed when the floodfill count drops below this
    #[serde(default = "default_min_floodfills")]
    pub min_floodfills: usize,

    /// Reseed when the router count drops below this
    #[serde(default = "default_min_routers")]
    pub min_routers: usize,

    /// Accepted I2NP expiration window, ms
    #[serde(default = "default_clock_skew")]
    pub clock_skew_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_bandwidth() -> u32 {
    2048
}

fn default_max_transit() -> usize {
    5000
}

fn default_min_floodfills() -> usize {
    5
}

fn default_min_routers() -> usize {
    25
}

fn default_clock_skew() -> u64 {
    60_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            accept_tunnels: true,
            is_floodfill: false,
            bandwidth_limit_kbps: default_bandwidth(),
            max_transit_tunnels: default_max_transit(),
            min_floodfills: default_min_floodfills(),
            min_routers: default_min_routers(),
            clock_skew_ms: default_clock_skew(),
        }
    }
}
