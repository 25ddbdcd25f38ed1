//! Stream configuration

use serde::{Deserialize, Serialize};

/// Per-stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HdsConfig {
    /// Network caching delay in milliseconds, reported to the host as the
    /// PTS delay
    pub network_caching_ms: u64,

    /// How far ahead of the read position VOD fragments are scheduled,
    /// in seconds
    pub download_lead_time_secs: u64,

    /// Maximum size of a single downloaded fragment in bytes
    pub max_fragment_bytes: usize,

    /// Lower bound on the live bootstrap polling interval in milliseconds
    pub live_poll_floor_ms: u64,
}

impl Default for HdsConfig {
    fn default() -> Self {
        Self {
            network_caching_ms: 1000,
            download_lead_time_secs: 15,
            max_fragment_bytes: 50 * 1024 * 1024,
            live_poll_floor_ms: 500,
        }
    }
}
