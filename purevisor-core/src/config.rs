//! Core configuration options
//!
//! One plain struct passed by reference into the subsystems that consume
//! it. There is no global mutable configuration.

/// Options recognized by the core, with their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    /// CPU overcommit ratio in percent (200 = 2:1).
    pub cpu_overcommit_ratio: u32,
    /// Memory overcommit ratio in percent (150 = 1.5:1).
    pub memory_overcommit_ratio: u32,
    /// Pool extent size in bytes.
    pub extent_size: u64,
    /// Leader heartbeat cadence in milliseconds.
    pub heartbeat_ms: u64,
    /// Election timeout window, inclusive lower bound.
    pub election_min_ms: u64,
    /// Election timeout window, exclusive upper bound.
    pub election_max_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            cpu_overcommit_ratio: 200,
            memory_overcommit_ratio: 150,
            extent_size: 4 * 1024 * 1024,
            heartbeat_ms: 150,
            election_min_ms: 300,
            election_max_ms: 500,
        }
    }
}
