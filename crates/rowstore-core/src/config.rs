//! Configuration management for RowStore
//!
//! Provides hardware tier presets and validation. Every table opened by the
//! same process shares one `Config`.

use std::time::Duration;

/// Ordered structure backing newly created field keepers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperKind {
    /// Unbalanced binary search tree with range-pruned condition search
    Tree,
    /// Sorted map with bounded range scans
    Map,
}

/// RowStore configuration with hardware tier presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Consecutive row ids stored in one row data file
    pub rows_per_file: u64,
    /// Flushed buffer elements kept in memory before eviction
    pub buffer_max_size: usize,
    /// Idle window after which the background destroyer persists state
    pub idle_destroy: Duration,
    /// Structure used for new field keepers
    pub keeper_kind: KeeperKind,
    /// fsync data after every write and every temp-file swap
    pub durable_writes: bool,
    /// Verify CRC32C of every decoded blob
    pub verify_checksums: bool,
}

impl Config {
    /// Server-class: large buffers, long idle window, full durability
    pub fn server() -> Self {
        Self {
            rows_per_file: 10_000,
            buffer_max_size: 100_000,
            idle_destroy: Duration::from_secs(5),
            keeper_kind: KeeperKind::Map,
            durable_writes: true,
            verify_checksums: true,
        }
    }

    /// Desktop-class: moderate buffers, tree keepers
    pub fn desktop() -> Self {
        Self {
            rows_per_file: 5_000,
            buffer_max_size: 20_000,
            idle_destroy: Duration::from_secs(3),
            keeper_kind: KeeperKind::Tree,
            durable_writes: true,
            verify_checksums: true,
        }
    }

    /// Budget-class: small buffers, no fsync on every write
    pub fn budget() -> Self {
        Self {
            rows_per_file: 1_000,
            buffer_max_size: 2_000,
            idle_destroy: Duration::from_secs(1),
            keeper_kind: KeeperKind::Tree,
            durable_writes: false,
            verify_checksums: false,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.rows_per_file == 0 {
            return Err("rows_per_file must be > 0".into());
        }
        if self.buffer_max_size == 0 {
            return Err("buffer_max_size must be > 0".into());
        }
        if self.idle_destroy.as_millis() == 0 {
            return Err("idle_destroy must be > 0".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}
