use serde::{Deserialize, Serialize};

/// Default number of entries kept in the read cache
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Default flush interval in milliseconds
pub const DEFAULT_WRITE_INTERVAL_MS: u64 = 100;

/// Resolved settings of a cache and buffer layer
///
/// Built once through [`Settings::resolve`] and never mutated afterwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Maximum number of tracked entries before eviction kicks in (0 disables caching)
    pub cache_capacity: usize,
    /// Flush interval in milliseconds (0 makes every write synchronous)
    pub write_interval_ms: u64,
    /// Whether values are JSON-encoded strings at the driver boundary
    pub json_encode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            write_interval_ms: DEFAULT_WRITE_INTERVAL_MS,
            json_encode: true,
        }
    }
}

impl Settings {
    /// Resolve settings: core defaults < driver preferences < caller overrides
    pub fn resolve(driver: &SettingsOverrides, caller: &SettingsOverrides) -> Self {
        Self::default().apply(driver).apply(caller)
    }

    fn apply(self, overrides: &SettingsOverrides) -> Self {
        Self {
            cache_capacity: overrides.cache_capacity.unwrap_or(self.cache_capacity),
            write_interval_ms: overrides.write_interval_ms.unwrap_or(self.write_interval_ms),
            json_encode: overrides.json_encode.unwrap_or(self.json_encode),
        }
    }

    /// Whether the read cache is enabled
    pub fn caching(&self) -> bool {
        self.cache_capacity > 0
    }

    /// Whether writes are buffered and flushed on a timer
    pub fn buffering(&self) -> bool {
        self.write_interval_ms > 0
    }
}

/// Partial settings supplied by a driver or by the caller
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SettingsOverrides {
    pub cache_capacity: Option<usize>,
    pub write_interval_ms: Option<u64>,
    pub json_encode: Option<bool>,
}

/// Statistics for a cache and buffer layer
#[derive(Debug, Default, Clone, Serialize)]
pub struct BufferStats {
    /// Number of entries currently tracked
    pub entries: usize,
    /// Number of tracked entries with unflushed writes
    pub dirty_entries: usize,
    /// Number of GET operations
    pub reads: u64,
    /// GETs answered from the buffer
    pub cache_hits: u64,
    /// GETs that went to the driver
    pub driver_reads: u64,
    /// Number of accepted SET/REMOVE operations
    pub writes: u64,
    /// Dirty values replaced before they were flushed
    pub writes_obsoleted: u64,
    /// Completed flush cycles that reached the driver
    pub flushes: u64,
    /// Operations handed to the driver by flush cycles
    pub flushed_operations: u64,
    /// Flush cycles whose bulk call failed
    pub flush_failures: u64,
    /// Entries removed by eviction
    pub evictions: u64,
}

impl BufferStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        if self.reads == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.reads as f64
        }
    }
}
