pub mod cache;
pub mod config;
pub mod core;
pub mod driver;
pub mod metrics;
pub mod serial;

// Re-export commonly used types
pub use cache::{CacheAndBufferLayer, EntryState, UnattendedHook, WriteAck};
pub use config::{DatabaseConfig, LoggingConfig};
pub use core::{BufferStats, KvError, Result, Settings, SettingsOverrides};
pub use driver::{
    AVAILABLE_DRIVERS, DirtyDriver, DriverConfig, MemoryDriver, Operation, StorageDriver,
    open_driver,
};
pub use serial::{Database, DbFuture};
