//! Storage driver contract
//!
//! A driver provides raw string persistence for one backend. The cache and
//! buffer layer is the only consumer: it encodes values before they reach the
//! driver and hands buffered writes over in bulk.

pub mod dirty;
pub mod glob;
pub mod memory;

pub use dirty::DirtyDriver;
pub use glob::KeyFilter;
pub use memory::MemoryDriver;

use crate::core::{KvError, Result, SettingsOverrides};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Names accepted by [`open_driver`]
pub const AVAILABLE_DRIVERS: &[&str] = &["memory", "dirty"];

/// A single materialized write handed to [`StorageDriver::do_bulk`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Set { key: String, value: String },
    Remove { key: String },
}

impl Operation {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Remove { key } => key,
        }
    }
}

/// Driver-specific settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Backing file for file-based drivers
    pub filename: Option<PathBuf>,
    /// Sync file data to disk after every batch
    pub fsync: bool,
}

/// Pluggable key-value backend
///
/// Values are already encoded strings. `get` returns `None` for absent keys.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Driver name used in logs and metric labels
    fn name(&self) -> &'static str;

    /// Settings this driver prefers over the core defaults
    fn preferred_settings(&self) -> SettingsOverrides {
        SettingsOverrides::default()
    }

    /// Open connections and create storage if absent. Must be idempotent.
    async fn init(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Keys matching `pattern` and not matching `anti_pattern`
    async fn find_keys(&self, _pattern: &str, _anti_pattern: Option<&str>) -> Result<Vec<String>> {
        Err(KvError::NotSupported(format!(
            "driver '{}' cannot list keys",
            self.name()
        )))
    }

    async fn set(&self, key: &str, value: String) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Apply a batch of operations. Atomicity across the batch is not required.
    async fn do_bulk(&self, operations: Vec<Operation>) -> Result<()> {
        for operation in operations {
            match operation {
                Operation::Set { key, value } => self.set(&key, value).await?,
                Operation::Remove { key } => self.remove(&key).await?,
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()>;
}

/// Construct a driver by name
pub fn open_driver(name: &str, config: &DriverConfig) -> Result<Arc<dyn StorageDriver>> {
    match name {
        "memory" => Ok(Arc::new(MemoryDriver::new())),
        "dirty" => {
            let path = config.filename.clone().ok_or_else(|| {
                KvError::Config("driver 'dirty' requires driver_settings.filename".to_string())
            })?;
            Ok(Arc::new(DirtyDriver::new(path, config.fsync)))
        }
        other => Err(KvError::UnknownDriver(format!(
            "{} (available: {})",
            other,
            AVAILABLE_DRIVERS.join(", ")
        ))),
    }
}
