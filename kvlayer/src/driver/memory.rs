use super::{KeyFilter, StorageDriver};
use crate::core::{Result, SettingsOverrides};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

/// Process-local driver backed by an ordered map
#[derive(Debug, Default)]
pub struct MemoryDriver {
    data: RwLock<BTreeMap<String, String>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn preferred_settings(&self) -> SettingsOverrides {
        // Data already lives in memory
        SettingsOverrides {
            cache_capacity: Some(0),
            write_interval_ms: Some(0),
            json_encode: None,
        }
    }

    async fn init(&self) -> Result<()> {
        debug!("Memory driver ready");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn find_keys(&self, pattern: &str, anti_pattern: Option<&str>) -> Result<Vec<String>> {
        let filter = KeyFilter::new(pattern, anti_pattern);
        Ok(self
            .data
            .read()
            .keys()
            .filter(|k| filter.matches(k))
            .cloned()
            .collect())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
