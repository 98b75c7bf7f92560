//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use kvlayer::driver::KeyFilter;
use kvlayer::{KvError, Operation, Result, SettingsOverrides, StorageDriver};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Notify, watch};

/// In-memory driver that records every call and can fail or stall writes
pub struct RecordingDriver {
    data: Mutex<BTreeMap<String, String>>,
    bulks: Mutex<Vec<Vec<Operation>>>,
    gets: AtomicUsize,
    fail_writes: AtomicBool,
    gate: watch::Sender<bool>,
    bulk_entered: Notify,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            bulks: Mutex::new(Vec::new()),
            gets: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            gate: watch::Sender::new(true),
            bulk_entered: Notify::new(),
        }
    }
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a raw value without going through the layer
    pub fn put_raw(&self, key: &str, value: &str) {
        self.data.lock().insert(key.to_string(), value.to_string());
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.data.lock().get(key).cloned()
    }

    /// Every `do_bulk` batch received so far
    pub fn bulks(&self) -> Vec<Vec<Operation>> {
        self.bulks.lock().clone()
    }

    pub fn bulk_count(&self) -> usize {
        self.bulks.lock().len()
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Stall `do_bulk` until [`RecordingDriver::open_gate`] is called
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Wait until a `do_bulk` call has started
    pub async fn bulk_started(&self) {
        self.bulk_entered.notified().await;
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(KvError::Driver("injected write failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageDriver for RecordingDriver {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn preferred_settings(&self) -> SettingsOverrides {
        SettingsOverrides::default()
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.raw(key))
    }

    async fn find_keys(&self, pattern: &str, anti_pattern: Option<&str>) -> Result<Vec<String>> {
        let filter = KeyFilter::new(pattern, anti_pattern);
        Ok(self
            .data
            .lock()
            .keys()
            .filter(|key| filter.matches(key))
            .cloned()
            .collect())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.check_writes()?;
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check_writes()?;
        self.data.lock().remove(key);
        Ok(())
    }

    async fn do_bulk(&self, operations: Vec<Operation>) -> Result<()> {
        self.bulks.lock().push(operations.clone());
        self.bulk_entered.notify_one();

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        self.check_writes()?;
        let mut data = self.data.lock();
        for operation in operations {
            match operation {
                Operation::Set { key, value } => {
                    data.insert(key, value);
                }
                Operation::Remove { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Overrides for a buffered layer with an explicit capacity and interval
pub fn overrides(cache_capacity: usize, write_interval_ms: u64) -> SettingsOverrides {
    SettingsOverrides {
        cache_capacity: Some(cache_capacity),
        write_interval_ms: Some(write_interval_ms),
        json_encode: Some(true),
    }
}
