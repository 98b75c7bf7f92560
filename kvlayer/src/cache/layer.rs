use super::entry::{BufferEntry, Completion, EntryState, WriteAck};
use super::eviction::evict_cold;
use crate::core::value::{get_path, set_path};
use crate::core::{BufferStats, KvError, Result, Settings, SettingsOverrides};
use crate::driver::{Operation, StorageDriver};
use crate::metrics;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Callback for failed writes whose [`WriteAck`] was dropped
pub type UnattendedHook = Arc<dyn Fn(&str, &KvError) + Send + Sync>;

fn default_unattended_hook() -> UnattendedHook {
    Arc::new(|key, err| {
        error!(key, error = %err, "Unattended write failed, value was not persisted");
    })
}

/// Read cache and write buffer in front of a [`StorageDriver`]
///
/// Writes land in the buffer and are handed to the driver in bulk by a
/// periodic flush. Reads are answered from the buffer when possible. The
/// layer does not order operations on the same key; callers that share a key
/// go through [`crate::Database`].
#[derive(Clone)]
pub struct CacheAndBufferLayer {
    inner: Arc<LayerInner>,
}

struct LayerInner {
    driver: Arc<dyn StorageDriver>,
    driver_name: &'static str,
    settings: Settings,
    state: Mutex<BufferState>,
    flushing: AtomicBool,
    closed: AtomicBool,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    unattended_hook: RwLock<UnattendedHook>,
}

#[derive(Default)]
struct BufferState {
    entries: HashMap<String, BufferEntry>,
    clock: u64,
    drain_waiters: Vec<oneshot::Sender<()>>,
    stats: BufferStats,
}

impl BufferState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn is_drained(&self) -> bool {
        self.entries.values().all(|e| !e.dirty && !e.write_in_flight)
    }

    fn notify_if_drained(&mut self) {
        if self.drain_waiters.is_empty() || !self.is_drained() {
            return;
        }
        debug!("Write buffer drained, releasing {} waiters", self.drain_waiters.len());
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

/// Clears the in-progress flag when a flush ends, even if it is cancelled
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CacheAndBufferLayer {
    /// Wrap a driver, resolving settings against the driver's preferences
    pub fn new(driver: Arc<dyn StorageDriver>, overrides: SettingsOverrides) -> Self {
        let settings = Settings::resolve(&driver.preferred_settings(), &overrides);
        Self::with_settings(driver, settings)
    }

    /// Wrap a driver with fully resolved settings
    ///
    /// Inside a Tokio runtime the flush task starts right away; otherwise it
    /// starts with [`init`](Self::init).
    pub fn with_settings(driver: Arc<dyn StorageDriver>, settings: Settings) -> Self {
        let driver_name = driver.name();
        info!(
            "Initializing cache and buffer layer for driver {} with cache_capacity={}, write_interval={}ms, json_encode={}",
            driver_name, settings.cache_capacity, settings.write_interval_ms, settings.json_encode
        );

        let layer = Self {
            inner: Arc::new(LayerInner {
                driver,
                driver_name,
                settings,
                state: Mutex::new(BufferState::default()),
                flushing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                flush_task: Mutex::new(None),
                unattended_hook: RwLock::new(default_unattended_hook()),
            }),
        };
        layer.ensure_flush_task();
        layer
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn driver_name(&self) -> &'static str {
        self.inner.driver_name
    }

    /// Replace the handler for failed writes nobody was waiting on
    pub fn set_unattended_hook<F>(&self, hook: F)
    where
        F: Fn(&str, &KvError) + Send + Sync + 'static,
    {
        *self.inner.unattended_hook.write() = Arc::new(hook);
    }

    /// Initialize the driver and start the flush task if it is not running yet
    pub async fn init(&self) -> Result<()> {
        self.inner.driver.init().await?;
        self.ensure_flush_task();
        Ok(())
    }

    fn ensure_flush_task(&self) {
        if !self.settings().buffering() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            debug!("No runtime yet, flush task deferred to init");
            return;
        };

        let mut task = self.inner.flush_task.lock();
        if task.is_some() {
            return;
        }

        let interval_ms = self.settings().write_interval_ms;
        info!("Starting flush task (interval={}ms)", interval_ms);

        let weak: Weak<LayerInner> = Arc::downgrade(&self.inner);
        *task = Some(handle.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                CacheAndBufferLayer { inner }.flush().await;
            }

            debug!("Flush task terminated");
        }));
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(KvError::Closed)
        } else {
            Ok(())
        }
    }

    fn encode(&self, value: &Value) -> Result<String> {
        if self.settings().json_encode {
            return serde_json::to_string(value).map_err(|e| KvError::InvalidValue(e.to_string()));
        }
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Err(KvError::InvalidValue(format!(
                "json_encode is disabled, only strings can be stored (got {})",
                other
            ))),
        }
    }

    fn decode(&self, key: &str, raw: String) -> Result<Value> {
        if !self.settings().json_encode {
            return Ok(Value::String(raw));
        }
        serde_json::from_str(&raw).map_err(|e| KvError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn evict_locked(&self, state: &mut BufferState) {
        let evicted = evict_cold(&mut state.entries, self.settings().cache_capacity);
        if evicted > 0 {
            state.stats.evictions += evicted as u64;
            debug!(
                "Evicted {} cold entries ({} remaining)",
                evicted,
                state.entries.len()
            );
            metrics::record_evictions(self.driver_name(), evicted);
        }
        metrics::set_buffer_entries(self.driver_name(), state.entries.len());
    }

    /// Get a value by key
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        let caching = self.settings().caching();

        {
            let mut state = self.inner.state.lock();
            state.stats.reads += 1;
            let now = state.tick();

            // Unflushed entries are visible even with caching disabled
            let hit = state
                .entries
                .get_mut(key)
                .filter(|e| caching || e.dirty || e.write_in_flight)
                .map(|e| {
                    e.touch(now);
                    e.value.clone()
                });

            if let Some(value) = hit {
                state.stats.cache_hits += 1;
                drop(state);
                debug!(key, "GET served from buffer");
                metrics::record_read(self.driver_name(), "cache", "success");
                return Ok(value);
            }

            state.stats.driver_reads += 1;
        }

        debug!(key, "GET from driver");
        let raw = match self.inner.driver.get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Driver read failed");
                metrics::record_read(self.driver_name(), "driver", "error");
                return Err(e);
            }
        };

        let value = match raw {
            Some(raw) => match self.decode(key, raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    metrics::record_read(self.driver_name(), "driver", "decode_error");
                    return Err(e);
                }
            },
            None => None,
        };
        metrics::record_read(self.driver_name(), "driver", "success");

        if caching {
            let mut state = self.inner.state.lock();
            let now = state.tick();
            // A write that raced this read wins
            state
                .entries
                .entry(key.to_string())
                .or_insert_with(|| BufferEntry::clean(value.clone(), now));
            self.evict_locked(&mut state);
        }

        Ok(value)
    }

    /// Keys matching `pattern` and not matching `anti_pattern`, straight from the driver
    pub async fn find_keys(&self, pattern: &str, anti_pattern: Option<&str>) -> Result<Vec<String>> {
        self.ensure_open()?;
        debug!(pattern, anti_pattern, "FIND KEYS");

        let keys = self.inner.driver.find_keys(pattern, anti_pattern).await?;

        // A key scan usually precedes a burst of reads
        let mut state = self.inner.state.lock();
        self.evict_locked(&mut state);

        Ok(keys)
    }

    /// Set a value; `None` or `null` removes the key
    pub async fn set(&self, key: &str, value: Option<Value>) -> Result<WriteAck> {
        self.ensure_open()?;
        let value = value.filter(|v| !v.is_null());
        if !self.settings().json_encode {
            if let Some(v) = &value {
                self.encode(v)?;
            }
        }

        if self.settings().buffering() {
            let (tx, rx) = oneshot::channel();
            {
                let mut state = self.inner.state.lock();
                // Checked under the lock so close() either drains this write or rejects it
                if self.inner.closed.load(Ordering::Acquire) {
                    return Err(KvError::Closed);
                }
                let now = state.tick();
                let entry = state
                    .entries
                    .entry(key.to_string())
                    .or_insert_with(|| BufferEntry::new(now));
                let obsoleted = entry.dirty;
                entry.value = value;
                entry.dirty = true;
                entry.touch(now);
                entry.pending.push(tx);

                state.stats.writes += 1;
                if obsoleted {
                    state.stats.writes_obsoleted += 1;
                }
                self.evict_locked(&mut state);
            }

            debug!(key, "SET buffered");
            metrics::record_write(self.driver_name(), "buffered", "accepted");
            return Ok(WriteAck::pending(rx));
        }

        let result = match &value {
            Some(v) => {
                let encoded = self.encode(v)?;
                self.inner.driver.set(key, encoded).await
            }
            None => self.inner.driver.remove(key).await,
        };

        if let Err(e) = result {
            warn!(key, error = %e, "Direct write failed");
            metrics::record_write(self.driver_name(), "direct", "error");
            return Err(e);
        }

        {
            let mut state = self.inner.state.lock();
            state.stats.writes += 1;
            if self.settings().caching() {
                let now = state.tick();
                let entry = state
                    .entries
                    .entry(key.to_string())
                    .or_insert_with(|| BufferEntry::new(now));
                entry.value = value;
                entry.touch(now);
                self.evict_locked(&mut state);
            }
        }

        debug!(key, "SET written through");
        metrics::record_write(self.driver_name(), "direct", "success");
        Ok(WriteAck::persisted_now())
    }

    /// Remove a key
    pub async fn remove(&self, key: &str) -> Result<WriteAck> {
        self.set(key, None).await
    }

    /// Get the value at `path` inside the value stored under `key`
    pub async fn get_sub(&self, key: &str, path: &[&str]) -> Result<Option<Value>> {
        let base = self.get(key).await?;
        Ok(base.as_ref().and_then(|v| get_path(v, path)).cloned())
    }

    /// Replace the value at `path` inside the value stored under `key`
    ///
    /// Read-modify-write built on `get` and `set`; not atomic with respect to
    /// other writers of the same key.
    pub async fn set_sub(&self, key: &str, path: &[&str], value: Option<Value>) -> Result<WriteAck> {
        let base = self.get(key).await?;
        let updated = set_path(base, path, value)?;
        self.set(key, updated).await
    }

    /// Run one flush cycle
    ///
    /// Returns the number of operations handed to the driver; `0` when nothing
    /// was dirty or another flush was already running.
    pub async fn flush(&self) -> usize {
        let inner = &self.inner;
        if inner
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Flush already in progress, skipping");
            return 0;
        }
        let _flushing = FlushGuard(&inner.flushing);

        let mut operations = Vec::new();
        let mut completions: Vec<(String, Completion)> = Vec::new();
        let mut rejected: Vec<(String, Completion, KvError)> = Vec::new();

        {
            let mut state = inner.state.lock();
            for (key, entry) in state.entries.iter_mut().filter(|(_, e)| e.dirty) {
                let pending = std::mem::take(&mut entry.pending);
                entry.dirty = false;

                let operation = match &entry.value {
                    Some(v) => self.encode(v).map(|value| Operation::Set {
                        key: key.clone(),
                        value,
                    }),
                    None => Ok(Operation::Remove { key: key.clone() }),
                };

                match operation {
                    Ok(operation) => {
                        entry.write_in_flight = true;
                        operations.push(operation);
                        completions.extend(pending.into_iter().map(|tx| (key.clone(), tx)));
                    }
                    Err(e) => {
                        rejected.extend(pending.into_iter().map(|tx| (key.clone(), tx, e.clone())));
                    }
                }
            }

            if operations.is_empty() {
                state.notify_if_drained();
            }
        }

        for (key, tx, err) in rejected {
            self.deliver(&key, tx, Err(err));
        }

        if operations.is_empty() {
            return 0;
        }

        let count = operations.len();
        let keys: Vec<String> = operations.iter().map(|op| op.key().to_string()).collect();
        debug!("Flushing {} operations to driver {}", count, self.driver_name());

        let started = Instant::now();
        let result = inner.driver.do_bulk(operations).await;
        let elapsed = started.elapsed();

        {
            let mut state = inner.state.lock();
            let caching = self.settings().caching();
            for key in &keys {
                let drop_clean = match state.entries.get_mut(key) {
                    Some(entry) => {
                        entry.write_in_flight = false;
                        !caching && !entry.dirty
                    }
                    None => false,
                };
                if drop_clean {
                    state.entries.remove(key);
                }
            }

            state.stats.flushes += 1;
            state.stats.flushed_operations += count as u64;
            if result.is_err() {
                state.stats.flush_failures += 1;
            }

            self.evict_locked(&mut state);
            state.notify_if_drained();
        }

        match &result {
            Ok(()) => {
                debug!("Flushed {} operations in {:?}", count, elapsed);
                metrics::record_flush(self.driver_name(), "success", count, elapsed.as_secs_f64());
            }
            Err(e) => {
                warn!("Bulk flush of {} operations failed: {}", count, e);
                metrics::record_flush(self.driver_name(), "error", count, elapsed.as_secs_f64());
            }
        }

        for (key, tx) in completions {
            self.deliver(&key, tx, result.clone());
        }

        count
    }

    fn deliver(&self, key: &str, tx: Completion, result: Result<()>) {
        // A dropped receiver means nobody awaits this write
        if let Err(Err(e)) = tx.send(result) {
            metrics::record_unattended_failure(self.driver_name());
            let hook = self.inner.unattended_hook.read().clone();
            hook(key, &e);
        }
    }

    /// Wait until no entry is dirty or in flight
    ///
    /// Runs flush cycles itself instead of waiting for the next tick. Returns
    /// immediately when writes are not buffered, since every write is already
    /// durable.
    pub async fn do_shutdown(&self) {
        if !self.settings().buffering() {
            return;
        }

        let mut rx = {
            let mut state = self.inner.state.lock();
            if state.is_drained() {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.drain_waiters.push(tx);
            rx
        };

        info!("Waiting for write buffer to drain");
        let interval = Duration::from_millis(self.settings().write_interval_ms);
        loop {
            self.flush().await;
            match rx.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {
                    // Another flush may be running; retry once it had time to finish
                    tokio::select! {
                        _ = &mut rx => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                _ => break,
            }
        }
    }

    /// Drain the buffer, stop the flush task and close the driver
    pub async fn close(&self) -> Result<()> {
        // New writes are rejected from here on; the drain below still flushes
        self.inner.closed.store(true, Ordering::Release);
        self.do_shutdown().await;

        if let Some(task) = self.inner.flush_task.lock().take() {
            task.abort();
        }

        self.inner.driver.close().await?;
        info!("Closed cache and buffer layer for driver {}", self.driver_name());
        Ok(())
    }

    /// Get statistics
    pub fn stats(&self) -> BufferStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.entries = state.entries.len();
        stats.dirty_entries = state.entries.values().filter(|e| e.dirty).count();
        stats
    }

    /// Number of tracked entries
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer flags of a tracked key
    pub fn entry_state(&self, key: &str) -> Option<EntryState> {
        self.inner.state.lock().entries.get(key).map(EntryState::from)
    }
}

impl Drop for LayerInner {
    fn drop(&mut self) {
        if let Some(task) = self.flush_task.get_mut().take() {
            task.abort();
        }
        let dirty = self
            .state
            .get_mut()
            .entries
            .values()
            .filter(|e| e.dirty)
            .count();
        if dirty > 0 {
            warn!(
                "Dropping buffer for driver {} with {} unflushed entries",
                self.driver_name, dirty
            );
        }
    }
}
