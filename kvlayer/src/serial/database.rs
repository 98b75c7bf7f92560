use super::key_queue::{KeyQueues, QueueKey};
use crate::cache::{CacheAndBufferLayer, WriteAck};
use crate::config::DatabaseConfig;
use crate::core::value::{isolate, materialize};
use crate::core::{BufferStats, KvError, Result, Settings, SettingsOverrides};
use crate::driver::{StorageDriver, open_driver};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

/// Future returned by [`Database`] operations
///
/// The operation takes its place in the key's queue and starts running when
/// the method is called. Awaiting the future only collects the result, so a
/// future that is dropped or never polled does not hold up the key.
pub type DbFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Key-value database with per-key ordering and value isolation
///
/// Operations addressed to the same key run one at a time in call order;
/// operations on different keys run independently. Values are deep-copied on
/// the way in and on the way out.
#[derive(Clone)]
pub struct Database {
    layer: CacheAndBufferLayer,
    queues: Arc<KeyQueues>,
}

impl Database {
    /// Build a database from configuration, selecting the driver by name
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let driver = open_driver(&config.driver, &config.driver_settings)?;
        Ok(Self::with_driver(driver, config.cache))
    }

    /// Wrap an already constructed driver
    pub fn with_driver(driver: Arc<dyn StorageDriver>, overrides: SettingsOverrides) -> Self {
        Self::from_layer(CacheAndBufferLayer::new(driver, overrides))
    }

    pub fn from_layer(layer: CacheAndBufferLayer) -> Self {
        Self {
            layer,
            queues: KeyQueues::new(),
        }
    }

    /// Initialize the driver and start background flushing
    pub async fn init(&self) -> Result<()> {
        self.layer.init().await?;
        info!("Database ready on driver {}", self.layer.driver_name());
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        self.layer.settings()
    }

    /// The underlying cache and buffer layer
    pub fn layer(&self) -> &CacheAndBufferLayer {
        &self.layer
    }

    fn submit<R, F, Fut>(&self, queue_key: QueueKey, operation: F) -> DbFuture<R>
    where
        F: FnOnce(CacheAndBufferLayer) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let mut ticket = self.queues.enqueue(queue_key);
        let layer = self.layer.clone();
        let queued = async move {
            ticket.wait_turn().await;
            let result = operation(layer).await;
            drop(ticket);
            result
        };

        // Without a runtime the operation runs when the future is first polled
        let Ok(handle) = Handle::try_current() else {
            return Box::pin(queued);
        };

        let task = handle.spawn(queued);
        Box::pin(async move {
            task.await.unwrap_or_else(|e| {
                warn!("Queued operation did not complete: {}", e);
                Err(KvError::Driver(format!("queued operation did not complete: {}", e)))
            })
        })
    }

    /// Get a value by key
    pub fn get<T>(&self, key: &str) -> DbFuture<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let key = key.to_string();
        self.submit(QueueKey::Key(key.clone()), move |layer| async move {
            let value = layer.get(&key).await?;
            value.map(|v| materialize(&key, v)).transpose()
        })
    }

    /// Keys matching `pattern` and not matching `anti_pattern`
    pub fn find_keys(&self, pattern: &str, anti_pattern: Option<&str>) -> DbFuture<Vec<String>> {
        let pattern = pattern.to_string();
        let anti_pattern = anti_pattern.map(str::to_string);
        let queue_key = QueueKey::FindKeys {
            pattern: pattern.clone(),
            anti_pattern: anti_pattern.clone(),
        };

        self.submit(queue_key, move |layer| async move {
            layer.find_keys(&pattern, anti_pattern.as_deref()).await
        })
    }

    /// Store a copy of `value` under `key`
    ///
    /// Resolves once the write is accepted; await [`WriteAck::persisted`] for
    /// durability. A value that serializes to `null` removes the key.
    pub fn set<T>(&self, key: &str, value: &T) -> DbFuture<WriteAck>
    where
        T: Serialize + ?Sized,
    {
        let value = match isolate(value) {
            Ok(value) => value,
            Err(e) => return Box::pin(std::future::ready(Err::<WriteAck, _>(e))),
        };

        let key = key.to_string();
        self.submit(QueueKey::Key(key.clone()), move |layer| async move {
            layer.set(&key, Some(value)).await
        })
    }

    /// Remove a key
    pub fn remove(&self, key: &str) -> DbFuture<WriteAck> {
        let key = key.to_string();
        self.submit(QueueKey::Key(key.clone()), move |layer| async move {
            layer.remove(&key).await
        })
    }

    /// Get the value at `path` inside the value stored under `key`
    pub fn get_sub<T>(&self, key: &str, path: &[&str]) -> DbFuture<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let key = key.to_string();
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();

        self.submit(QueueKey::Key(key.clone()), move |layer| async move {
            let path: Vec<&str> = path.iter().map(String::as_str).collect();
            let value = layer.get_sub(&key, &path).await?;
            value.map(|v| materialize(&key, v)).transpose()
        })
    }

    /// Replace the value at `path` inside the value stored under `key`
    ///
    /// Missing intermediate objects are created. Runs as one step of the
    /// key's queue, so concurrent `set_sub` calls on one key never lose updates.
    pub fn set_sub<T>(&self, key: &str, path: &[&str], value: &T) -> DbFuture<WriteAck>
    where
        T: Serialize + ?Sized,
    {
        let value = match isolate(value) {
            Ok(value) => value,
            Err(e) => return Box::pin(std::future::ready(Err::<WriteAck, _>(e))),
        };

        let key = key.to_string();
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();

        self.submit(QueueKey::Key(key.clone()), move |layer| async move {
            let path: Vec<&str> = path.iter().map(String::as_str).collect();
            layer.set_sub(&key, &path, Some(value)).await
        })
    }

    /// Flush buffered writes now instead of waiting for the next tick
    pub async fn flush(&self) -> usize {
        self.layer.flush().await
    }

    /// Wait until every buffered write reached the driver
    pub async fn do_shutdown(&self) {
        self.layer.do_shutdown().await
    }

    /// Drain buffered writes and close the driver
    pub async fn close(&self) -> Result<()> {
        self.layer.close().await
    }

    /// Get statistics
    pub fn stats(&self) -> BufferStats {
        self.layer.stats()
    }

    /// Number of keys with queued or running operations
    pub fn pending_queues(&self) -> usize {
        self.queues.len()
    }
}
