//! Append-only JSON-lines driver
//!
//! Every write appends one `{"key":..,"val":..}` record; `val: null` records a
//! removal. `init` replays the file into an in-memory index that serves reads.

use super::{KeyFilter, Operation, StorageDriver};
use crate::core::{KvError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    key: String,
    val: Option<String>,
}

/// File-backed driver with a write-ahead style log
pub struct DirtyDriver {
    path: PathBuf,
    fsync: bool,
    index: RwLock<HashMap<String, String>>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl DirtyDriver {
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            path: path.into(),
            fsync,
            index: RwLock::new(HashMap::new()),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild the index from the log. Returns whether the log ends mid-record.
    async fn replay(&self) -> Result<bool> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let mut index = HashMap::new();
        let mut records = 0usize;
        let mut skipped = 0usize;

        for (line_no, line) in content.split(|b| *b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<LogRecord>(line) {
                Ok(LogRecord { key, val: Some(val) }) => {
                    index.insert(key, val);
                }
                Ok(LogRecord { key, val: None }) => {
                    index.remove(&key);
                }
                Err(e) => {
                    warn!(
                        "Skipping corrupted record at {:?}:{}: {}",
                        self.path,
                        line_no + 1,
                        e
                    );
                    skipped += 1;
                    continue;
                }
            }
            records += 1;
        }

        info!(
            "Replayed {} records from {:?} ({} keys, {} skipped)",
            records,
            self.path,
            index.len(),
            skipped
        );

        *self.index.write() = index;
        Ok(content.last().is_some_and(|b| *b != b'\n'))
    }

    fn encode(operation: &Operation, out: &mut Vec<u8>) -> Result<()> {
        let record = match operation {
            Operation::Set { key, value } => LogRecord {
                key: key.clone(),
                val: Some(value.clone()),
            },
            Operation::Remove { key } => LogRecord {
                key: key.clone(),
                val: None,
            },
        };
        serde_json::to_writer(&mut *out, &record)
            .map_err(|e| KvError::Driver(format!("failed to encode log record: {}", e)))?;
        out.push(b'\n');
        Ok(())
    }

    /// Append operations as one group commit, then apply them to the index
    async fn append(&self, operations: &[Operation]) -> Result<()> {
        let mut buf = Vec::with_capacity(operations.len() * 64);
        for operation in operations {
            Self::encode(operation, &mut buf)?;
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(KvError::Closed)?;

        writer.write_all(&buf).await?;
        writer.flush().await?;
        if self.fsync {
            writer.get_ref().sync_data().await?;
        }

        let mut index = self.index.write();
        for operation in operations {
            match operation {
                Operation::Set { key, value } => {
                    index.insert(key.clone(), value.clone());
                }
                Operation::Remove { key } => {
                    index.remove(key);
                }
            }
        }

        debug!("Appended {} records to {:?}", operations.len(), self.path);
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for DirtyDriver {
    fn name(&self) -> &'static str {
        "dirty"
    }

    async fn init(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let torn_tail = self.replay().await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut writer = BufWriter::new(file);

        if torn_tail {
            warn!("Log {:?} ends with a partial record, terminating it", self.path);
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        *guard = Some(writer);
        info!("Dirty driver opened at {:?}", self.path);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.index.read().get(key).cloned())
    }

    async fn find_keys(&self, pattern: &str, anti_pattern: Option<&str>) -> Result<Vec<String>> {
        let filter = KeyFilter::new(pattern, anti_pattern);
        let mut keys: Vec<String> = self
            .index
            .read()
            .keys()
            .filter(|k| filter.matches(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.append(&[Operation::Set {
            key: key.to_string(),
            value,
        }])
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.append(&[Operation::Remove {
            key: key.to_string(),
        }])
        .await
    }

    async fn do_bulk(&self, operations: Vec<Operation>) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }
        self.append(&operations).await
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            writer.flush().await?;
            writer.get_ref().sync_all().await?;
            info!("Dirty driver closed at {:?}", self.path);
        }
        Ok(())
    }
}
