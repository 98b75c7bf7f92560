//! Per-key FIFO queues
//!
//! Each queue is a chain of tickets: a ticket waits for the release of the
//! ticket enqueued before it on the same key and releases its successor when
//! dropped. Tickets are issued synchronously, so queue order is call order.
//! A key's entry is removed as soon as its newest ticket is released.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

/// Queue identity of an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum QueueKey {
    Key(String),
    FindKeys {
        pattern: String,
        anti_pattern: Option<String>,
    },
}

struct Tail {
    id: u64,
    released: oneshot::Receiver<()>,
}

/// Registry of live per-key queues
#[derive(Default)]
pub(crate) struct KeyQueues {
    tails: Mutex<HashMap<QueueKey, Tail>>,
    next_id: AtomicU64,
}

impl KeyQueues {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append an operation to the queue of `key`
    pub fn enqueue(self: &Arc<Self>, key: QueueKey) -> Ticket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (release, released) = oneshot::channel();

        let previous = self
            .tails
            .lock()
            .insert(key.clone(), Tail { id, released })
            .map(|tail| tail.released);

        Ticket {
            queues: Arc::clone(self),
            key,
            id,
            previous,
            release: Some(release),
        }
    }

    /// Number of keys with queued or running operations
    pub fn len(&self) -> usize {
        self.tails.lock().len()
    }
}

/// Place of one operation in its key's queue
pub(crate) struct Ticket {
    queues: Arc<KeyQueues>,
    key: QueueKey,
    id: u64,
    previous: Option<oneshot::Receiver<()>>,
    release: Option<oneshot::Sender<()>>,
}

impl Ticket {
    /// Wait until every operation queued before this one on the same key has finished
    pub async fn wait_turn(&mut self) {
        if let Some(previous) = self.previous.as_mut() {
            debug!(key = ?self.key, "Waiting for queued operation");
            // An error means the predecessor was dropped, which also releases us
            let _ = previous.await;
            self.previous = None;
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            match (self.previous.take(), tokio::runtime::Handle::try_current()) {
                // Cancelled before its turn: the successor still has to wait for our predecessor
                (Some(previous), Ok(handle)) => {
                    handle.spawn(async move {
                        let _ = previous.await;
                        let _ = release.send(());
                    });
                }
                _ => {
                    let _ = release.send(());
                }
            }
        }

        let mut tails = self.queues.tails.lock();
        if tails.get(&self.key).is_some_and(|tail| tail.id == self.id) {
            tails.remove(&self.key);
        }
    }
}
