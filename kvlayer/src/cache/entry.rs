use crate::core::{KvError, Result};
use serde_json::Value;
use tokio::sync::oneshot;

/// Continuation resolved when the flush carrying a write completes
pub(crate) type Completion = oneshot::Sender<Result<()>>;

/// One cached or buffered key
#[derive(Debug)]
pub(crate) struct BufferEntry {
    /// Current value, `None` when the key is absent or removed
    pub value: Option<Value>,
    /// Holds a write the driver has not seen yet
    pub dirty: bool,
    /// Logical time of the last read or write
    pub last_touched: u64,
    /// Part of a bulk flush that has not completed
    pub write_in_flight: bool,
    /// Writers waiting for the next flush of this entry
    pub pending: Vec<Completion>,
}

impl BufferEntry {
    pub fn new(now: u64) -> Self {
        Self {
            value: None,
            dirty: false,
            last_touched: now,
            write_in_flight: false,
            pending: Vec::new(),
        }
    }

    pub fn clean(value: Option<Value>, now: u64) -> Self {
        Self {
            value,
            ..Self::new(now)
        }
    }

    pub fn touch(&mut self, now: u64) {
        self.last_touched = now;
    }

    /// Neither dirty nor part of an active flush
    pub fn is_evictable(&self) -> bool {
        !self.dirty && !self.write_in_flight
    }
}

/// Observable state of a buffer entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryState {
    pub dirty: bool,
    pub write_in_flight: bool,
    pub pending_writes: usize,
}

impl From<&BufferEntry> for EntryState {
    fn from(entry: &BufferEntry) -> Self {
        Self {
            dirty: entry.dirty,
            write_in_flight: entry.write_in_flight,
            pending_writes: entry.pending.len(),
        }
    }
}

/// Acknowledgement that a write was accepted
///
/// Await [`WriteAck::persisted`] to learn whether the driver stored it. A
/// dropped acknowledgement whose write later fails is reported through the
/// layer's unattended-failure hook instead.
#[derive(Debug)]
#[must_use = "await `persisted()` or the write's failure is only seen by the unattended-failure hook"]
pub struct WriteAck {
    state: AckState,
}

#[derive(Debug)]
enum AckState {
    Persisted,
    Pending(oneshot::Receiver<Result<()>>),
}

impl WriteAck {
    pub(crate) fn persisted_now() -> Self {
        Self {
            state: AckState::Persisted,
        }
    }

    pub(crate) fn pending(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            state: AckState::Pending(rx),
        }
    }

    /// Whether the write already reached the driver when it was accepted
    pub fn is_persisted(&self) -> bool {
        matches!(self.state, AckState::Persisted)
    }

    /// Wait for the flush that materializes this write
    pub async fn persisted(self) -> Result<()> {
        match self.state {
            AckState::Persisted => Ok(()),
            // The buffer was dropped before the write was flushed
            AckState::Pending(rx) => rx.await.unwrap_or(Err(KvError::Closed)),
        }
    }
}
