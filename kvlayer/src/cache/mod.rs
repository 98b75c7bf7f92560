//! Cache and buffer layer
//!
//! Sits between the per-key serialization layer and a storage driver:
//! - Read cache with LRU eviction in half-capacity batches
//! - Write buffer flushed to the driver in bulk on a timer
//! - Drain-on-shutdown

mod entry;
mod eviction;
mod layer;

pub use entry::{EntryState, WriteAck};
pub use layer::{CacheAndBufferLayer, UnattendedHook};
