//! Per-key serialization
//!
//! [`Database`] is the public entry point. It queues operations by key so
//! each key sees its operations one at a time in call order, and it
//! deep-copies values crossing the API.

mod database;
mod key_queue;

pub use database::{Database, DbFuture};
