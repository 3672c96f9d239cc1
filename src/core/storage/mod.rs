// src/core/storage/mod.rs

//! The in-memory keyspace: a single mutex-guarded map from key to value.

mod keyspace;

pub use keyspace::{now_ms, Keyspace, StoredValue};
