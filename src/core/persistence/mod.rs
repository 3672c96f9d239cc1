// src/core/persistence/mod.rs

//! Binary snapshot persistence: the RDB codec and atomic file rewrite.

mod rdb;

pub use rdb::{decode, encode, load_file, save_file};
