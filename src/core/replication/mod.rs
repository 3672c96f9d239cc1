// src/core/replication/mod.rs

//! Master/replica replication: a session registry and write-propagation on
//! the master side, and a connect-and-stream client on the replica side.

mod master;
mod replica;

pub use master::{ReplicationState, SessionId};
pub use replica::run_replica_client;
