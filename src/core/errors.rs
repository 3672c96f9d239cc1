// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
#[derive(Error, Debug, Clone)]
pub enum KvError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("ERR Protocol error: {0}")]
    Malformed(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArgumentCount(String),

    #[error("ERR syntax error")]
    SyntaxError,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR snapshot file is corrupt: {0}")]
    RdbMalformed(String),

    #[error("ERR replication handshake failed: {0}")]
    ReplicationHandshake(String),

    #[error("ERR invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("ERR {0}")]
    Internal(String),
}

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        KvError::Io(Arc::new(e))
    }
}

impl From<ParseIntError> for KvError {
    fn from(_: ParseIntError) -> Self {
        KvError::NotAnInteger
    }
}

impl From<std::str::Utf8Error> for KvError {
    fn from(_: std::str::Utf8Error) -> Self {
        KvError::Malformed("invalid utf-8".into())
    }
}
