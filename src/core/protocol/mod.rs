// src/core/protocol/mod.rs

//! The RESP wire protocol: frame types and the streaming codec.

mod resp_frame;

pub use resp_frame::{RespCodec, RespFrame};
