// src/core/protocol/resp_frame.rs

//! A minimal RESP (REdis Serialization Protocol) frame type and a
//! `tokio_util::codec` pair for framing a byte stream into [`RespFrame`]s.
//!
//! The RDB snapshot transfer that follows a `FULLRESYNC` reply is a
//! bulk-string-shaped payload without the trailing CRLF a normal bulk string
//! carries. That payload is deliberately NOT modeled here: it is written and
//! read directly against the raw stream by the replication handshake code,
//! since it cannot be told apart from a normal bulk string by framing alone.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::errors::KvError;

/// A maximum bound on array/bulk-string lengths, to reject obviously malformed
/// or hostile input before allocating for it.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespFrame {
    Simple(Bytes),
    Error(Bytes),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<RespFrame>>),
}

impl RespFrame {
    pub fn ok() -> Self {
        RespFrame::Simple(Bytes::from_static(b"OK"))
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespFrame::Bulk(Some(data.into()))
    }

    pub fn null_bulk() -> Self {
        RespFrame::Bulk(None)
    }

    pub fn array(items: Vec<RespFrame>) -> Self {
        RespFrame::Array(Some(items))
    }

    pub fn error(msg: impl Into<Bytes>) -> Self {
        RespFrame::Error(msg.into())
    }

    /// Extracts the arguments of a client-issued command frame (an array of
    /// bulk strings), or `None` if the frame isn't shaped like one.
    pub fn as_command_args(&self) -> Option<Vec<Bytes>> {
        let RespFrame::Array(Some(items)) = self else {
            return None;
        };
        items
            .iter()
            .map(|item| match item {
                RespFrame::Bulk(Some(b)) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    /// Encodes this frame into a freshly allocated buffer. Used for replication
    /// propagation, where each frame is cloned out to several sessions.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        encode_frame(self, &mut buf);
        buf.freeze()
    }
}

pub struct RespCodec;

impl Encoder<RespFrame> for RespCodec {
    type Error = KvError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst);
        Ok(())
    }
}

impl Decoder for RespCodec {
    type Item = RespFrame;
    type Error = KvError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_frame(src)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

fn encode_frame(frame: &RespFrame, dst: &mut BytesMut) {
    match frame {
        RespFrame::Simple(s) => {
            dst.put_u8(b'+');
            dst.put_slice(s);
            dst.put_slice(b"\r\n");
        }
        RespFrame::Error(e) => {
            dst.put_u8(b'-');
            dst.put_slice(e);
            dst.put_slice(b"\r\n");
        }
        RespFrame::Integer(i) => {
            dst.put_u8(b':');
            dst.put_slice(i.to_string().as_bytes());
            dst.put_slice(b"\r\n");
        }
        RespFrame::Bulk(None) => dst.put_slice(b"$-1\r\n"),
        RespFrame::Bulk(Some(b)) => {
            dst.put_u8(b'$');
            dst.put_slice(b.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(b);
            dst.put_slice(b"\r\n");
        }
        RespFrame::Array(None) => dst.put_slice(b"*-1\r\n"),
        RespFrame::Array(Some(items)) => {
            dst.put_u8(b'*');
            dst.put_slice(items.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            for item in items {
                encode_frame(item, dst);
            }
        }
    }
}

/// Finds the index of the next `\r\n` in `buf` starting at `from`.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| i + from)
}

/// Parses one line (everything up to, not including, `\r\n`) starting at `pos`.
/// Returns the line bytes and the index immediately after the CRLF.
fn parse_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let crlf = find_crlf(buf, pos)?;
    Some((&buf[pos..crlf], crlf + 2))
}

/// Attempts to parse exactly one frame starting at the beginning of `buf`.
/// Returns `Ok(None)` if more bytes are needed.
fn parse_frame(buf: &[u8]) -> Result<Option<(RespFrame, usize)>, KvError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let sigil = buf[0];
    match sigil {
        b'+' | b'-' | b':' => {
            let Some((line, next)) = parse_line(buf, 1) else {
                return Ok(None);
            };
            let frame = match sigil {
                b'+' => RespFrame::Simple(Bytes::copy_from_slice(line)),
                b'-' => RespFrame::Error(Bytes::copy_from_slice(line)),
                b':' => {
                    let text = std::str::from_utf8(line)
                        .map_err(|_| KvError::Malformed("invalid integer".into()))?;
                    let n: i64 = text
                        .parse()
                        .map_err(|_| KvError::Malformed("invalid integer".into()))?;
                    RespFrame::Integer(n)
                }
                _ => unreachable!(),
            };
            Ok(Some((frame, next)))
        }
        b'$' => {
            let Some((line, mut pos)) = parse_line(buf, 1) else {
                return Ok(None);
            };
            let len: i64 = std::str::from_utf8(line)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| KvError::Malformed("invalid bulk length".into()))?;
            if len == -1 {
                return Ok(Some((RespFrame::Bulk(None), pos)));
            }
            if !(0..=MAX_BULK_LEN).contains(&len) {
                return Err(KvError::Malformed("bulk string too large".into()));
            }
            let len = len as usize;
            if buf.len() < pos + len + 2 {
                return Ok(None);
            }
            let data = Bytes::copy_from_slice(&buf[pos..pos + len]);
            pos += len;
            if &buf[pos..pos + 2] != b"\r\n" {
                return Err(KvError::Malformed("bulk string missing terminator".into()));
            }
            pos += 2;
            Ok(Some((RespFrame::Bulk(Some(data)), pos)))
        }
        b'*' => {
            let Some((line, mut pos)) = parse_line(buf, 1) else {
                return Ok(None);
            };
            let len: i64 = std::str::from_utf8(line)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| KvError::Malformed("invalid array length".into()))?;
            if len == -1 {
                return Ok(Some((RespFrame::Array(None), pos)));
            }
            if !(0..=MAX_ARRAY_LEN).contains(&len) {
                return Err(KvError::Malformed("array too large".into()));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                match parse_frame(&buf[pos..])? {
                    Some((item, consumed)) => {
                        pos += consumed;
                        items.push(item);
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespFrame::Array(Some(items)), pos)))
        }
        other => Err(KvError::Malformed(format!(
            "unknown frame type byte {other:#x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: RespFrame) {
        let encoded = frame.encode_to_bytes();
        let (decoded, consumed) = parse_frame(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrips_all_frame_kinds() {
        roundtrip(RespFrame::Simple(Bytes::from_static(b"OK")));
        roundtrip(RespFrame::Error(Bytes::from_static(b"ERR bad")));
        roundtrip(RespFrame::Integer(-42));
        roundtrip(RespFrame::bulk(Bytes::from_static(b"hello")));
        roundtrip(RespFrame::null_bulk());
        roundtrip(RespFrame::Array(None));
        roundtrip(RespFrame::array(vec![
            RespFrame::bulk(Bytes::from_static(b"SET")),
            RespFrame::bulk(Bytes::from_static(b"k")),
            RespFrame::bulk(Bytes::from_static(b"v")),
        ]));
    }

    #[test]
    fn decoder_waits_for_full_frame() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPI"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"NG\r\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            RespFrame::array(vec![RespFrame::bulk(Bytes::from_static(b"PING"))])
        );
    }

    #[test]
    fn decoder_handles_pipelined_frames() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"+PONG\r\n+PONG\r\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            RespFrame::Simple(Bytes::from_static(b"PONG"))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            RespFrame::Simple(Bytes::from_static(b"PONG"))
        );
    }

    #[test]
    fn extracts_command_args_from_array_of_bulk_strings() {
        let frame = RespFrame::array(vec![
            RespFrame::bulk(Bytes::from_static(b"GET")),
            RespFrame::bulk(Bytes::from_static(b"foo")),
        ]);
        let args = frame.as_command_args().unwrap();
        assert_eq!(args, vec![Bytes::from_static(b"GET"), Bytes::from_static(b"foo")]);
    }
}
