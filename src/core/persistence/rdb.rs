// src/core/persistence/rdb.rs

//! The RDB snapshot codec: a Redis-compatible binary format used to persist
//! the keyspace to disk and to transfer it to a replica during full resync.
//!
//! Layout: `REDIS` magic + 4-byte ASCII version, a run of `0xFA` auxiliary
//! records, a `0xFE` database selector, a `0xFB` resizedb hint, zero or more
//! entries (each optionally preceded by an expiry opcode), a `0xFF` sentinel,
//! and an 8-byte little-endian CRC64 trailer.

use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_64_REDIS};
use tracing::warn;

use crate::core::errors::KvError;
use crate::core::storage::StoredValue;

const MAGIC: &[u8] = b"REDIS0011";
const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_EXPIRETIME: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;
const VALUE_TYPE_STRING: u8 = 0x00;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

/// Serializes a keyspace snapshot into the RDB binary format.
pub fn encode(entries: &[(Bytes, StoredValue)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);

    write_aux(&mut buf, b"redis-ver", env!("CARGO_PKG_VERSION").as_bytes());
    write_aux(&mut buf, b"ctime", unix_now_secs().to_string().as_bytes());

    buf.put_u8(OP_SELECTDB);
    write_length(&mut buf, 0);

    let expiring = entries.iter().filter(|(_, v)| v.expires_at_ms.is_some()).count();
    buf.put_u8(OP_RESIZEDB);
    write_length(&mut buf, entries.len());
    write_length(&mut buf, expiring);

    for (key, value) in entries {
        if let Some(expires_at_ms) = value.expires_at_ms {
            buf.put_u8(OP_EXPIRETIME_MS);
            buf.put_u64_le(expires_at_ms);
        }
        buf.put_u8(VALUE_TYPE_STRING);
        write_string(&mut buf, key);
        write_string(&mut buf, &value.value);
    }

    buf.put_u8(OP_EOF);
    let checksum = CRC64.checksum(&buf);
    buf.put_u64_le(checksum);
    buf.freeze()
}

/// Parses an RDB binary blob back into keyspace entries. A CRC mismatch is
/// logged but does not prevent the snapshot from being adopted.
pub fn decode(data: &[u8]) -> Result<Vec<(Bytes, StoredValue)>, KvError> {
    if data.len() < MAGIC.len() + 8 || &data[..5] != b"REDIS" {
        return Err(KvError::RdbMalformed("missing or truncated magic header".into()));
    }

    let trailer_at = data.len() - 8;
    let expected_crc = u64::from_le_bytes(data[trailer_at..].try_into().unwrap());
    let actual_crc = CRC64.checksum(&data[..trailer_at]);
    if expected_crc != actual_crc {
        warn!("rdb checksum mismatch: expected {expected_crc:x}, got {actual_crc:x}");
    }

    let mut cursor = &data[MAGIC.len()..trailer_at];
    let mut entries = Vec::new();
    let mut pending_expiry: Option<u64> = None;

    loop {
        let opcode = read_u8(&mut cursor)?;
        match opcode {
            OP_EOF => break,
            OP_SELECTDB => {
                let index = read_length(&mut cursor)?;
                if index != 0 {
                    return Err(KvError::RdbMalformed(format!(
                        "unsupported database index {index}"
                    )));
                }
            }
            OP_RESIZEDB => {
                read_length(&mut cursor)?;
                read_length(&mut cursor)?;
            }
            OP_AUX => {
                read_string(&mut cursor)?;
                read_string(&mut cursor)?;
            }
            OP_EXPIRETIME_MS => {
                pending_expiry = Some(read_u64_le(&mut cursor)?);
            }
            OP_EXPIRETIME => {
                pending_expiry = Some(read_u32_le(&mut cursor)? as u64 * 1000);
            }
            VALUE_TYPE_STRING => {
                let key = read_string(&mut cursor)?;
                let value = read_string(&mut cursor)?;
                entries.push((
                    Bytes::from(key),
                    StoredValue {
                        value: Bytes::from(value),
                        expires_at_ms: pending_expiry.take(),
                    },
                ));
            }
            other => {
                return Err(KvError::RdbMalformed(format!(
                    "unsupported value type or opcode {other:#x}"
                )));
            }
        }
    }

    Ok(entries)
}

/// Writes a snapshot atomically: to a temp file in the same directory, then
/// renamed over the target so a reader never observes a partial write.
pub async fn save_file(path: &Path, entries: &[(Bytes, StoredValue)]) -> io::Result<()> {
    let bytes = encode(entries);
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, &bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Loads a snapshot from disk. Returns an empty keyspace if the file does not
/// exist yet (first boot).
pub async fn load_file(path: &Path) -> Result<Vec<(Bytes, StoredValue)>, KvError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => decode(&bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs()
}

fn write_aux(buf: &mut BytesMut, key: &[u8], value: &[u8]) {
    buf.put_u8(OP_AUX);
    write_string(buf, key);
    write_string(buf, value);
}

fn write_string(buf: &mut BytesMut, s: &[u8]) {
    write_length(buf, s.len());
    buf.put_slice(s);
}

/// Emits the smallest of the three plain length classes; this codec never
/// writes the special integer-as-string encoding, only reads it.
fn write_length(buf: &mut BytesMut, len: usize) {
    if len < 64 {
        buf.put_u8(len as u8);
    } else if len < 16384 {
        let len = len as u16;
        buf.put_u8(0x40 | ((len >> 8) as u8));
        buf.put_u8((len & 0xFF) as u8);
    } else {
        buf.put_u8(0x80);
        buf.put_u32(len as u32);
    }
}

enum Length {
    Plain(usize),
    IntEncoded(u8),
}

fn read_length_or_special(cursor: &mut &[u8]) -> Result<Length, KvError> {
    let b0 = read_u8(cursor)?;
    match b0 >> 6 {
        0b00 => Ok(Length::Plain((b0 & 0x3F) as usize)),
        0b01 => {
            let b1 = read_u8(cursor)?;
            Ok(Length::Plain((((b0 & 0x3F) as usize) << 8) | b1 as usize))
        }
        0b10 => {
            if cursor.len() < 4 {
                return Err(KvError::RdbMalformed("truncated 32-bit length".into()));
            }
            let raw = u32::from_be_bytes(cursor[..4].try_into().unwrap());
            cursor.advance(4);
            Ok(Length::Plain(raw as usize))
        }
        _ => Ok(Length::IntEncoded(b0 & 0x3F)),
    }
}

fn read_length(cursor: &mut &[u8]) -> Result<usize, KvError> {
    match read_length_or_special(cursor)? {
        Length::Plain(n) => Ok(n),
        Length::IntEncoded(_) => Err(KvError::RdbMalformed(
            "unexpected integer-encoded length".into(),
        )),
    }
}

fn read_string(cursor: &mut &[u8]) -> Result<Vec<u8>, KvError> {
    match read_length_or_special(cursor)? {
        Length::Plain(n) => {
            if cursor.len() < n {
                return Err(KvError::RdbMalformed("truncated string".into()));
            }
            let out = cursor[..n].to_vec();
            cursor.advance(n);
            Ok(out)
        }
        Length::IntEncoded(class) => {
            let nbytes = match class {
                0 => 1,
                1 => 2,
                2 => 4,
                other => {
                    return Err(KvError::RdbMalformed(format!(
                        "unsupported integer-string class {other}"
                    )));
                }
            };
            if cursor.len() < nbytes {
                return Err(KvError::RdbMalformed("truncated integer-string".into()));
            }
            let raw = &cursor[..nbytes];
            let value: i64 = match nbytes {
                1 => raw[0] as i8 as i64,
                2 => i16::from_le_bytes(raw.try_into().unwrap()) as i64,
                4 => i32::from_le_bytes(raw.try_into().unwrap()) as i64,
                _ => unreachable!(),
            };
            cursor.advance(nbytes);
            Ok(value.to_string().into_bytes())
        }
    }
}

fn read_u8(cursor: &mut &[u8]) -> Result<u8, KvError> {
    if cursor.is_empty() {
        return Err(KvError::RdbMalformed("unexpected end of file".into()));
    }
    let b = cursor[0];
    cursor.advance(1);
    Ok(b)
}

fn read_u32_le(cursor: &mut &[u8]) -> Result<u32, KvError> {
    if cursor.len() < 4 {
        return Err(KvError::RdbMalformed("truncated u32".into()));
    }
    let v = u32::from_le_bytes(cursor[..4].try_into().unwrap());
    cursor.advance(4);
    Ok(v)
}

fn read_u64_le(cursor: &mut &[u8]) -> Result<u64, KvError> {
    if cursor.len() < 8 {
        return Err(KvError::RdbMalformed("truncated u64".into()));
    }
    let v = u64::from_le_bytes(cursor[..8].try_into().unwrap());
    cursor.advance(8);
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str, expires_at_ms: Option<u64>) -> (Bytes, StoredValue) {
        (
            Bytes::copy_from_slice(key.as_bytes()),
            StoredValue {
                value: Bytes::copy_from_slice(value.as_bytes()),
                expires_at_ms,
            },
        )
    }

    #[test]
    fn round_trips_an_empty_keyspace() {
        let encoded = encode(&[]);
        let decoded = decode(&encoded).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn round_trips_keys_with_and_without_expiry() {
        let entries = vec![
            entry("a", "1", None),
            entry("b", "2", Some(1_900_000_000_000)),
        ];
        let encoded = encode(&entries);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0, entries[0].0);
        assert_eq!(decoded[0].1.value, entries[0].1.value);
        assert_eq!(decoded[0].1.expires_at_ms, None);
        assert_eq!(decoded[1].1.expires_at_ms, Some(1_900_000_000_000));
    }

    #[test]
    fn round_trips_a_long_value_crossing_the_14_bit_length_boundary() {
        let long_value = "x".repeat(20_000);
        let entries = vec![entry("big", &long_value, None)];
        let encoded = encode(&entries);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded[0].1.value.len(), 20_000);
    }

    #[test]
    fn rejects_bad_magic() {
        let err = decode(b"NOTREDIS\0\0\0\0\0\0\0\0").unwrap_err();
        assert!(matches!(err, KvError::RdbMalformed(_)));
    }

    #[test]
    fn reads_integer_encoded_strings() {
        // Hand-build a minimal file containing a single integer-encoded value.
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u8(OP_SELECTDB);
        write_length(&mut buf, 0);
        buf.put_u8(OP_RESIZEDB);
        write_length(&mut buf, 1);
        write_length(&mut buf, 0);
        buf.put_u8(VALUE_TYPE_STRING);
        write_string(&mut buf, b"k");
        // 0xC0 = top bits 11, low six bits 0 => 8-bit integer-as-string class.
        buf.put_u8(0xC0);
        buf.put_i8(42);
        buf.put_u8(OP_EOF);
        let crc = CRC64.checksum(&buf);
        buf.put_u64_le(crc);

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded[0].1.value, Bytes::from_static(b"42"));
    }
}
