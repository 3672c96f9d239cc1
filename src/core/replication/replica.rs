// src/core/replication/replica.rs

//! The replica-side replication client: performs the handshake against a
//! master, ingests the snapshot it sends back, then applies the streamed
//! command log as it arrives.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use crate::core::errors::KvError;
use crate::core::persistence;
use crate::core::protocol::{RespCodec, RespFrame};
use crate::core::storage::Keyspace;
use crate::server::ServerState;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Connects to the configured master and stays connected for the lifetime of
/// the process, reconnecting with exponential backoff on any failure.
pub async fn run_replica_client(state: Arc<ServerState>, master_host: String, master_port: u16) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match sync_with_master(&state, &master_host, master_port).await {
            Ok(()) => {
                warn!("replication link to master closed, reconnecting");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                warn!("replication link to master failed: {e}");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn sync_with_master(state: &ServerState, host: &str, port: u16) -> Result<(), KvError> {
    let keyspace = &state.keyspace;
    let replication = &state.replication;
    let config = &state.config;
    info!("connecting to master at {host}:{port}");
    let stream = TcpStream::connect((host, port)).await?;
    let mut framed = Framed::new(stream, RespCodec);

    send_command(&mut framed, &[b"PING"]).await?;
    expect_reply(&mut framed).await?;

    send_command(
        &mut framed,
        &[b"REPLCONF", b"listening-port", config.port.to_string().as_bytes()],
    )
    .await?;
    expect_reply(&mut framed).await?;

    send_command(&mut framed, &[b"REPLCONF", b"capa", b"eof", b"capa", b"psync2"]).await?;
    expect_reply(&mut framed).await?;

    send_command(&mut framed, &[b"PSYNC", b"?", b"-1"]).await?;
    let fullresync = expect_reply(&mut framed).await?;
    info!("received {fullresync:?} from master, loading snapshot");

    let mut parts = framed.into_parts();
    let rdb_bytes = read_rdb_blob(&mut parts.io, &mut parts.read_buf).await?;
    let entries = persistence::decode(&rdb_bytes)?;
    keyspace.load(entries).await;

    let mut framed = Framed::from_parts(parts);
    let mut bytes_processed: u64 = 0;

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let frame_len = frame.encode_to_bytes().len() as u64;

        if let Some(args) = frame.as_command_args() {
            if args.first().is_some_and(|v| v.eq_ignore_ascii_case(b"REPLCONF"))
                && args.get(1).is_some_and(|v| v.eq_ignore_ascii_case(b"GETACK"))
            {
                let ack = RespFrame::array(vec![
                    RespFrame::bulk(Bytes::from_static(b"REPLCONF")),
                    RespFrame::bulk(Bytes::from_static(b"ACK")),
                    RespFrame::bulk(Bytes::from(bytes_processed.to_string())),
                ]);
                framed.send_direct(ack).await?;
            } else if args.first().is_some_and(|v| v.eq_ignore_ascii_case(b"SET")) {
                apply_propagated_set(keyspace, &args).await;
            }
        }

        bytes_processed += frame_len;
        replication.set_offset(bytes_processed);
    }

    Ok(())
}

async fn apply_propagated_set(keyspace: &Keyspace, args: &[Bytes]) {
    if args.len() < 3 {
        return;
    }
    let key = args[1].clone();
    let value = args[2].clone();
    let mut expires_at_ms = None;
    let mut i = 3;
    while i < args.len() {
        if args[i].eq_ignore_ascii_case(b"PX") {
            if let Some(delta) = args.get(i + 1).and_then(|b| std::str::from_utf8(b).ok()).and_then(|s| s.parse::<i64>().ok()) {
                expires_at_ms = Some((crate::core::storage::now_ms() as i64 + delta).max(0) as u64);
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    keyspace.set(key, value, expires_at_ms).await;
}

async fn send_command(framed: &mut Framed<TcpStream, RespCodec>, parts: &[&[u8]]) -> Result<(), KvError> {
    let args = parts
        .iter()
        .map(|p| RespFrame::bulk(Bytes::copy_from_slice(p)))
        .collect();
    framed.send_direct(RespFrame::array(args)).await
}

async fn expect_reply(framed: &mut Framed<TcpStream, RespCodec>) -> Result<RespFrame, KvError> {
    match framed.next().await {
        Some(frame) => frame,
        None => Err(KvError::ReplicationHandshake("connection closed during handshake".into())),
    }
}

/// Reads the raw RDB payload a master sends right after its `+FULLRESYNC`
/// reply: a bulk-string-shaped `$<len>\r\n<bytes>` with no trailing CRLF.
async fn read_rdb_blob<S: tokio::io::AsyncRead + Unpin>(
    io: &mut S,
    buf: &mut BytesMut,
) -> Result<Bytes, KvError> {
    loop {
        if find_crlf(buf).is_some() {
            break;
        }
        read_more(io, buf).await?;
    }
    let crlf_at = find_crlf(buf).unwrap();
    let header = buf.split_to(crlf_at);
    buf.advance(2);

    if header.first() != Some(&b'$') {
        return Err(KvError::ReplicationHandshake(
            "expected bulk-string header before snapshot payload".into(),
        ));
    }
    let len: usize = std::str::from_utf8(&header[1..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| KvError::ReplicationHandshake("invalid snapshot length".into()))?;

    while buf.len() < len {
        read_more(io, buf).await?;
    }
    Ok(buf.split_to(len).freeze())
}

async fn read_more<S: tokio::io::AsyncRead + Unpin>(io: &mut S, buf: &mut BytesMut) -> Result<(), KvError> {
    let n = io.read_buf(buf).await?;
    if n == 0 {
        return Err(KvError::ReplicationHandshake("master closed connection unexpectedly".into()));
    }
    Ok(())
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// A convenience `Sink`-free send helper: frees call sites from importing
/// `futures::SinkExt` just for a single `send`.
trait SendDirect {
    async fn send_direct(&mut self, frame: RespFrame) -> Result<(), KvError>;
}

impl SendDirect for Framed<TcpStream, RespCodec> {
    async fn send_direct(&mut self, frame: RespFrame) -> Result<(), KvError> {
        use tokio::io::AsyncWriteExt;
        let bytes = frame.encode_to_bytes();
        self.get_mut().write_all(&bytes).await?;
        Ok(())
    }
}
