// src/connection/handler.rs

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, FramedRead};
use tracing::{debug, info, warn};

use crate::core::commands::{self, Command};
use crate::core::errors::KvError;
use crate::core::persistence;
use crate::core::protocol::{RespCodec, RespFrame};
use crate::server::ServerState;

/// Drives a single client connection until it disconnects, or until it
/// issues `PSYNC` and is promoted to a replica session.
pub async fn handle_connection(socket: TcpStream, addr: std::net::SocketAddr, state: Arc<ServerState>) {
    let mut framed = Framed::new(socket, RespCodec);

    loop {
        let frame = match framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("connection {addr} protocol error: {e}");
                return;
            }
            None => {
                debug!("connection {addr} closed");
                return;
            }
        };

        let Some(args) = frame.as_command_args() else {
            let _ = framed
                .get_mut()
                .write_all(&RespFrame::error("ERR invalid request").encode_to_bytes())
                .await;
            continue;
        };

        let command = match Command::parse(args) {
            Ok(cmd) => cmd,
            Err(e) => {
                let _ = write_frame(&mut framed, RespFrame::error(e.to_string())).await;
                continue;
            }
        };

        if let Command::Psync { .. } = command {
            info!("connection {addr} promoted to replica session");
            if let Err(e) = promote_to_replica(framed, state).await {
                warn!("replica handoff for {addr} failed: {e}");
            }
            return;
        }

        let is_write = command.is_write();
        match commands::execute(&command, &state).await {
            Ok(reply) => {
                if write_frame(&mut framed, reply).await.is_err() {
                    return;
                }
                if is_write {
                    state.replication.propagate(&frame).await;
                }
            }
            Err(e) => {
                if write_frame(&mut framed, RespFrame::error(e.to_string())).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_frame(framed: &mut Framed<TcpStream, RespCodec>, frame: RespFrame) -> Result<(), KvError> {
    framed.get_mut().write_all(&frame.encode_to_bytes()).await?;
    Ok(())
}

/// Sends the `FULLRESYNC` reply and a snapshot of the current keyspace, then
/// hands the connection's write half to the replication broadcaster and
/// keeps reading `REPLCONF ACK` frames on the read half until it closes.
async fn promote_to_replica(framed: Framed<TcpStream, RespCodec>, state: Arc<ServerState>) -> Result<(), KvError> {
    let mut parts = framed.into_parts();

    let fullresync = format!(
        "FULLRESYNC {} {}\r\n",
        state.replication.replid(),
        state.replication.current_offset()
    );
    parts.io.write_all(format!("+{fullresync}").as_bytes()).await?;

    // Registered before the snapshot is taken: a write that lands between
    // registration and the snapshot read is captured in both, but SET is
    // idempotent so the replica just applies it twice. Registering after the
    // snapshot instead would risk a write landing in neither.
    let (session_id, mut rx) = state.replication.register_session();

    let snapshot = state.keyspace.snapshot().await;
    let rdb_bytes = persistence::encode(&snapshot);
    parts.io.write_all(format!("${}\r\n", rdb_bytes.len()).as_bytes()).await?;
    parts.io.write_all(&rdb_bytes).await?;

    if !parts.read_buf.is_empty() {
        warn!("dropping {} bytes pipelined immediately after PSYNC", parts.read_buf.len());
    }

    let (read_half, mut write_half) = parts.io.into_split();

    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut reader = FramedRead::new(read_half, RespCodec);
    while let Some(frame) = reader.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("replica session {session_id} read error: {e}");
                break;
            }
        };
        if let Some(args) = frame.as_command_args() {
            if args.first().is_some_and(|v| v.eq_ignore_ascii_case(b"REPLCONF"))
                && args.get(1).is_some_and(|v| v.eq_ignore_ascii_case(b"ACK"))
            {
                if let Some(offset) = args
                    .get(2)
                    .and_then(|b| std::str::from_utf8(b).ok())
                    .and_then(|s| s.parse::<i64>().ok())
                {
                    state.replication.record_ack(session_id, offset);
                }
            }
        }
    }

    state.replication.remove_session(session_id);
    Ok(())
}
