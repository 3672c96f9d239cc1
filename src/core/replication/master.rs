// src/core/replication/master.rs

//! Master-side replication bookkeeping: a registry of connected replica
//! sessions, write propagation, and the blocking `WAIT` primitive.
//!
//! Each replica session is represented only by a stable id and an outbound
//! channel; the connection handler that owns the actual socket is the only
//! thing that touches it directly, which keeps this module free of any I/O.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};

use crate::config::{Config, ReplicationConfig};
use crate::core::protocol::RespFrame;

pub type SessionId = u64;

struct ReplicaSession {
    tx: mpsc::Sender<Bytes>,
    acked_offset: AtomicI64,
    /// Set when a `REPLCONF GETACK *` has been sent but no `ACK` for it has
    /// been recorded yet, so `propagate`/`wait_for_acks` don't pile up
    /// redundant GETACKs behind a replica that is slow to reply.
    getack_pending: AtomicBool,
}

/// Shared replication state, held once per server and handed to every
/// connection task.
pub struct ReplicationState {
    replid: String,
    offset: AtomicU64,
    sessions: DashMap<SessionId, ReplicaSession>,
    next_id: AtomicU64,
    notify: Notify,
}

impl ReplicationState {
    pub fn new(replid: String) -> Self {
        Self {
            replid,
            offset: AtomicU64::new(0),
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            notify: Notify::new(),
        }
    }

    pub fn replid(&self) -> &str {
        &self.replid
    }

    pub fn current_offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Used by a replica's client loop to keep its own reported offset in
    /// sync with the bytes it has actually applied from the master.
    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::SeqCst);
    }

    /// Registers a new replica session right after its `FULLRESYNC` reply
    /// and snapshot transfer have been sent. Returns the session's id (used
    /// to later record its acks) and the receiving half of its outbound
    /// propagation channel.
    pub fn register_session(&self) -> (SessionId, mpsc::Receiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(1024);
        self.sessions.insert(
            id,
            ReplicaSession {
                tx,
                acked_offset: AtomicI64::new(-1),
                getack_pending: AtomicBool::new(false),
            },
        );
        (id, rx)
    }

    pub fn remove_session(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    pub fn connected_replicas(&self) -> usize {
        self.sessions.len()
    }

    /// Sends a command frame to every connected replica and advances the
    /// replication offset by its encoded length. Follows it with a
    /// `REPLCONF GETACK *`, but only to sessions without one already
    /// outstanding, so replica acknowledgement offsets stay fresh without
    /// piling up redundant GETACKs behind a slow replica.
    pub async fn propagate(&self, frame: &RespFrame) {
        self.send_to_all(frame.encode_to_bytes()).await;
        self.send_getack_to_idle_sessions().await;
    }

    async fn send_to_all(&self, bytes: Bytes) {
        self.offset.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        for entry in self.sessions.iter() {
            // A full channel means a slow or dead replica; dropping the
            // frame for it is preferable to blocking every other session.
            let _ = entry.value().tx.try_send(bytes.clone());
        }
    }

    /// Sends `REPLCONF GETACK *` only to sessions that don't already have one
    /// outstanding, marking each as pending before sending.
    async fn send_getack_to_idle_sessions(&self) {
        let getack = RespFrame::array(vec![
            RespFrame::bulk(Bytes::from_static(b"REPLCONF")),
            RespFrame::bulk(Bytes::from_static(b"GETACK")),
            RespFrame::bulk(Bytes::from_static(b"*")),
        ])
        .encode_to_bytes();
        self.offset.fetch_add(getack.len() as u64, Ordering::SeqCst);
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session
                .getack_pending
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let _ = session.tx.try_send(getack.clone());
            }
        }
    }

    /// Records a `REPLCONF ACK <offset>` received from a replica session,
    /// clears its pending-GETACK flag, and wakes anyone blocked in
    /// [`Self::wait_for_acks`].
    pub fn record_ack(&self, id: SessionId, offset: i64) {
        if let Some(session) = self.sessions.get(&id) {
            session.acked_offset.fetch_max(offset, Ordering::SeqCst);
            session.getack_pending.store(false, Ordering::SeqCst);
        }
        self.notify.notify_waiters();
    }

    fn count_acked_at_least(&self, offset: u64) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.value().acked_offset.load(Ordering::SeqCst) >= offset as i64)
            .count()
    }

    /// Blocks until at least `num_replicas` have acknowledged the offset
    /// current at the time of the call, or `timeout_ms` elapses (0 means
    /// block indefinitely). Returns the number of replicas that acked.
    pub async fn wait_for_acks(&self, num_replicas: i64, timeout_ms: i64) -> i64 {
        let target = self.current_offset();
        let num_replicas = num_replicas.max(0) as usize;

        let already = self.count_acked_at_least(target);
        if already >= num_replicas || self.sessions.is_empty() {
            return already as i64;
        }

        self.send_getack_to_idle_sessions().await;

        // Register as a waiter before re-checking the condition: if the ack
        // that satisfies it arrives between the check and the `.await`, the
        // notification would otherwise be missed and this could block
        // forever with `timeout_ms == 0`.
        let wait_loop = async {
            loop {
                let notified = self.notify.notified();
                if self.count_acked_at_least(target) >= num_replicas {
                    return;
                }
                notified.await;
            }
        };

        if timeout_ms <= 0 {
            wait_loop.await;
        } else {
            let _ = tokio::time::timeout(Duration::from_millis(timeout_ms as u64), wait_loop).await;
        }

        self.count_acked_at_least(target) as i64
    }

    /// Renders the `replication` section body returned by `INFO`.
    pub fn info_section(&self, config: &Config) -> Bytes {
        let mut lines = vec![format!("role:{}", config.role_str())];
        match &config.replication {
            ReplicationConfig::Master => {
                lines.push(format!("connected_slaves:{}", self.connected_replicas()));
            }
            ReplicationConfig::Replica { host, port } => {
                lines.push(format!("master_host:{host}"));
                lines.push(format!("master_port:{port}"));
                lines.push("master_link_status:up".to_string());
            }
        }
        lines.push(format!("master_replid:{}", self.replid));
        lines.push(format!("master_repl_offset:{}", self.current_offset()));
        Bytes::from(lines.join("\r\n") + "\r\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_with_no_replicas() {
        let state = ReplicationState::new("a".repeat(40));
        assert_eq!(state.wait_for_acks(1, 50).await, 0);
    }

    #[tokio::test]
    async fn wait_resolves_once_enough_replicas_ack() {
        let state = std::sync::Arc::new(ReplicationState::new("a".repeat(40)));
        let (id, _rx) = state.register_session();
        let target = state.current_offset();

        let background = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            background.record_ack(id, target as i64);
        });

        let acked = state.wait_for_acks(1, 500).await;
        assert_eq!(acked, 1);
    }

    #[tokio::test]
    async fn propagate_does_not_resend_getack_while_one_is_outstanding() {
        let state = ReplicationState::new("c".repeat(40));
        let (_id, mut rx) = state.register_session();

        let set_frame = RespFrame::array(vec![
            RespFrame::bulk(Bytes::from_static(b"SET")),
            RespFrame::bulk(Bytes::from_static(b"k")),
            RespFrame::bulk(Bytes::from_static(b"v")),
        ]);
        state.propagate(&set_frame).await;
        state.propagate(&set_frame).await;

        let mut getack_count = 0;
        while let Ok(bytes) = rx.try_recv() {
            if bytes.windows(6).any(|w| w == b"GETACK") {
                getack_count += 1;
            }
        }
        assert_eq!(getack_count, 1);
    }

    #[test]
    fn info_section_reports_master_role_by_default() {
        let state = ReplicationState::new("b".repeat(40));
        let config = Config {
            dir: ".".into(),
            dbfilename: "dump.rdb".into(),
            port: 6379,
            replication: ReplicationConfig::Master,
            replication_id: "b".repeat(40),
        };
        let info = state.info_section(&config);
        let text = String::from_utf8(info.to_vec()).unwrap();
        assert!(text.contains("role:master"));
        assert!(text.contains("master_replid:"));
    }
}
