// src/server/mod.rs

//! Server bootstrap: shared state, snapshot loading, the replica client (if
//! configured as one), and the client accept loop.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::{Config, ReplicationConfig};
use crate::connection;
use crate::core::errors::KvError;
use crate::core::persistence;
use crate::core::replication::{self, ReplicationState};
use crate::core::storage::Keyspace;

/// State shared by every connection task.
pub struct ServerState {
    pub config: Config,
    pub keyspace: Keyspace,
    pub replication: ReplicationState,
}

pub async fn run(config: Config) -> Result<()> {
    let snapshot_path = config.snapshot_path();
    let keyspace = Keyspace::new();
    match persistence::load_file(&snapshot_path).await {
        Ok(entries) => {
            info!("loaded {} key(s) from {}", entries.len(), snapshot_path.display());
            keyspace.load(entries).await;
        }
        Err(KvError::RdbMalformed(reason)) => {
            error!(
                "snapshot at {} is corrupt ({reason}), starting with an empty keyspace",
                snapshot_path.display()
            );
        }
        Err(e) => {
            error!("failed to load snapshot from {}: {e}", snapshot_path.display());
            return Err(e.into());
        }
    }

    let replication_state = ReplicationState::new(config.replication_id.clone());
    let replicaof = match &config.replication {
        ReplicationConfig::Replica { host, port } => Some((host.clone(), *port)),
        ReplicationConfig::Master => None,
    };

    let state = Arc::new(ServerState {
        config,
        keyspace,
        replication: replication_state,
    });

    if let Some((host, port)) = replicaof {
        let replica_state = state.clone();
        tokio::spawn(async move {
            replication::run_replica_client(replica_state, host, port).await;
        });
    }

    let listener = TcpListener::bind(("0.0.0.0", state.config.port)).await?;
    info!("listening on port {}", state.config.port);

    loop {
        let (socket, addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            connection::handle_connection(socket, addr, state).await;
        });
    }
}

