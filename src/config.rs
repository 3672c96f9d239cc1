// src/config.rs

//! Server configuration, resolved once at startup from CLI flags.

use clap::Parser;
use rand::Rng;
use rand::distributions::Alphanumeric;

/// A minimal in-memory key/value server with RDB persistence and replication.
#[derive(Parser, Debug, Clone)]
#[command(name = "kevlar", version, about)]
pub struct Cli {
    /// Directory the RDB snapshot is read from and written to.
    #[arg(long, default_value = ".")]
    pub dir: String,

    /// File name of the RDB snapshot within `--dir`.
    #[arg(long, default_value = "dump.rdb")]
    pub dbfilename: String,

    /// TCP port to listen on.
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// "<host> <port>" of the master to replicate from. Presence makes this a replica.
    #[arg(long)]
    pub replicaof: Option<String>,
}

/// The server's role in replication.
#[derive(Debug, Clone)]
pub enum ReplicationConfig {
    Master,
    Replica { host: String, port: u16 },
}

/// Fully resolved, validated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub dir: String,
    pub dbfilename: String,
    pub port: u16,
    pub replication: ReplicationConfig,
    /// 40-character pseudo-random replication id, generated once at startup.
    pub replication_id: String,
}

impl Config {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        if cli.port == 0 {
            anyhow::bail!("port cannot be 0");
        }
        if cli.dir.trim().is_empty() {
            anyhow::bail!("dir cannot be empty");
        }

        let replication = match &cli.replicaof {
            None => ReplicationConfig::Master,
            Some(spec) => {
                let mut parts = spec.split_whitespace();
                let host = parts
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("invalid --replicaof: expected '<host> <port>'"))?
                    .to_string();
                let port: u16 = parts
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("invalid --replicaof: missing port"))?
                    .parse()?;
                ReplicationConfig::Replica { host, port }
            }
        };

        Ok(Self {
            dir: cli.dir,
            dbfilename: cli.dbfilename,
            port: cli.port,
            replication,
            replication_id: generate_replication_id(),
        })
    }

    pub fn snapshot_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.dir).join(&self.dbfilename)
    }

    pub fn role_str(&self) -> &'static str {
        match self.replication {
            ReplicationConfig::Master => "master",
            ReplicationConfig::Replica { .. } => "slave",
        }
    }

    /// Looks up a `CONFIG GET` parameter by name, case-insensitively.
    /// Only the parameters this server actually takes as CLI flags are
    /// queryable; anything else reads as absent.
    pub fn get_param(&self, name: &[u8]) -> Option<bytes::Bytes> {
        if name.eq_ignore_ascii_case(b"dir") {
            Some(bytes::Bytes::copy_from_slice(self.dir.as_bytes()))
        } else if name.eq_ignore_ascii_case(b"dbfilename") {
            Some(bytes::Bytes::copy_from_slice(self.dbfilename.as_bytes()))
        } else {
            None
        }
    }
}

fn generate_replication_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_master_without_replicaof() {
        let cli = Cli {
            dir: ".".into(),
            dbfilename: "dump.rdb".into(),
            port: 6379,
            replicaof: None,
        };
        let config = Config::from_cli(cli).unwrap();
        assert!(matches!(config.replication, ReplicationConfig::Master));
        assert_eq!(config.replication_id.len(), 40);
    }

    #[test]
    fn parses_replicaof_into_host_and_port() {
        let cli = Cli {
            dir: ".".into(),
            dbfilename: "dump.rdb".into(),
            port: 6380,
            replicaof: Some("localhost 6379".into()),
        };
        let config = Config::from_cli(cli).unwrap();
        match config.replication {
            ReplicationConfig::Replica { host, port } => {
                assert_eq!(host, "localhost");
                assert_eq!(port, 6379);
            }
            _ => panic!("expected replica role"),
        }
    }

    #[test]
    fn rejects_port_zero() {
        let cli = Cli {
            dir: ".".into(),
            dbfilename: "dump.rdb".into(),
            port: 0,
            replicaof: None,
        };
        assert!(Config::from_cli(cli).is_err());
    }
}
