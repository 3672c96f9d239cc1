// src/core/commands/mod.rs

//! The command set this server understands: parsing a RESP argument array
//! into a [`Command`], and executing it against shared server state.

use bytes::Bytes;

use crate::core::errors::KvError;
use crate::core::persistence;
use crate::core::protocol::RespFrame;
use crate::core::storage::now_ms;
use crate::server::ServerState;

/// A single parsed client command, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Set {
        key: Bytes,
        value: Bytes,
        px: Option<i64>,
    },
    Get(Bytes),
    Keys(Bytes),
    ConfigGet(Bytes),
    Info,
    Replconf(Vec<Bytes>),
    Psync { replid: Bytes, offset: Bytes },
    Wait { num_replicas: i64, timeout_ms: i64 },
}

impl Command {
    /// Parses the argument vector of a client-issued RESP array into a
    /// [`Command`]. `args[0]` is the command verb, matched case-sensitively
    /// against its upper-case form; a verb sent in any other case is an
    /// unknown command, not a case-insensitive alias.
    pub fn parse(args: Vec<Bytes>) -> Result<Self, KvError> {
        let verb = args
            .first()
            .ok_or_else(|| KvError::Malformed("empty command".into()))?;
        let verb = std::str::from_utf8(verb).unwrap_or("");
        let rest = &args[1..];

        match verb {
            "PING" => match rest.len() {
                0 => Ok(Command::Ping(None)),
                1 => Ok(Command::Ping(Some(rest[0].clone()))),
                _ => Err(KvError::WrongArgumentCount("ping".into())),
            },
            "ECHO" => match rest {
                [msg] => Ok(Command::Echo(msg.clone())),
                _ => Err(KvError::WrongArgumentCount("echo".into())),
            },
            "SET" => parse_set(rest),
            "GET" => match rest {
                [key] => Ok(Command::Get(key.clone())),
                _ => Err(KvError::WrongArgumentCount("get".into())),
            },
            "KEYS" => match rest {
                [pattern] => Ok(Command::Keys(pattern.clone())),
                _ => Err(KvError::WrongArgumentCount("keys".into())),
            },
            "CONFIG" => match rest {
                [sub, param] if sub.as_ref() == b"GET" => Ok(Command::ConfigGet(param.clone())),
                _ => Err(KvError::SyntaxError),
            },
            "INFO" => Ok(Command::Info),
            "REPLCONF" => Ok(Command::Replconf(rest.to_vec())),
            "PSYNC" => match rest {
                [replid, offset] => Ok(Command::Psync {
                    replid: replid.clone(),
                    offset: offset.clone(),
                }),
                _ => Err(KvError::WrongArgumentCount("psync".into())),
            },
            "WAIT" => parse_wait(rest),
            other => Err(KvError::UnknownCommand(other.to_lowercase())),
        }
    }

    /// Whether a successful run of this command must be propagated to
    /// connected replicas.
    pub fn is_write(&self) -> bool {
        matches!(self, Command::Set { .. })
    }
}

fn parse_set(rest: &[Bytes]) -> Result<Command, KvError> {
    if rest.len() < 2 {
        return Err(KvError::WrongArgumentCount("set".into()));
    }
    let key = rest[0].clone();
    let value = rest[1].clone();
    let mut px = None;
    let mut i = 2;
    while i < rest.len() {
        if rest[i].eq_ignore_ascii_case(b"PX") {
            let millis_str = rest
                .get(i + 1)
                .ok_or(KvError::SyntaxError)?;
            let millis: i64 = std::str::from_utf8(millis_str)
                .map_err(|_| KvError::NotAnInteger)?
                .parse()
                .map_err(|_| KvError::NotAnInteger)?;
            px = Some(millis);
            i += 2;
        } else {
            return Err(KvError::SyntaxError);
        }
    }
    Ok(Command::Set { key, value, px })
}

fn parse_wait(rest: &[Bytes]) -> Result<Command, KvError> {
    let [num_replicas, timeout_ms] = rest else {
        return Err(KvError::WrongArgumentCount("wait".into()));
    };
    let num_replicas: i64 = std::str::from_utf8(num_replicas)
        .map_err(|_| KvError::NotAnInteger)?
        .parse()
        .map_err(|_| KvError::NotAnInteger)?;
    let timeout_ms: i64 = std::str::from_utf8(timeout_ms)
        .map_err(|_| KvError::NotAnInteger)?
        .parse()
        .map_err(|_| KvError::NotAnInteger)?;
    Ok(Command::Wait {
        num_replicas,
        timeout_ms,
    })
}

/// Executes a parsed command against shared state, returning the reply frame
/// to send back to the client that issued it.
///
/// `Psync` is handled specially by the connection handler (it hands the
/// connection off to a replica session) and never reaches here.
pub async fn execute(cmd: &Command, state: &ServerState) -> Result<RespFrame, KvError> {
    match cmd {
        Command::Ping(None) => Ok(RespFrame::Simple(Bytes::from_static(b"PONG"))),
        Command::Ping(Some(msg)) => Ok(RespFrame::bulk(msg.clone())),
        Command::Echo(msg) => Ok(RespFrame::bulk(msg.clone())),
        Command::Set { key, value, px } => {
            let expires_at_ms = px.map(|delta| (now_ms() as i64 + delta).max(0) as u64);
            state
                .keyspace
                .set(key.clone(), value.clone(), expires_at_ms)
                .await;
            let snapshot = state.keyspace.snapshot().await;
            persistence::save_file(&state.config.snapshot_path(), &snapshot).await?;
            Ok(RespFrame::ok())
        }
        Command::Get(key) => match state.keyspace.get(key).await {
            Some(value) => Ok(RespFrame::bulk(value)),
            None => Ok(RespFrame::null_bulk()),
        },
        Command::Keys(pattern) => {
            let keys = state.keyspace.keys().await;
            let matched = keys
                .into_iter()
                .filter(|k| key_matches_pattern(k, pattern))
                .map(RespFrame::bulk)
                .collect();
            Ok(RespFrame::array(matched))
        }
        Command::ConfigGet(param) => {
            let value = state.config.get_param(param);
            match value {
                Some(value) => Ok(RespFrame::array(vec![
                    RespFrame::bulk(param.clone()),
                    RespFrame::bulk(value),
                ])),
                None => Ok(RespFrame::null_bulk()),
            }
        }
        Command::Info => Ok(RespFrame::bulk(state.replication.info_section(&state.config))),
        Command::Replconf(args) => handle_replconf(args),
        Command::Psync { .. } => {
            unreachable!("PSYNC is handed off by the connection handler before reaching execute")
        }
        Command::Wait {
            num_replicas,
            timeout_ms,
        } => {
            let acked = state
                .replication
                .wait_for_acks(*num_replicas, *timeout_ms)
                .await;
            Ok(RespFrame::Integer(acked))
        }
    }
}

fn handle_replconf(_args: &[Bytes]) -> Result<RespFrame, KvError> {
    // Every subcommand (listening-port, capa, GETACK) gets a plain OK here;
    // GETACK is otherwise handled on the replica side by the replication
    // client loop, not by this dispatcher.
    Ok(RespFrame::ok())
}

/// Glob-style match supporting only `*` (spec scope: full wildcard only).
fn key_matches_pattern(key: &Bytes, pattern: &Bytes) -> bool {
    pattern.as_ref() == b"*" || key == pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn parses_ping_with_and_without_message() {
        assert_eq!(Command::parse(vec![b("PING")]).unwrap(), Command::Ping(None));
        assert_eq!(
            Command::parse(vec![b("PING"), b("hello")]).unwrap(),
            Command::Ping(Some(b("hello")))
        );
    }

    #[test]
    fn rejects_lowercase_verb_as_unknown_command() {
        let err = Command::parse(vec![b("ping")]).unwrap_err();
        assert!(matches!(err, KvError::UnknownCommand(_)));
    }

    #[test]
    fn parses_set_with_px_option() {
        let cmd = Command::parse(vec![b("SET"), b("k"), b("v"), b("PX"), b("100")]).unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                key: b("k"),
                value: b("v"),
                px: Some(100),
            }
        );
    }

    #[test]
    fn rejects_unknown_command() {
        let err = Command::parse(vec![b("FROBNICATE")]).unwrap_err();
        assert!(matches!(err, KvError::UnknownCommand(_)));
    }

    #[test]
    fn rejects_set_with_bad_arity() {
        let err = Command::parse(vec![b("SET"), b("k")]).unwrap_err();
        assert!(matches!(err, KvError::WrongArgumentCount(_)));
    }

    #[test]
    fn key_matches_pattern_only_supports_full_wildcard() {
        assert!(key_matches_pattern(&b("anything"), &b("*")));
        assert!(key_matches_pattern(&b("foo"), &b("foo")));
        assert!(!key_matches_pattern(&b("foo"), &b("bar")));
    }
}
