//! The client-facing ASCII protocol front-end: one CRLF-terminated command
//! line, an arity check per verb, and -- for storage verbs -- the inline
//! data block that follows the header line.
//!
//! Grounded on `dispatch.c`'s `ds_datablock_size`/`ds_datablock_recv` header
//! parsing, reworked onto `wire::Framed`'s shared-buffer reads instead of
//! `recv_line`/`recv_str` with manual delimiter splicing.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::registry::CmdGroup;
use crate::wire::{Framed, WireError};

pub const MAX_KEY_LEN: usize = 250;
pub const MAX_DATA_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("unknown command {0:?}")]
    UnknownVerb(String),
    #[error("wrong number of arguments for {verb}")]
    BadArity { verb: String },
    #[error("key exceeds {MAX_KEY_LEN} bytes")]
    KeyTooLong,
    #[error("data block exceeds {MAX_DATA_LEN} bytes")]
    DataTooLarge,
    #[error("malformed numeric argument {0:?}")]
    BadNumber(String),
    #[error("inline data block missing trailing CRLF")]
    MissingDataTerminator,
}

/// One fully-read client command, ready for the dispatch engine (or, for the
/// handful of verbs the front-end answers itself, ready to be answered
/// inline without ever reaching dispatch).
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Storage {
        verb: String,
        key: Vec<u8>,
        flags: u32,
        exptime: i64,
        cas_unique: Option<u64>,
        noreply: bool,
        data: Vec<u8>,
        line: Vec<u8>,
    },
    Retrieval {
        verb: String,
        keys: Vec<Vec<u8>>,
        line: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
        noreply: bool,
        line: Vec<u8>,
    },
    Counter {
        verb: String,
        key: Vec<u8>,
        noreply: bool,
        line: Vec<u8>,
    },
    Introspection {
        verb: String,
        args: Vec<String>,
    },
    Admin {
        verb: String,
        args: Vec<String>,
    },
}

impl ClientCommand {
    /// The routing group dispatch uses for owner resolution and counters.
    /// `None` for verbs the front-end answers itself.
    pub fn group(&self) -> Option<CmdGroup> {
        match self {
            ClientCommand::Storage { .. } | ClientCommand::Counter { .. } => Some(CmdGroup::Set),
            ClientCommand::Retrieval { .. } => Some(CmdGroup::Get),
            ClientCommand::Delete { .. } => Some(CmdGroup::Delete),
            ClientCommand::Introspection { .. } | ClientCommand::Admin { .. } => None,
        }
    }

    pub fn is_noreply(&self) -> bool {
        match self {
            ClientCommand::Storage { noreply, .. }
            | ClientCommand::Delete { noreply, .. }
            | ClientCommand::Counter { noreply, .. } => *noreply,
            _ => false,
        }
    }
}

fn is_noreply_token(tokens: &[&str]) -> bool {
    tokens.last().map(|t| t.eq_ignore_ascii_case("noreply")).unwrap_or(false)
}

fn check_key_len(key: &[u8]) -> Result<(), ProtocolError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        Err(ProtocolError::KeyTooLong)
    } else {
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(tok: &str) -> Result<T, ProtocolError> {
    tok.parse().map_err(|_| ProtocolError::BadNumber(tok.to_string()))
}

/// Reads and parses exactly one client command, including the inline data
/// block for storage verbs. Returns `Ok(None)` when the connection is
/// cleanly closed before a new command line arrives.
pub async fn read_command<S>(framed: &mut Framed<S>) -> Result<Option<ClientCommand>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = match framed.read_line().await {
        Ok(line) => line,
        Err(WireError::Closed) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let text = String::from_utf8_lossy(&line).into_owned();
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let Some(&verb) = tokens.first() else {
        return Err(ProtocolError::BadArity { verb: String::new() });
    };
    let verb_lower = verb.to_ascii_lowercase();

    match verb_lower.as_str() {
        "set" | "add" | "replace" | "append" | "prepend" => {
            if tokens.len() != 5 && tokens.len() != 6 {
                return Err(ProtocolError::BadArity { verb: verb_lower });
            }
            parse_storage(framed, &verb_lower, &tokens, &line, None).await
        }
        "cas" => {
            if tokens.len() != 6 && tokens.len() != 7 {
                return Err(ProtocolError::BadArity { verb: verb_lower });
            }
            let cas_unique: u64 = parse_num(tokens[5])?;
            parse_storage(framed, &verb_lower, &tokens, &line, Some(cas_unique)).await
        }
        "get" | "gets" => {
            if tokens.len() < 2 {
                return Err(ProtocolError::BadArity { verb: verb_lower });
            }
            let keys: Result<Vec<Vec<u8>>, ProtocolError> = tokens[1..]
                .iter()
                .map(|k| {
                    let key = k.as_bytes().to_vec();
                    check_key_len(&key)?;
                    Ok(key)
                })
                .collect();
            Ok(Some(ClientCommand::Retrieval { verb: verb_lower, keys: keys?, line }))
        }
        "delete" => {
            if tokens.len() < 2 || tokens.len() > 4 {
                return Err(ProtocolError::BadArity { verb: verb_lower });
            }
            let key = tokens[1].as_bytes().to_vec();
            check_key_len(&key)?;
            let noreply = is_noreply_token(&tokens);
            Ok(Some(ClientCommand::Delete { key, noreply, line }))
        }
        "incr" | "decr" => {
            if tokens.len() != 3 && tokens.len() != 4 {
                return Err(ProtocolError::BadArity { verb: verb_lower });
            }
            let key = tokens[1].as_bytes().to_vec();
            check_key_len(&key)?;
            let noreply = is_noreply_token(&tokens);
            Ok(Some(ClientCommand::Counter { verb: verb_lower, key, noreply, line }))
        }
        "stats" | "version" | "verbosity" | "quit" => Ok(Some(ClientCommand::Introspection {
            verb: verb_lower,
            args: tokens[1..].iter().map(|s| s.to_string()).collect(),
        })),
        v if v.starts_with("__/") && v.ends_with("/__") => Ok(Some(ClientCommand::Admin {
            verb: verb_lower,
            args: tokens[1..].iter().map(|s| s.to_string()).collect(),
        })),
        _ => Err(ProtocolError::UnknownVerb(verb.to_string())),
    }
}

async fn parse_storage<S>(
    framed: &mut Framed<S>,
    verb: &str,
    tokens: &[&str],
    line: &[u8],
    cas_unique: Option<u64>,
) -> Result<Option<ClientCommand>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = tokens[1].as_bytes().to_vec();
    check_key_len(&key)?;
    let flags: u32 = parse_num(tokens[2])?;
    let exptime: i64 = parse_num(tokens[3])?;
    let bytes: usize = parse_num(tokens[4])?;
    if bytes > MAX_DATA_LEN {
        return Err(ProtocolError::DataTooLarge);
    }
    let noreply = is_noreply_token(tokens);

    let raw = framed.read_exact_n(bytes + 2).await?;
    if &raw[bytes..] != b"\r\n" {
        return Err(ProtocolError::MissingDataTerminator);
    }
    let data = raw[..bytes].to_vec();

    Ok(Some(ClientCommand::Storage {
        verb: verb.to_string(),
        key,
        flags,
        exptime,
        cas_unique,
        noreply,
        data,
        line: line.to_vec(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn parses_set_with_inline_data() {
        let (mut client, server) = duplex(256);
        client.write_all(b"set foo 0 0 5\r\nhello\r\n").await.unwrap();
        let mut framed = Framed::new(server);
        let cmd = read_command(&mut framed).await.unwrap().unwrap();
        match cmd {
            ClientCommand::Storage { key, data, noreply, .. } => {
                assert_eq!(key, b"foo");
                assert_eq!(data, b"hello");
                assert!(!noreply);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn detects_noreply_on_set() {
        let (mut client, server) = duplex(256);
        client.write_all(b"set foo 0 0 5 noreply\r\nhello\r\n").await.unwrap();
        let mut framed = Framed::new(server);
        let cmd = read_command(&mut framed).await.unwrap().unwrap();
        assert!(cmd.is_noreply());
    }

    #[tokio::test]
    async fn parses_multi_key_get() {
        let (mut client, server) = duplex(256);
        client.write_all(b"get a b c\r\n").await.unwrap();
        let mut framed = Framed::new(server);
        let cmd = read_command(&mut framed).await.unwrap().unwrap();
        match cmd {
            ClientCommand::Retrieval { keys, .. } => assert_eq!(keys.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_bad_set_arity() {
        let (mut client, server) = duplex(256);
        client.write_all(b"set foo 0 0\r\n").await.unwrap();
        let mut framed = Framed::new(server);
        let err = read_command(&mut framed).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadArity { .. }));
    }

    #[tokio::test]
    async fn recognizes_admin_verb() {
        let (mut client, server) = duplex(256);
        client.write_all(b"__/status/__\r\n").await.unwrap();
        let mut framed = Framed::new(server);
        let cmd = read_command(&mut framed).await.unwrap().unwrap();
        assert!(matches!(cmd, ClientCommand::Admin { .. }));
    }

    #[tokio::test]
    async fn clean_close_returns_none() {
        let (client, server) = duplex(256);
        drop(client);
        let mut framed = Framed::new(server);
        assert!(read_command(&mut framed).await.unwrap().is_none());
    }
}
