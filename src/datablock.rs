//! The binary `bget`/`bset`/`bkeys` verbs the gateway uses against backends
//! for replication and redistribution (never exposed to clients).
//!
//! Grounded on `dataio.c`'s wire layouts: a `bget` reply is a one-byte status
//! (`V`/`n`/`e`) optionally followed by a fixed-layout block; `bset` writes
//! that same block with no trailing CRLF and gets back a literal `OK`/`ER`;
//! `bkeys` streams `keylen(1) | key(keylen)` pairs terminated by a zero byte.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::wire::{Framed, WireError};

/// `stat` bit indicating the payload is zlib-compressed. The gateway treats
/// the block opaquely and never inspects this, but preserves it byte-for-byte
/// when copying a block between backends.
pub const DATA_COMPRESS_Z: u8 = 0x1;

#[derive(Debug, Error)]
pub enum DataBlockError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("backend reported an error for key {0:?}")]
    BackendError(Vec<u8>),
    #[error("unexpected bget status byte {0:#x}")]
    UnexpectedStatus(u8),
    #[error("bset was rejected by the backend")]
    SetRejected,
}

/// An opaque data block as carried by `bget`/`bset`.
#[derive(Debug, Clone)]
pub struct DataBlock {
    pub stat: u8,
    pub cas: u64,
    pub data: Vec<u8>,
}

/// Issues `bget <key>\r\n`. Returns `Ok(None)` when the backend replies `n`
/// (not found, treated as success with nothing to propagate).
pub async fn bget<S>(framed: &mut Framed<S>, key: &[u8]) -> Result<Option<DataBlock>, DataBlockError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = Vec::with_capacity(6 + key.len());
    line.extend_from_slice(b"bget ");
    line.extend_from_slice(key);
    framed.write_all(&line).await?;
    framed.write_all(b"\r\n").await?;
    framed.flush().await?;

    match framed.read_u8().await? {
        b'n' => Ok(None),
        b'e' => Err(DataBlockError::BackendError(key.to_vec())),
        b'V' => {
            let size = framed.read_u32_le().await? as usize;
            let stat = framed.read_u8().await?;
            let cas = framed.read_u64_le().await?;
            let data = framed.read_exact_n(size).await?;
            Ok(Some(DataBlock { stat, cas, data }))
        }
        other => Err(DataBlockError::UnexpectedStatus(other)),
    }
}

/// Issues `bset <key>\r\n` followed by `block`'s wire layout. Requires the
/// backend's literal `OK` reply.
pub async fn bset<S>(framed: &mut Framed<S>, key: &[u8], block: &DataBlock) -> Result<(), DataBlockError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = Vec::with_capacity(6 + key.len());
    line.extend_from_slice(b"bset ");
    line.extend_from_slice(key);
    framed.write_all(&line).await?;
    framed.write_all(b"\r\n").await?;

    framed.write_all(&(block.data.len() as u32).to_le_bytes()).await?;
    framed.write_all(&[block.stat]).await?;
    framed.write_all(&block.cas.to_le_bytes()).await?;
    framed.write_all(&block.data).await?;
    framed.flush().await?;

    let reply = framed.read_exact_n(2).await?;
    if reply == b"OK" {
        Ok(())
    } else {
        Err(DataBlockError::SetRejected)
    }
}

/// Issues `bkeys\r\n` and drains the streamed `keylen | key` pairs.
pub async fn bkeys<S>(framed: &mut Framed<S>) -> Result<Vec<Vec<u8>>, DataBlockError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.write_all(b"bkeys\r\n").await?;
    framed.flush().await?;

    let mut keys = Vec::new();
    loop {
        let keylen = framed.read_u8().await?;
        if keylen == 0 {
            return Ok(keys);
        }
        keys.push(framed.read_exact_n(keylen as usize).await?);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn bget_not_found() {
        let (mut client, server) = duplex(64);
        client.write_all(b"n").await.unwrap();
        let mut framed = Framed::new(server);
        let result = bget(&mut framed, b"missing").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn bget_parses_value_block() {
        let (mut client, server) = duplex(128);
        let mut wire = Vec::new();
        wire.push(b'V');
        wire.extend_from_slice(&3u32.to_le_bytes());
        wire.push(0);
        wire.extend_from_slice(&42u64.to_le_bytes());
        wire.extend_from_slice(b"abc");
        client.write_all(&wire).await.unwrap();
        let mut framed = Framed::new(server);
        let block = bget(&mut framed, b"k").await.unwrap().unwrap();
        assert_eq!(block.data, b"abc");
        assert_eq!(block.cas, 42);
        assert_eq!(block.stat, 0);
    }

    #[tokio::test]
    async fn bkeys_streams_until_zero_length() {
        let (mut client, server) = duplex(128);
        let mut wire = Vec::new();
        wire.push(3);
        wire.extend_from_slice(b"foo");
        wire.push(3);
        wire.extend_from_slice(b"bar");
        wire.push(0);
        client.write_all(&wire).await.unwrap();
        let mut framed = Framed::new(server);
        // drain the "bkeys\r\n" request line written into the duplex buffer's
        // other half isn't observed here since we write directly to `client`.
        let keys = bkeys(&mut framed).await.unwrap();
        assert_eq!(keys, vec![b"foo".to_vec(), b"bar".to_vec()]);
    }
}
