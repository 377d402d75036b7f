//! Second phase of uploads and downloads: raw bytes on the same socket
//! that carries the framed control messages.
//!
//! Anything returned as a [`TransferError`] leaves the stream in an unknown
//! position, so the connection must close. Failures that can be answered
//! come back as an error `Response` instead.

pub mod download;
pub mod upload;

use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::network::FrameError;
use crate::storage::{StorageError, CHUNK_SIZE};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("peer closed after {got} of {expected} bytes")]
    Truncated { expected: u64, got: u64 },

    #[error("expected READY, got {0}")]
    NotReady(String),

    #[error("peer closed before READY")]
    PeerClosed,

    #[error("stored artifact is unusable: {0}")]
    Artifact(#[from] StorageError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read and throw away exactly `remaining` bytes.
pub(crate) async fn drain<R>(stream: &mut R, remaining: u64) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut left = remaining;
    while left > 0 {
        let want = left.min(CHUNK_SIZE as u64) as usize;
        let n = stream.read(&mut buffer[..want]).await?;
        if n == 0 {
            return Err(TransferError::Truncated {
                expected: remaining,
                got: remaining - left,
            });
        }
        left -= n as u64;
    }
    Ok(())
}

/// Size and lowercase hex SHA-256 of a local file, read in chunks.
pub async fn file_checksum(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}
