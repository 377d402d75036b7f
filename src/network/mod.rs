//! Length-prefixed framing for the control channel, plus exact-count raw
//! byte runs for the data channel that shares the same socket.

pub mod idle;
pub mod tls;

use std::io::ErrorKind;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a control frame (10 MiB).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Anything a connection can run over: plain TCP, TLS, or an in-memory pipe.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge(usize),

    #[error("stream closed after {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Write one frame: 4-byte big-endian length, payload, flush.
pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly before the
/// first header byte. A close anywhere after that is [`FrameError::Truncated`].
/// An oversized length is rejected after consuming only the header.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; LENGTH_PREFIX_BYTES];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_BYTES {
        let n = stream.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                expected: LENGTH_PREFIX_BYTES,
                got: filled,
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    read_raw_exact(stream, &mut payload).await?;
    Ok(Some(payload))
}

/// Fill `buf` completely from the stream, looping over partial reads.
pub async fn read_raw_exact<R>(stream: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut got = 0;
    while got < buf.len() {
        let n = match stream.read(&mut buf[got..]).await {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Err(FrameError::Truncated {
                expected: buf.len(),
                got,
            });
        }
        got += n;
    }
    Ok(())
}

/// Write an unframed byte run. The caller flushes once the run is complete.
pub async fn write_raw<W>(stream: &mut W, data: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(data).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = duplex(64);

        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"hello drivelite").await.unwrap();
            write_frame(&mut a, b"").await.unwrap();
        });

        let first = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(first, b"hello drivelite");
        let empty = read_frame(&mut b).await.unwrap().unwrap();
        assert!(empty.is_empty());

        writer.await.unwrap();
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_large_frame_across_partial_reads() {
        let (mut a, mut b) = duplex(1024);
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            write_frame(&mut a, &payload).await.unwrap();
        });

        let got = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_length_consumes_only_header() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        wire.extend_from_slice(b"next");

        let mut reader = &wire[..];
        match read_frame(&mut reader).await {
            Err(FrameError::TooLarge(len)) => assert_eq!(len, MAX_FRAME_SIZE + 1),
            other => panic!("expected TooLarge, got {:?}", other),
        }
        assert_eq!(reader, b"next");
    }

    #[tokio::test]
    async fn test_negative_length_is_rejected() {
        // A signed peer writing -1 puts 0xFFFFFFFF on the wire.
        let wire = (-1i32).to_be_bytes();
        let mut reader = &wire[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_fails() {
        let (mut a, mut b) = duplex(8);

        tokio::spawn(async move {
            a.write_all(&10u32.to_be_bytes()).await.unwrap();
            for chunk in [b"ab".as_slice(), b"cd", b"e"] {
                a.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            // dropping `a` closes the stream mid-payload
        });

        match read_frame(&mut b).await {
            Err(FrameError::Truncated { expected, got }) => {
                assert_eq!(expected, 10);
                assert_eq!(got, 5);
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_header_fails() {
        let wire = [0u8, 0];
        let mut reader = &wire[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::Truncated { expected: 4, got: 2 })
        ));
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_payload() {
        let mut sink = Vec::new();
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            write_frame(&mut sink, &payload).await,
            Err(FrameError::TooLarge(_))
        ));
        assert!(sink.is_empty());
    }
}
