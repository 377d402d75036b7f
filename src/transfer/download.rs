use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::TransferError;
use crate::context::PendingDownload;
use crate::network::{read_frame, write_raw, AsyncStream};
use crate::protocol::{Operation, Request};
use crate::service::Services;
use crate::storage::CHUNK_SIZE;

/// Wait for the client's READY, then stream exactly `pending.len` bytes.
/// Returns the byte count sent.
pub async fn send<S>(
    services: &Services,
    stream: &mut S,
    pending: &PendingDownload,
) -> Result<u64, TransferError>
where
    S: AsyncStream + ?Sized,
{
    let frame = read_frame(stream).await?.ok_or(TransferError::PeerClosed)?;
    match Request::from_bytes(&frame) {
        Ok(req) if req.operation == Operation::Ready => {}
        Ok(req) => return Err(TransferError::NotReady(req.operation.to_string())),
        Err(e) => return Err(TransferError::NotReady(format!("undecodable frame ({})", e))),
    }

    let mut artifact = services
        .store
        .open(pending.file_id, pending.version_number, pending.len)
        .await?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < pending.len {
        let n = artifact.read(&mut buffer).await?;
        if n == 0 {
            return Err(TransferError::Truncated {
                expected: pending.len,
                got: sent,
            });
        }
        write_raw(stream, &buffer[..n]).await?;
        sent += n as u64;
    }
    stream.flush().await?;

    tracing::info!(
        file_id = pending.file_id,
        version = pending.version_number,
        bytes = sent,
        "download streamed"
    );
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::Fixture;
    use crate::network::write_frame;
    use crate::storage::checksum;
    use tokio::io::duplex;

    async fn stored(fx: &Fixture, data: &[u8]) -> PendingDownload {
        let mut source = data;
        fx.services
            .store
            .save(1, 1, &mut source, data.len() as u64)
            .await
            .unwrap()
            .commit()
            .await
            .unwrap();
        PendingDownload {
            file_id: 1,
            version_number: 1,
            len: data.len() as u64,
            sha256: checksum(data),
        }
    }

    fn frame_for(op: Operation) -> Vec<u8> {
        Request::new(op).to_bytes().unwrap()
    }

    #[tokio::test]
    async fn test_ready_streams_exact_bytes() {
        let fx = Fixture::new().await;
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 253) as u8).collect();
        let pending = stored(&fx, &data).await;

        let (mut client, mut server) = duplex(4096);
        let expected = data.clone();
        let reader = tokio::spawn(async move {
            write_frame(&mut client, &frame_for(Operation::Ready)).await.unwrap();
            let mut got = vec![0u8; expected.len()];
            client.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
        });

        let sent = send(&fx.services, &mut server, &pending).await.unwrap();
        assert_eq!(sent, data.len() as u64);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_anything_but_ready_aborts_without_bytes() {
        let fx = Fixture::new().await;
        let pending = stored(&fx, b"secret bytes").await;

        let (mut client, mut server) = duplex(4096);
        write_frame(&mut client, &frame_for(Operation::Ping)).await.unwrap();

        let result = send(&fx.services, &mut server, &pending).await;
        assert!(matches!(result, Err(TransferError::NotReady(ref op)) if op == "PING"));
        drop(server);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_peer_gone_before_ready() {
        let fx = Fixture::new().await;
        let pending = stored(&fx, b"abc").await;

        let (client, mut server) = duplex(64);
        drop(client);
        assert!(matches!(
            send(&fx.services, &mut server, &pending).await,
            Err(TransferError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn test_short_artifact_is_fatal() {
        let fx = Fixture::new().await;
        let mut pending = stored(&fx, b"only ten b").await;
        pending.len = 100;

        let (mut client, mut server) = duplex(4096);
        write_frame(&mut client, &frame_for(Operation::Ready)).await.unwrap();
        assert!(matches!(
            send(&fx.services, &mut server, &pending).await,
            Err(TransferError::Artifact(_))
        ));
    }
}
