use std::net::SocketAddr;
use thiserror::Error;

use super::dispatcher::Dispatcher;
use crate::context::{ConnectionContext, PendingTransfer};
use crate::network::{read_frame, write_frame, AsyncStream, FrameError};
use crate::protocol::{Request, Response, StatusCode};
use crate::service::Services;
use crate::transfer::{download, upload, TransferError};

/// Why a connection was closed early. Never sent to the peer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("response encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("upload pending without an authenticated caller")]
    NoUploader,
}

/// Serve one client until it leaves or breaks the protocol.
///
/// Requests are handled strictly in order. A transfer begin is followed
/// immediately by its raw byte phase before the next frame is read.
pub async fn serve<S>(
    stream: &mut S,
    peer: SocketAddr,
    services: &Services,
    dispatcher: &Dispatcher,
) -> Result<(), ConnectionError>
where
    S: AsyncStream + ?Sized,
{
    let mut ctx = ConnectionContext::new(peer);
    let result = request_loop(stream, &mut ctx, services, dispatcher).await;
    ctx.reset();
    result
}

async fn request_loop<S>(
    stream: &mut S,
    ctx: &mut ConnectionContext,
    services: &Services,
    dispatcher: &Dispatcher,
) -> Result<(), ConnectionError>
where
    S: AsyncStream + ?Sized,
{
    loop {
        let Some(frame) = read_frame(stream).await? else {
            tracing::debug!(peer = %ctx.peer(), "peer closed");
            return Ok(());
        };

        let request = match Request::from_bytes(&frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(peer = %ctx.peer(), error = %e, "undecodable request");
                let reply = Response::error(StatusCode::ValidationError, format!("Invalid request: {}", e));
                write_frame(stream, &reply.to_bytes()?).await?;
                continue;
            }
        };

        tracing::debug!(peer = %ctx.peer(), op = %request.operation, "request");
        let response = dispatcher.dispatch(services, &request, ctx).await;
        write_frame(stream, &response.to_bytes()?).await?;

        match ctx.take_pending() {
            None => {}
            Some(PendingTransfer::Upload(pending)) => {
                let uploader = ctx.identity().cloned().ok_or(ConnectionError::NoUploader)?;
                let done = upload::receive(services, stream, &uploader, pending).await?;
                let done = done.correlated(&request.correlation_id);
                write_frame(stream, &done.to_bytes()?).await?;
            }
            Some(PendingTransfer::Download(pending)) => {
                download::send(services, stream, &pending).await?;
            }
        }
    }
}
