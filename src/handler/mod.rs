//! Operation handlers. Each one turns a request into a response plus the
//! state transition the connection must drive next.

pub mod files;
pub mod identity;
pub mod sharing;
pub mod transfer;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::{ConnectionContext, Identity, PendingDownload, PendingUpload};
use crate::error::{Result, ServiceError};
use crate::protocol::{Operation, Request, Response};
use crate::service::Services;

/// What the connection does after the response frame is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    None,
    ReceiveUpload(PendingUpload),
    SendDownload(PendingDownload),
}

#[derive(Debug)]
pub struct Outcome {
    pub response: Response,
    pub transition: Transition,
}

impl Outcome {
    pub fn reply(response: Response) -> Self {
        Self {
            response,
            transition: Transition::None,
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::reply(Response::ok(message))
    }

    /// Encoding our own payload types is a server fault, not a client one.
    pub fn ok_with<T: Serialize>(message: impl Into<String>, data: &T) -> Result<Self> {
        Response::ok_with(message, data)
            .map(Self::reply)
            .map_err(|e| ServiceError::Internal(format!("response encoding failed: {}", e)))
    }

    pub fn then(mut self, transition: Transition) -> Self {
        self.transition = transition;
        self
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome>;
}

/// The authenticated caller. The dispatcher authenticates before any
/// handler that needs this runs.
pub(crate) fn caller(ctx: &ConnectionContext) -> Result<Identity> {
    ctx.identity()
        .cloned()
        .ok_or_else(|| ServiceError::unauthorized("Authentication required"))
}

pub(crate) fn decode<T: DeserializeOwned>(request: &Request) -> Result<T> {
    if request.data.is_null() {
        return Err(ServiceError::validation("Missing request data"));
    }
    Ok(request.payload()?)
}

/// PING
pub struct Ping;

#[async_trait]
impl Handler for Ping {
    async fn handle(&self, _: &Services, _: &Request, _: &mut ConnectionContext) -> Result<Outcome> {
        Ok(Outcome::ok("PONG"))
    }
}

/// Every operation paired with its handler. READY has no entry: it is only
/// meaningful inside a download handshake.
pub fn all() -> Vec<(Operation, std::sync::Arc<dyn Handler>)> {
    use std::sync::Arc;
    vec![
        (Operation::Register, Arc::new(identity::Register) as Arc<dyn Handler>),
        (Operation::Login, Arc::new(identity::Login)),
        (Operation::Logout, Arc::new(identity::Logout)),
        (Operation::ForgotPassword, Arc::new(identity::ForgotPassword)),
        (Operation::ResetPassword, Arc::new(identity::ResetPassword)),
        (Operation::ListMyFiles, Arc::new(files::ListMyFiles)),
        (Operation::ListSharedWithMe, Arc::new(files::ListSharedWithMe)),
        (Operation::DeleteFile, Arc::new(files::DeleteFile)),
        (Operation::RenameFile, Arc::new(files::RenameFile)),
        (Operation::GetVersions, Arc::new(files::GetVersions)),
        (Operation::ShareAdd, Arc::new(sharing::ShareAdd)),
        (Operation::ShareUpdate, Arc::new(sharing::ShareUpdate)),
        (Operation::ShareRemove, Arc::new(sharing::ShareRemove)),
        (Operation::ListShares, Arc::new(sharing::ListShares)),
        (Operation::UploadBegin, Arc::new(transfer::UploadBegin)),
        (Operation::UploadNewVersionBegin, Arc::new(transfer::UploadNewVersionBegin)),
        (Operation::DownloadBegin, Arc::new(transfer::DownloadBegin)),
        (Operation::Ping, Arc::new(Ping)),
    ]
}
