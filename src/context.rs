//! Per-connection state. Owned by exactly one connection task.

use std::net::SocketAddr;

use crate::protocol::payload::{FileId, UserId, VersionNumber};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub session_token: String,
    pub user_id: UserId,
    pub email: String,
}

/// What the accepted bytes of an upload will become.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    /// A brand new file. The id is reserved but no file row exists yet.
    NewFile { file_id: FileId, file_name: String },
    /// Another version of a live file.
    NewVersion { file_id: FileId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub target: UploadTarget,
    pub version_number: VersionNumber,
    pub declared_len: u64,
    /// Lowercase hex.
    pub expected_sha256: String,
    pub note: Option<String>,
}

impl PendingUpload {
    pub fn file_id(&self) -> FileId {
        match &self.target {
            UploadTarget::NewFile { file_id, .. } | UploadTarget::NewVersion { file_id } => *file_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDownload {
    pub file_id: FileId,
    pub version_number: VersionNumber,
    pub len: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingTransfer {
    Upload(PendingUpload),
    Download(PendingDownload),
}

#[derive(Debug)]
pub struct ConnectionContext {
    peer: SocketAddr,
    identity: Option<Identity>,
    pending: Option<PendingTransfer>,
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            identity: None,
            pending: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    pub fn clear_identity(&mut self) -> Option<Identity> {
        self.identity.take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// At most one transfer at a time; a second one replaces nothing.
    pub fn set_pending(&mut self, transfer: PendingTransfer) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(transfer);
        true
    }

    pub fn take_pending(&mut self) -> Option<PendingTransfer> {
        self.pending.take()
    }

    /// Drop everything. Called on disconnect.
    pub fn reset(&mut self) {
        self.identity = None;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download() -> PendingTransfer {
        PendingTransfer::Download(PendingDownload {
            file_id: 1,
            version_number: 1,
            len: 3,
            sha256: "ab".into(),
        })
    }

    #[test]
    fn test_single_pending_transfer() {
        let mut ctx = ConnectionContext::new("127.0.0.1:1".parse().unwrap());
        assert!(ctx.set_pending(download()));
        assert!(!ctx.set_pending(download()));
        assert!(ctx.take_pending().is_some());
        assert!(!ctx.has_pending());
    }

    #[test]
    fn test_reset_clears_identity() {
        let mut ctx = ConnectionContext::new("127.0.0.1:1".parse().unwrap());
        ctx.set_identity(Identity {
            session_token: "t".into(),
            user_id: 4,
            email: "a@b.cd".into(),
        });
        assert!(ctx.is_authenticated());
        ctx.reset();
        assert!(ctx.identity().is_none());
    }
}
