//! Bundled client. Speaks the same framed protocol as the server and drives
//! both transfer phases from the other side.

use indicatif::{ProgressBar, ProgressStyle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::network::tls::{self, ClientTls, TlsError};
use crate::network::{read_frame, write_frame, write_raw, AsyncStream, FrameError};
use crate::protocol::payload::*;
use crate::protocol::{Operation, PermissionLevel, Request, Response, StatusCode};
use crate::storage::CHUNK_SIZE;
use crate::transfer::file_checksum;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{status:?}: {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("server closed the connection")]
    Closed,

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("downloaded bytes hash to {actual}, server promised {expected}")]
    Integrity { expected: String, actual: String },

    #[error("not logged in")]
    NotLoggedIn,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Status code of a refused request, if that is what this is.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub struct Client {
    stream: Box<dyn AsyncStream>,
    token: Option<String>,
    next_id: u64,
    progress: bool,
}

impl Client {
    pub async fn connect(host: &str, port: u16, mode: &ClientTls) -> Result<Self> {
        let socket = TcpStream::connect((host, port)).await?;
        socket.set_nodelay(true)?;
        let stream: Box<dyn AsyncStream> = match tls::connector(mode)? {
            None => Box::new(socket),
            Some(connector) => {
                let tls_stream = connector
                    .connect(host, socket)
                    .await
                    .map_err(TlsError::from)?;
                Box::new(tls_stream)
            }
        };
        tracing::debug!(host, port, tls = ?mode, "connected");
        Ok(Self::over(stream))
    }

    /// Wrap an already established stream.
    pub fn over(stream: Box<dyn AsyncStream>) -> Self {
        Self {
            stream,
            token: None,
            next_id: 0,
            progress: false,
        }
    }

    /// Draw progress bars on stderr during transfers.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    // ---- envelope plumbing ----

    async fn send(&mut self, op: Operation, data: Option<&impl Serialize>) -> Result<String> {
        self.next_id += 1;
        let correlation_id = format!("c-{}", self.next_id);
        let mut request = Request::new(op).with_correlation_id(correlation_id.clone());
        if let Some(token) = &self.token {
            request = request.with_token(token.clone());
        }
        if let Some(data) = data {
            request = request.with_data(data)?;
        }
        write_frame(&mut self.stream, &request.to_bytes()?).await?;
        Ok(correlation_id)
    }

    async fn receive(&mut self) -> Result<Response> {
        let frame = read_frame(&mut self.stream).await?.ok_or(ClientError::Closed)?;
        let response = Response::from_bytes(&frame)?;
        if !response.success {
            return Err(ClientError::Rejected {
                status: response.status_code,
                message: response.message,
            });
        }
        Ok(response)
    }

    async fn exchange(&mut self, op: Operation, data: Option<&impl Serialize>) -> Result<Response> {
        let sent = self.send(op, data).await?;
        let response = self.receive().await?;
        match response.correlation_id.as_deref() {
            Some(id) if id != sent => Err(ClientError::Protocol(format!(
                "correlation id {} does not match {}",
                id, sent
            ))),
            _ => Ok(response),
        }
    }

    async fn call<T: DeserializeOwned>(&mut self, op: Operation, data: &impl Serialize) -> Result<T> {
        Ok(self.exchange(op, Some(data)).await?.payload()?)
    }

    async fn call_empty<T: DeserializeOwned>(&mut self, op: Operation) -> Result<T> {
        Ok(self.exchange(op, None::<&()>).await?.payload()?)
    }

    // ---- liveness & identity ----

    pub async fn ping(&mut self) -> Result<String> {
        Ok(self.exchange(Operation::Ping, None::<&()>).await?.message)
    }

    pub async fn register(&mut self, email: &str, password: &str, display_name: &str) -> Result<UserInfo> {
        let req = RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
            display_name: display_name.to_string(),
        };
        self.call(Operation::Register, &req).await
    }

    /// Log in and keep the session token for later requests.
    pub async fn login(&mut self, email: &str, password: &str) -> Result<LoginInfo> {
        let req = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let info: LoginInfo = self.call(Operation::Login, &req).await?;
        self.token = Some(info.token.clone());
        Ok(info)
    }

    pub async fn logout(&mut self) -> Result<()> {
        if self.token.is_none() {
            return Err(ClientError::NotLoggedIn);
        }
        self.exchange(Operation::Logout, None::<&()>).await?;
        self.token = None;
        Ok(())
    }

    pub async fn forgot_password(&mut self, email: &str) -> Result<ResetCodeIssued> {
        let req = ForgotPasswordRequest {
            email: email.to_string(),
        };
        self.call(Operation::ForgotPassword, &req).await
    }

    pub async fn reset_password(&mut self, code: &str, new_password: &str) -> Result<Notice> {
        let req = ResetPasswordRequest {
            token: code.to_string(),
            new_password: new_password.to_string(),
        };
        self.call(Operation::ResetPassword, &req).await
    }

    // ---- files ----

    pub async fn list_my_files(&mut self) -> Result<FileList> {
        self.call_empty(Operation::ListMyFiles).await
    }

    pub async fn list_shared_with_me(&mut self) -> Result<FileList> {
        self.call_empty(Operation::ListSharedWithMe).await
    }

    pub async fn delete_file(&mut self, file_id: FileId) -> Result<DeletedFile> {
        self.call(Operation::DeleteFile, &FileRef { file_id }).await
    }

    pub async fn rename_file(&mut self, file_id: FileId, new_name: &str) -> Result<RenamedFile> {
        let req = RenameRequest {
            file_id,
            new_name: new_name.to_string(),
        };
        self.call(Operation::RenameFile, &req).await
    }

    pub async fn versions(&mut self, file_id: FileId) -> Result<VersionList> {
        self.call(Operation::GetVersions, &FileRef { file_id }).await
    }

    // ---- sharing ----

    pub async fn share_add(
        &mut self,
        file_id: FileId,
        target_email: &str,
        level: PermissionLevel,
    ) -> Result<ShareGranted> {
        let req = ShareAddRequest {
            file_id,
            target_email: target_email.to_string(),
            permission: level.to_string(),
        };
        self.call(Operation::ShareAdd, &req).await
    }

    pub async fn share_update(
        &mut self,
        file_id: FileId,
        target_user_id: UserId,
        level: PermissionLevel,
    ) -> Result<ShareChanged> {
        let req = ShareUpdateRequest {
            file_id,
            target_user_id,
            new_permission: level.to_string(),
        };
        self.call(Operation::ShareUpdate, &req).await
    }

    pub async fn share_remove(&mut self, file_id: FileId, target_user_id: UserId) -> Result<()> {
        let req = ShareRemoveRequest {
            file_id,
            target_user_id,
        };
        self.exchange(Operation::ShareRemove, Some(&req)).await?;
        Ok(())
    }

    pub async fn list_shares(&mut self, file_id: FileId) -> Result<ShareList> {
        self.call(Operation::ListShares, &FileRef { file_id }).await
    }

    // ---- transfers ----

    /// Upload a local file as a new file.
    pub async fn upload(&mut self, path: &Path) -> Result<UploadComplete> {
        let (size, sha256) = file_checksum(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let mut file = File::open(path).await?;
        self.upload_from(&file_name, &mut file, size, &sha256).await
    }

    /// Upload `size` bytes from `reader` as a new file named `file_name`.
    pub async fn upload_from<R>(
        &mut self,
        file_name: &str,
        reader: &mut R,
        size: u64,
        sha256: &str,
    ) -> Result<UploadComplete>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let req = UploadBeginRequest {
            file_name: file_name.to_string(),
            file_size: size as i64,
            sha256: sha256.to_string(),
        };
        let ready: UploadReady = self.call(Operation::UploadBegin, &req).await?;
        tracing::debug!(file_id = ready.file_id, size, "server ready for upload");
        self.push(file_name, reader, size).await?;
        Ok(self.receive().await?.payload()?)
    }

    /// Upload a local file as the next version of `file_id`.
    pub async fn upload_new_version(
        &mut self,
        file_id: FileId,
        path: &Path,
        note: Option<&str>,
    ) -> Result<UploadComplete> {
        let (size, sha256) = file_checksum(path).await?;
        let mut file = File::open(path).await?;
        self.upload_new_version_from(file_id, &mut file, size, &sha256, note).await
    }

    pub async fn upload_new_version_from<R>(
        &mut self,
        file_id: FileId,
        reader: &mut R,
        size: u64,
        sha256: &str,
        note: Option<&str>,
    ) -> Result<UploadComplete>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let req = UploadNewVersionRequest {
            file_id,
            file_size: size as i64,
            sha256: sha256.to_string(),
            note: note.map(str::to_string),
        };
        let ready: UploadReady = self.call(Operation::UploadNewVersionBegin, &req).await?;
        let label = format!("file {} v{}", file_id, ready.version_number);
        self.push(&label, reader, size).await?;
        Ok(self.receive().await?.payload()?)
    }

    async fn push<R>(&mut self, label: &str, reader: &mut R, size: u64) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let bar = self.progress_bar(label, size);
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        while sent < size {
            let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
            let n = reader.read(&mut buffer[..want]).await?;
            if n == 0 {
                bar.abandon();
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended after {} of {} bytes", sent, size),
                )
                .into());
            }
            write_raw(&mut self.stream, &buffer[..n]).await?;
            sent += n as u64;
            bar.set_position(sent);
        }
        self.stream.flush().await?;
        bar.finish();
        Ok(())
    }

    /// Download a version (the current one when `version` is `None`) into
    /// `dest`. The file only appears once its hash checks out.
    pub async fn download(
        &mut self,
        file_id: FileId,
        version: Option<VersionNumber>,
        dest: &Path,
    ) -> Result<DownloadMeta> {
        let mut part = dest.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);
        let mut file = File::create(&part).await?;
        match self.download_to(file_id, version, &mut file).await {
            Ok(meta) => {
                file.sync_all().await?;
                drop(file);
                fs::rename(&part, dest).await?;
                Ok(meta)
            }
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    /// Download into any writer, verifying the hash the server announced.
    pub async fn download_to<W>(
        &mut self,
        file_id: FileId,
        version: Option<VersionNumber>,
        writer: &mut W,
    ) -> Result<DownloadMeta>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let req = DownloadBeginRequest {
            file_id,
            version_number: version,
        };
        let meta: DownloadMeta = self.call(Operation::DownloadBegin, &req).await?;
        self.send(Operation::Ready, None::<&()>).await?;

        let bar = self.progress_bar(&meta.file_name, meta.file_size);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        while received < meta.file_size {
            let want = (meta.file_size - received).min(CHUNK_SIZE as u64) as usize;
            let n = self.stream.read(&mut buffer[..want]).await?;
            if n == 0 {
                bar.abandon();
                return Err(ClientError::Closed);
            }
            hasher.update(&buffer[..n]);
            writer.write_all(&buffer[..n]).await?;
            received += n as u64;
            bar.set_position(received);
        }
        writer.flush().await?;
        bar.finish();

        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(&meta.sha256) {
            return Err(ClientError::Integrity {
                expected: meta.sha256,
                actual,
            });
        }
        Ok(meta)
    }

    fn progress_bar(&self, label: &str, len: u64) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        let style = ProgressStyle::with_template(
            "{msg}: {percent}% [{bar:30}] {bytes}/{total_bytes} @ {bytes_per_sec}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        bar.set_message(label.to_string());
        bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::Fixture;
    use crate::server::connection;
    use crate::server::dispatcher::Dispatcher;
    use crate::storage::checksum;
    use tokio::io::duplex;

    fn pair(fx: &Fixture) -> Client {
        let (client, mut server) = duplex(64 * 1024);
        let services = fx.services.clone();
        tokio::spawn(async move {
            let dispatcher = Dispatcher::new();
            let _ = connection::serve(&mut server, "127.0.0.1:7".parse().unwrap(), &services, &dispatcher).await;
        });
        Client::over(Box::new(client))
    }

    #[tokio::test]
    async fn test_session_flow() {
        let fx = Fixture::new().await;
        let mut client = pair(&fx);

        assert_eq!(client.ping().await.unwrap(), "PONG");
        assert!(matches!(client.logout().await, Err(ClientError::NotLoggedIn)));

        client.register("me@example.com", "password1", "Me").await.unwrap();
        let err = client.login("me@example.com", "wrong-pass").await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::Unauthorized));

        let info = client.login("me@example.com", "password1").await.unwrap();
        assert_eq!(client.token(), Some(info.token.as_str()));
        assert_eq!(client.list_my_files().await.unwrap().count, 0);

        client.logout().await.unwrap();
        assert!(client.token().is_none());
    }

    #[tokio::test]
    async fn test_transfer_roundtrip_in_memory() {
        let fx = Fixture::new().await;
        let mut client = pair(&fx);
        client.register("me@example.com", "password1", "Me").await.unwrap();
        client.login("me@example.com", "password1").await.unwrap();

        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
        let mut source = &data[..];
        let done = client
            .upload_from("blob.bin", &mut source, data.len() as u64, &checksum(&data))
            .await
            .unwrap();
        assert_eq!(done.version_number, 1);

        let mut sink = Vec::new();
        let meta = client.download_to(done.file_id, None, &mut sink).await.unwrap();
        assert_eq!(meta.file_name, "blob.bin");
        assert_eq!(sink, data);
    }
}
