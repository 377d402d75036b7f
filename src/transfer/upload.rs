use chrono::Utc;
use tokio::io::AsyncRead;

use super::{drain, TransferError};
use crate::context::{Identity, PendingUpload, UploadTarget};
use crate::error::{Result as ServiceResult, ServiceError};
use crate::protocol::payload::UploadComplete;
use crate::protocol::{PermissionLevel, Response, StatusCode};
use crate::repository::{FileRecord, Permission, VersionRecord};
use crate::service::Services;
use crate::storage::{StagedObject, StorageError};

/// Pull exactly `pending.declared_len` bytes off `stream`, verify them and
/// commit. Returns the response to send, or a fatal error if the stream can
/// no longer be trusted.
pub async fn receive<S>(
    services: &Services,
    stream: &mut S,
    uploader: &Identity,
    pending: PendingUpload,
) -> Result<Response, TransferError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let file_id = pending.file_id();
    let version = pending.version_number;
    let declared = pending.declared_len;

    let staged = match services.store.save(file_id, version, stream, declared).await {
        Ok(staged) => staged,
        Err(StorageError::Write { key, consumed, source }) => {
            tracing::error!(%key, consumed, error = %source, "storage write failed, draining upload");
            drain(stream, declared - consumed).await?;
            return Ok(ServiceError::Storage(StorageError::Write { key, consumed, source }).into_response());
        }
        Err(StorageError::LengthMismatch { expected, got }) => {
            tracing::warn!(file_id, version, expected, got, "upload cut short");
            return Err(TransferError::Truncated { expected, got });
        }
        Err(StorageError::Source { source, .. }) => return Err(source.into()),
        Err(other) => return Err(other.into()),
    };

    if !staged.sha256().eq_ignore_ascii_case(&pending.expected_sha256) {
        tracing::warn!(
            file_id,
            version,
            expected = %pending.expected_sha256,
            actual = %staged.sha256(),
            "upload hash mismatch"
        );
        staged.discard().await;
        return Ok(Response::error(StatusCode::ValidationError, "SHA256 mismatch"));
    }

    match commit(services, uploader, &pending, staged).await {
        Ok(done) => {
            tracing::info!(
                user_id = uploader.user_id,
                file_id,
                version,
                size = declared,
                "upload committed"
            );
            Ok(Response::ok_with("Upload successful", &done)
                .unwrap_or_else(|e| ServiceError::Internal(e.to_string()).into_response()))
        }
        Err(e) => Ok(e.into_response()),
    }
}

async fn commit(
    services: &Services,
    uploader: &Identity,
    pending: &PendingUpload,
    staged: StagedObject,
) -> ServiceResult<UploadComplete> {
    let file_id = pending.file_id();
    let version_number = pending.version_number;
    let sha256 = staged.sha256().to_string();
    let size_bytes = staged.size();
    let storage_key = staged.commit().await?;

    let recorded = record(services, uploader, pending, storage_key, size_bytes, sha256.clone()).await;
    let file_name = match recorded {
        Ok(name) => name,
        Err(e) => {
            // The bytes are useless without their rows.
            if let Err(cleanup) = services.store.delete(file_id, version_number).await {
                tracing::warn!(file_id, version = version_number, error = %cleanup, "orphaned artifact");
            }
            return Err(e);
        }
    };

    Ok(UploadComplete {
        file_id,
        version_number,
        file_name,
        size_bytes,
        sha256,
    })
}

/// Persist the version and its file. Returns the file's name.
async fn record(
    services: &Services,
    uploader: &Identity,
    pending: &PendingUpload,
    storage_key: String,
    size_bytes: u64,
    sha256: String,
) -> ServiceResult<String> {
    let repo = services.repo.as_ref();
    let now = Utc::now();
    let version = VersionRecord {
        file_id: pending.file_id(),
        version_number: pending.version_number,
        storage_key,
        size_bytes,
        sha256,
        uploaded_by: uploader.user_id,
        uploaded_at: now,
        note: pending.note.clone(),
    };

    match &pending.target {
        UploadTarget::NewFile { file_id, file_name } => {
            let file = FileRecord {
                id: *file_id,
                owner_id: uploader.user_id,
                name: file_name.clone(),
                current_version: pending.version_number,
                created_at: now,
                is_deleted: false,
            };
            let owner = Permission {
                file_id: *file_id,
                user_id: uploader.user_id,
                level: PermissionLevel::Owner,
                granted_by: uploader.user_id,
                granted_at: now,
            };
            repo.create_file_with_version(file, version, owner).await?;
            Ok(file_name.clone())
        }
        UploadTarget::NewVersion { file_id } => {
            let file = repo
                .find_file(*file_id)
                .await?
                .ok_or_else(|| ServiceError::not_found("File not found"))?;
            repo.append_version(version).await?;
            Ok(file.name)
        }
    }
}
