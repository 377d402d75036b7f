//! First phase of uploads and downloads. Each handler validates, reserves
//! what it needs and hands the connection a transition to drive.

use async_trait::async_trait;

use super::{caller, decode, Handler, Outcome, Transition};
use crate::auth::authorize_file;
use crate::context::{ConnectionContext, PendingDownload, PendingUpload, UploadTarget};
use crate::error::{Result, ServiceError};
use crate::protocol::payload::{
    DownloadBeginRequest, DownloadMeta, UploadBeginRequest, UploadNewVersionRequest, UploadReady,
};
use crate::protocol::{PermissionLevel, Request};
use crate::service::Services;
use crate::validation;

const READY: &str = "READY";

fn ready(pending: PendingUpload) -> Result<Outcome> {
    let outcome = Outcome::ok_with(
        READY,
        &UploadReady {
            status: READY.to_string(),
            file_id: pending.file_id(),
            version_number: pending.version_number,
        },
    )?;
    Ok(outcome.then(Transition::ReceiveUpload(pending)))
}

/// UPLOAD_BEGIN: a brand new file.
pub struct UploadBegin;

#[async_trait]
impl Handler for UploadBegin {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let me = caller(ctx)?;
        let req: UploadBeginRequest = decode(request)?;
        let file_name = validation::sanitize_filename(&req.file_name)
            .map_err(|_| ServiceError::validation("Invalid fileName"))?;
        let declared_len = validation::validate_file_size(req.file_size, services.limits.max_file_size)?;
        let expected_sha256 = validation::normalize_sha256(&req.sha256)?;

        let file_id = services.repo.reserve_file_id().await?;
        tracing::info!(
            peer = %ctx.peer(),
            user_id = me.user_id,
            file_id,
            size = declared_len,
            "upload announced"
        );

        ready(PendingUpload {
            target: UploadTarget::NewFile { file_id, file_name },
            version_number: 1,
            declared_len,
            expected_sha256,
            note: None,
        })
    }
}

/// UPLOAD_NEW_VERSION_BEGIN: another version of a file the caller can edit.
pub struct UploadNewVersionBegin;

#[async_trait]
impl Handler for UploadNewVersionBegin {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let me = caller(ctx)?;
        let req: UploadNewVersionRequest = decode(request)?;
        let declared_len = validation::validate_file_size(req.file_size, services.limits.max_file_size)?;
        let expected_sha256 = validation::normalize_sha256(&req.sha256)?;

        let (file, _) = authorize_file(
            services.repo.as_ref(),
            req.file_id,
            me.user_id,
            PermissionLevel::Edit,
            "Edit permission required to upload a new version",
        )
        .await?;

        let version_number = services.repo.reserve_version_number(file.id).await?;
        tracing::info!(
            peer = %ctx.peer(),
            user_id = me.user_id,
            file_id = file.id,
            version = version_number,
            size = declared_len,
            "new version announced"
        );

        ready(PendingUpload {
            target: UploadTarget::NewVersion { file_id: file.id },
            version_number,
            declared_len,
            expected_sha256,
            note: req.note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
        })
    }
}

/// DOWNLOAD_BEGIN
pub struct DownloadBegin;

#[async_trait]
impl Handler for DownloadBegin {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let me = caller(ctx)?;
        let req: DownloadBeginRequest = decode(request)?;
        let repo = services.repo.as_ref();

        let (file, _) = authorize_file(
            repo,
            req.file_id,
            me.user_id,
            PermissionLevel::View,
            "No permission to download this file",
        )
        .await?;

        let wanted = req.version_number.unwrap_or(file.current_version);
        let version = repo
            .find_version(file.id, wanted)
            .await?
            .ok_or_else(|| ServiceError::not_found("Version not found"))?;

        tracing::info!(
            peer = %ctx.peer(),
            user_id = me.user_id,
            file_id = file.id,
            version = version.version_number,
            "download announced"
        );

        let pending = PendingDownload {
            file_id: file.id,
            version_number: version.version_number,
            len: version.size_bytes,
            sha256: version.sha256.clone(),
        };
        let outcome = Outcome::ok_with(
            "FILE_META",
            &DownloadMeta {
                file_id: file.id,
                file_name: file.name,
                file_size: version.size_bytes,
                sha256: version.sha256,
                version_number: version.version_number,
            },
        )?;
        Ok(outcome.then(Transition::SendDownload(pending)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::Fixture;
    use crate::protocol::{Operation, StatusCode};
    use crate::repository::{FileRecord, Permission, VersionRecord};
    use chrono::Utc;
    use serde_json::json;

    const HASH: &str = "ABCDEF0123456789abcdef0123456789ABCDEF0123456789abcdef0123456789";

    async fn seed(fx: &Fixture, owner: &ConnectionContext) -> u64 {
        let owner_id = owner.identity().unwrap().user_id;
        let repo = &fx.services.repo;
        let id = repo.reserve_file_id().await.unwrap();
        repo.create_file(FileRecord {
            id,
            owner_id,
            name: "report.pdf".into(),
            current_version: 1,
            created_at: Utc::now(),
            is_deleted: false,
        })
        .await
        .unwrap();
        repo.create_version(VersionRecord {
            file_id: id,
            version_number: 1,
            storage_key: format!("{}/1", id),
            size_bytes: 42,
            sha256: HASH.to_lowercase(),
            uploaded_by: owner_id,
            uploaded_at: Utc::now(),
            note: None,
        })
        .await
        .unwrap();
        repo.add_permission(Permission {
            file_id: id,
            user_id: owner_id,
            level: PermissionLevel::Owner,
            granted_by: owner_id,
            granted_at: Utc::now(),
        })
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn test_upload_begin_reserves_and_transitions() {
        let fx = Fixture::new().await;
        let mut ctx = fx.user("up@example.com").await;

        let req = Request::new(Operation::UploadBegin)
            .with_data(&json!({ "fileName": "docs/My File?.txt", "fileSize": 10, "sha256": HASH }))
            .unwrap();
        let out = fx.run(UploadBegin, req, &mut ctx).await.unwrap();
        let ready: UploadReady = out.response.payload().unwrap();
        assert_eq!(ready.status, "READY");
        assert_eq!(ready.version_number, 1);

        match out.transition {
            Transition::ReceiveUpload(pending) => {
                assert_eq!(pending.file_id(), ready.file_id);
                assert_eq!(pending.declared_len, 10);
                assert_eq!(pending.expected_sha256, HASH.to_lowercase());
                assert_eq!(
                    pending.target,
                    UploadTarget::NewFile {
                        file_id: ready.file_id,
                        file_name: "My File_.txt".into()
                    }
                );
            }
            other => panic!("expected upload transition, got {:?}", other),
        }
        // nothing exists until the bytes arrive
        assert!(fx.services.repo.find_file(ready.file_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upload_begin_validation() {
        let fx = Fixture::new().await;
        let mut ctx = fx.user("up@example.com").await;
        let cases = [
            json!({ "fileName": "../x", "fileSize": 10, "sha256": HASH }),
            json!({ "fileName": "x", "fileSize": 0, "sha256": HASH }),
            json!({ "fileName": "x", "fileSize": 2 * 1024 * 1024, "sha256": HASH }),
            json!({ "fileName": "x", "fileSize": 10, "sha256": "abc" }),
            json!({ "fileName": "x", "sha256": HASH }),
        ];
        for data in cases {
            let req = Request::new(Operation::UploadBegin).with_data(&data).unwrap();
            let err = fx.run(UploadBegin, req, &mut ctx).await.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::ValidationError, "{}", data);
        }
    }

    #[tokio::test]
    async fn test_new_version_needs_edit() {
        let fx = Fixture::new().await;
        let mut owner = fx.user("owner@example.com").await;
        let mut viewer = fx.user("viewer@example.com").await;
        let file_id = seed(&fx, &owner).await;
        fx.services
            .repo
            .add_permission(Permission {
                file_id,
                user_id: viewer.identity().unwrap().user_id,
                level: PermissionLevel::View,
                granted_by: owner.identity().unwrap().user_id,
                granted_at: Utc::now(),
            })
            .await
            .unwrap();

        let req = || {
            Request::new(Operation::UploadNewVersionBegin)
                .with_data(&json!({ "fileId": file_id, "fileSize": 5, "sha256": HASH, "note": "  fix  " }))
                .unwrap()
        };
        let err = fx.run(UploadNewVersionBegin, req(), &mut viewer).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::Forbidden);

        let first = fx.run(UploadNewVersionBegin, req(), &mut owner).await.unwrap();
        let second = fx.run(UploadNewVersionBegin, req(), &mut owner).await.unwrap();
        let a: UploadReady = first.response.payload().unwrap();
        let b: UploadReady = second.response.payload().unwrap();
        assert_eq!((a.version_number, b.version_number), (2, 3));
        match first.transition {
            Transition::ReceiveUpload(p) => assert_eq!(p.note.as_deref(), Some("fix")),
            other => panic!("expected upload transition, got {:?}", other),
        }

        let missing = Request::new(Operation::UploadNewVersionBegin)
            .with_data(&json!({ "fileId": 999, "fileSize": 5, "sha256": HASH }))
            .unwrap();
        let err = fx.run(UploadNewVersionBegin, missing, &mut owner).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_download_begin() {
        let fx = Fixture::new().await;
        let mut owner = fx.user("owner@example.com").await;
        let mut stranger = fx.user("stranger@example.com").await;
        let file_id = seed(&fx, &owner).await;

        let req = |version: Option<u32>| {
            Request::new(Operation::DownloadBegin)
                .with_data(&json!({ "fileId": file_id, "versionNumber": version }))
                .unwrap()
        };

        let out = fx.run(DownloadBegin, req(None), &mut owner).await.unwrap();
        let meta: DownloadMeta = out.response.payload().unwrap();
        assert_eq!(meta.file_size, 42);
        assert_eq!(meta.file_name, "report.pdf");
        assert!(matches!(out.transition, Transition::SendDownload(ref p) if p.len == 42));

        let err = fx.run(DownloadBegin, req(None), &mut stranger).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::Forbidden);
        let err = fx.run(DownloadBegin, req(Some(7)), &mut owner).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NotFound);
    }
}
