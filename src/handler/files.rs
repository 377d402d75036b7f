use async_trait::async_trait;

use super::{caller, decode, Handler, Outcome};
use crate::auth::authorize_file;
use crate::context::ConnectionContext;
use crate::error::{Result, ServiceError};
use crate::protocol::payload::{
    DeletedFile, FileList, FileRef, FileSummary, RenameRequest, RenamedFile, VersionEntry,
    VersionList,
};
use crate::protocol::{PermissionLevel, Request};
use crate::repository::{FileRecord, Repository};
use crate::service::Services;
use crate::validation;

async fn summarize(
    repo: &dyn Repository,
    file: FileRecord,
    permission: PermissionLevel,
    owner_email: Option<String>,
) -> Result<FileSummary> {
    let current = repo.find_version(file.id, file.current_version).await?;
    Ok(FileSummary {
        file_id: file.id,
        file_name: file.name,
        current_version: file.current_version,
        created_at: file.created_at,
        permission,
        owner_email,
        size_bytes: current.as_ref().map(|v| v.size_bytes),
        sha256: current.as_ref().map(|v| v.sha256.clone()),
        uploaded_at: current.map(|v| v.uploaded_at),
    })
}

/// LIST_MY_FILES
pub struct ListMyFiles;

#[async_trait]
impl Handler for ListMyFiles {
    async fn handle(
        &self,
        services: &Services,
        _request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let me = caller(ctx)?;
        let repo = services.repo.as_ref();

        let mut files = Vec::new();
        for file in repo.find_files_by_owner(me.user_id).await? {
            files.push(summarize(repo, file, PermissionLevel::Owner, None).await?);
        }

        tracing::debug!(user_id = me.user_id, count = files.len(), "listed own files");
        Outcome::ok_with(
            "Files retrieved",
            &FileList {
                count: files.len(),
                files,
            },
        )
    }
}

/// LIST_SHARED_WITH_ME
pub struct ListSharedWithMe;

#[async_trait]
impl Handler for ListSharedWithMe {
    async fn handle(
        &self,
        services: &Services,
        _request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let me = caller(ctx)?;
        let repo = services.repo.as_ref();

        let mut files = Vec::new();
        for (file, grant) in repo.list_shared_with_user(me.user_id).await? {
            let owner_email = repo.find_user_by_id(file.owner_id).await?.map(|u| u.email);
            files.push(summarize(repo, file, grant.level, owner_email).await?);
        }

        tracing::debug!(user_id = me.user_id, count = files.len(), "listed shared files");
        Outcome::ok_with(
            "Shared files retrieved",
            &FileList {
                count: files.len(),
                files,
            },
        )
    }
}

/// DELETE_FILE. Soft delete: stored versions stay on disk.
pub struct DeleteFile;

#[async_trait]
impl Handler for DeleteFile {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let me = caller(ctx)?;
        let req: FileRef = decode(request)?;
        let (file, _) = authorize_file(
            services.repo.as_ref(),
            req.file_id,
            me.user_id,
            PermissionLevel::Owner,
            "Only OWNER can delete file",
        )
        .await?;

        services.repo.soft_delete_file(file.id).await?;
        tracing::info!(user_id = me.user_id, file_id = file.id, "file deleted");

        Outcome::ok_with(
            "File deleted successfully",
            &DeletedFile {
                file_id: file.id,
                file_name: file.name,
            },
        )
    }
}

/// RENAME_FILE
pub struct RenameFile;

#[async_trait]
impl Handler for RenameFile {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let me = caller(ctx)?;
        let req: RenameRequest = decode(request)?;
        if req.new_name.trim().is_empty() {
            return Err(ServiceError::validation("newName is required"));
        }
        let new_name = validation::sanitize_filename(&req.new_name)
            .map_err(|_| ServiceError::validation("Invalid newName"))?;

        let (file, _) = authorize_file(
            services.repo.as_ref(),
            req.file_id,
            me.user_id,
            PermissionLevel::Owner,
            "Only OWNER can rename file",
        )
        .await?;

        services.repo.rename_file(file.id, new_name.clone()).await?;
        tracing::info!(user_id = me.user_id, file_id = file.id, "file renamed");

        Outcome::ok_with(
            "File renamed successfully",
            &RenamedFile {
                file_id: file.id,
                old_name: file.name,
                new_name,
            },
        )
    }
}

/// GET_VERSIONS
pub struct GetVersions;

#[async_trait]
impl Handler for GetVersions {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let me = caller(ctx)?;
        let req: FileRef = decode(request)?;
        let repo = services.repo.as_ref();
        let (file, _) = authorize_file(
            repo,
            req.file_id,
            me.user_id,
            PermissionLevel::View,
            "No permission to view this file",
        )
        .await?;

        let mut versions = Vec::new();
        for v in repo.list_versions(file.id).await? {
            let uploader = repo.find_user_by_id(v.uploaded_by).await?;
            versions.push(VersionEntry {
                version_number: v.version_number,
                size_bytes: v.size_bytes,
                sha256: v.sha256,
                uploaded_by: v.uploaded_by,
                uploader_name: uploader.as_ref().map(|u| u.display_name.clone()),
                uploader_email: uploader.map(|u| u.email),
                uploaded_at: v.uploaded_at,
                note: v.note,
            });
        }

        Outcome::ok_with(
            "OK",
            &VersionList {
                file_id: file.id,
                file_name: file.name,
                current_version: file.current_version,
                count: versions.len(),
                versions,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::Fixture;
    use crate::protocol::{Operation, StatusCode};
    use crate::repository::{Permission, VersionRecord};
    use chrono::Utc;
    use serde_json::json;

    /// Creates a committed one-version file owned by the caller of `owner`.
    async fn seed_file(fx: &Fixture, owner: &ConnectionContext, name: &str) -> u64 {
        let repo = &fx.services.repo;
        let owner_id = owner.identity().unwrap().user_id;
        let id = repo.reserve_file_id().await.unwrap();
        repo.create_file(FileRecord {
            id,
            owner_id,
            name: name.to_string(),
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
            size_bytes: 11,
            sha256: "ab".repeat(32),
            uploaded_by: owner_id,
            uploaded_at: Utc::now(),
            note: None,
        })
        .await
        .unwrap();
        grant(fx, id, owner, owner, PermissionLevel::Owner).await;
        id
    }

    async fn grant(
        fx: &Fixture,
        file_id: u64,
        by: &ConnectionContext,
        to: &ConnectionContext,
        level: PermissionLevel,
    ) {
        fx.services
            .repo
            .add_permission(Permission {
                file_id,
                user_id: to.identity().unwrap().user_id,
                level,
                granted_by: by.identity().unwrap().user_id,
                granted_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn file_req(op: Operation, file_id: u64) -> Request {
        Request::new(op).with_data(&json!({ "fileId": file_id })).unwrap()
    }

    #[tokio::test]
    async fn test_listings() {
        let fx = Fixture::new().await;
        let mut owner = fx.user("owner@example.com").await;
        let mut viewer = fx.user("viewer@example.com").await;
        let file_id = seed_file(&fx, &owner, "notes.txt").await;
        grant(&fx, file_id, &owner, &viewer, PermissionLevel::View).await;

        let out = fx
            .run(ListMyFiles, Request::new(Operation::ListMyFiles), &mut owner)
            .await
            .unwrap();
        let mine: FileList = out.response.payload().unwrap();
        assert_eq!(mine.count, 1);
        assert_eq!(mine.files[0].permission, PermissionLevel::Owner);
        assert_eq!(mine.files[0].size_bytes, Some(11));

        let out = fx
            .run(ListSharedWithMe, Request::new(Operation::ListSharedWithMe), &mut viewer)
            .await
            .unwrap();
        let shared: FileList = out.response.payload().unwrap();
        assert_eq!(shared.count, 1);
        assert_eq!(shared.files[0].permission, PermissionLevel::View);
        assert_eq!(shared.files[0].owner_email.as_deref(), Some("owner@example.com"));

        let out = fx
            .run(ListMyFiles, Request::new(Operation::ListMyFiles), &mut viewer)
            .await
            .unwrap();
        assert_eq!(out.response.payload::<FileList>().unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_delete_requires_owner() {
        let fx = Fixture::new().await;
        let mut owner = fx.user("owner@example.com").await;
        let mut editor = fx.user("editor@example.com").await;
        let file_id = seed_file(&fx, &owner, "plan.md").await;
        grant(&fx, file_id, &owner, &editor, PermissionLevel::Edit).await;

        let err = fx
            .run(DeleteFile, file_req(Operation::DeleteFile, file_id), &mut editor)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::Forbidden);

        fx.run(DeleteFile, file_req(Operation::DeleteFile, file_id), &mut owner)
            .await
            .unwrap();
        let err = fx
            .run(DeleteFile, file_req(Operation::DeleteFile, file_id), &mut owner)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_rename_sanitizes() {
        let fx = Fixture::new().await;
        let mut owner = fx.user("owner@example.com").await;
        let file_id = seed_file(&fx, &owner, "old.txt").await;

        let req = Request::new(Operation::RenameFile)
            .with_data(&json!({ "fileId": file_id, "newName": "dir/new?.txt" }))
            .unwrap();
        let out = fx.run(RenameFile, req, &mut owner).await.unwrap();
        let renamed: RenamedFile = out.response.payload().unwrap();
        assert_eq!(renamed.old_name, "old.txt");
        assert_eq!(renamed.new_name, "new_.txt");

        let req = Request::new(Operation::RenameFile)
            .with_data(&json!({ "fileId": file_id, "newName": "../escape" }))
            .unwrap();
        let err = fx.run(RenameFile, req, &mut owner).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ValidationError);
    }

    #[tokio::test]
    async fn test_versions_visible_to_viewers_only() {
        let fx = Fixture::new().await;
        let owner = fx.user("owner@example.com").await;
        let mut viewer = fx.user("viewer@example.com").await;
        let mut stranger = fx.user("stranger@example.com").await;
        let file_id = seed_file(&fx, &owner, "a.bin").await;
        grant(&fx, file_id, &owner, &viewer, PermissionLevel::View).await;

        let out = fx
            .run(GetVersions, file_req(Operation::GetVersions, file_id), &mut viewer)
            .await
            .unwrap();
        let list: VersionList = out.response.payload().unwrap();
        assert_eq!(list.count, 1);
        assert_eq!(list.versions[0].uploader_email.as_deref(), Some("owner@example.com"));

        let err = fx
            .run(GetVersions, file_req(Operation::GetVersions, file_id), &mut stranger)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn test_versions_skip_abandoned_numbers() {
        let fx = Fixture::new().await;
        let mut owner = fx.user("owner@example.com").await;
        let owner_id = owner.identity().unwrap().user_id;
        let file_id = seed_file(&fx, &owner, "draft.md").await;
        let repo = &fx.services.repo;

        // version 2 is reserved by an upload that never completes
        assert_eq!(repo.reserve_version_number(file_id).await.unwrap(), 2);
        let third = repo.reserve_version_number(file_id).await.unwrap();
        assert_eq!(third, 3);
        repo.append_version(VersionRecord {
            file_id,
            version_number: third,
            storage_key: format!("{}/{}", file_id, third),
            size_bytes: 4,
            sha256: "cd".repeat(32),
            uploaded_by: owner_id,
            uploaded_at: Utc::now(),
            note: None,
        })
        .await
        .unwrap();

        let out = fx
            .run(GetVersions, file_req(Operation::GetVersions, file_id), &mut owner)
            .await
            .unwrap();
        let list: VersionList = out.response.payload().unwrap();
        assert_eq!(list.current_version, 3);
        assert_eq!(list.count, 2);
        let numbers: Vec<u32> = list.versions.iter().map(|v| v.version_number).collect();
        assert_eq!(numbers, vec![3, 1]);
    }
}
