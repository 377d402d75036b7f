//! Share management. Only a file's owner can touch its grants, and the
//! owner grant itself is never created, changed or removed here.

use async_trait::async_trait;
use chrono::Utc;

use super::{caller, decode, Handler, Outcome};
use crate::auth::authorize_file;
use crate::context::ConnectionContext;
use crate::error::{Result, ServiceError};
use crate::protocol::payload::{
    FileRef, ShareAddRequest, ShareChanged, ShareEntry, ShareGranted, ShareList,
    ShareRemoveRequest, ShareUpdateRequest,
};
use crate::protocol::{PermissionLevel, Request};
use crate::repository::{Permission, RepoError};
use crate::service::Services;

/// Only VIEW and EDIT can be handed out.
fn shareable_level(raw: &str) -> Result<PermissionLevel> {
    if raw.trim().is_empty() {
        return Err(ServiceError::validation("permission is required"));
    }
    match raw.parse::<PermissionLevel>() {
        Ok(level @ (PermissionLevel::View | PermissionLevel::Edit)) => Ok(level),
        _ => Err(ServiceError::validation("permission must be VIEW or EDIT")),
    }
}

/// SHARE_ADD
pub struct ShareAdd;

#[async_trait]
impl Handler for ShareAdd {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let me = caller(ctx)?;
        let req: ShareAddRequest = decode(request)?;
        let target_email = req.target_email.trim().to_lowercase();
        if target_email.is_empty() {
            return Err(ServiceError::validation("targetEmail is required"));
        }
        let level = shareable_level(&req.permission)?;

        let repo = services.repo.as_ref();
        let (file, _) = authorize_file(
            repo,
            req.file_id,
            me.user_id,
            PermissionLevel::Owner,
            "Only file owner can share",
        )
        .await?;

        let target = repo
            .find_user_by_email(&target_email)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("User not found: {}", target_email)))?;
        if target.id == me.user_id {
            return Err(ServiceError::validation("Cannot share with yourself"));
        }

        let already = || ServiceError::conflict("User already has permission. Use SHARE_UPDATE to change.");
        if repo.find_permission(file.id, target.id).await?.is_some() {
            return Err(already());
        }
        repo.add_permission(Permission {
            file_id: file.id,
            user_id: target.id,
            level,
            granted_by: me.user_id,
            granted_at: Utc::now(),
        })
        .await
        .map_err(|e| match e {
            RepoError::Duplicate(_) => already(),
            other => other.into(),
        })?;

        tracing::info!(user_id = me.user_id, file_id = file.id, target = target.id, %level, "share added");
        Outcome::ok_with(
            "Share added successfully",
            &ShareGranted {
                user_id: target.id,
                email: target.email,
                display_name: target.display_name,
                permission: level,
            },
        )
    }
}

/// SHARE_UPDATE
pub struct ShareUpdate;

#[async_trait]
impl Handler for ShareUpdate {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let me = caller(ctx)?;
        let req: ShareUpdateRequest = decode(request)?;
        let level = shareable_level(&req.new_permission)?;

        let repo = services.repo.as_ref();
        let (file, _) = authorize_file(
            repo,
            req.file_id,
            me.user_id,
            PermissionLevel::Owner,
            "Only file owner can update shares",
        )
        .await?;

        if req.target_user_id == me.user_id {
            return Err(ServiceError::validation("Cannot update your own permission"));
        }
        if repo.find_user_by_id(req.target_user_id).await?.is_none() {
            return Err(ServiceError::not_found("Target user not found"));
        }
        let current = repo
            .find_permission(file.id, req.target_user_id)
            .await?
            .ok_or_else(|| {
                ServiceError::not_found("User does not have permission on this file. Use SHARE_ADD first.")
            })?;
        if current.level == PermissionLevel::Owner {
            return Err(ServiceError::forbidden("Cannot update OWNER permission"));
        }

        repo.update_permission(file.id, req.target_user_id, level).await?;
        tracing::info!(
            user_id = me.user_id,
            file_id = file.id,
            target = req.target_user_id,
            %level,
            "share updated"
        );

        Outcome::ok_with(
            "Permission updated successfully",
            &ShareChanged {
                user_id: req.target_user_id,
                permission: level,
            },
        )
    }
}

/// SHARE_REMOVE
pub struct ShareRemove;

#[async_trait]
impl Handler for ShareRemove {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let me = caller(ctx)?;
        let req: ShareRemoveRequest = decode(request)?;

        let repo = services.repo.as_ref();
        let (file, _) = authorize_file(
            repo,
            req.file_id,
            me.user_id,
            PermissionLevel::Owner,
            "Only file owner can remove shares",
        )
        .await?;

        if req.target_user_id == me.user_id {
            return Err(ServiceError::validation("Cannot remove your own permission"));
        }
        let current = repo
            .find_permission(file.id, req.target_user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User does not have permission on this file"))?;
        if current.level == PermissionLevel::Owner {
            return Err(ServiceError::forbidden("Cannot remove OWNER permission"));
        }

        repo.remove_permission(file.id, req.target_user_id).await?;
        tracing::info!(user_id = me.user_id, file_id = file.id, target = req.target_user_id, "share removed");
        Ok(Outcome::ok("Share removed successfully"))
    }
}

/// LIST_SHARES
pub struct ListShares;

#[async_trait]
impl Handler for ListShares {
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
            PermissionLevel::Owner,
            "Only file owner can view shares",
        )
        .await?;

        let mut shares = Vec::new();
        for grant in repo.list_permissions_for_file(file.id).await? {
            // A grant whose user vanished is not worth failing the listing over.
            let Some(user) = repo.find_user_by_id(grant.user_id).await? else {
                continue;
            };
            shares.push(ShareEntry {
                user_id: user.id,
                email: user.email,
                display_name: user.display_name,
                permission: grant.level,
                granted_at: grant.granted_at,
            });
        }

        Outcome::ok_with(
            "OK",
            &ShareList {
                file_id: file.id,
                file_name: file.name,
                shares,
            },
        )
    }
}
