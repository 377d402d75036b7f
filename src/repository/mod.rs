//! Persistence contract for users, sessions, files, versions, grants and
//! reset codes. Handlers only ever talk to `dyn Repository`.

pub mod memory;

pub use memory::MemoryRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::protocol::payload::{FileId, UserId, VersionNumber};
use crate::protocol::PermissionLevel;

#[derive(Debug, Error)]
pub enum RepoError {
    /// A uniqueness constraint was violated. Carries the entity name.
    #[error("{0} already exists")]
    Duplicate(String),

    /// The row an update targeted does not exist. Carries the entity name.
    #[error("{0} not found")]
    Missing(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub password_hash: String,
    pub display_name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: FileId,
    pub owner_id: UserId,
    pub name: String,
    pub current_version: VersionNumber,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
}

#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub file_id: FileId,
    pub version_number: VersionNumber,
    pub storage_key: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub uploaded_by: UserId,
    pub uploaded_at: DateTime<Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Permission {
    pub file_id: FileId,
    pub user_id: UserId,
    pub level: PermissionLevel,
    pub granted_by: UserId,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResetCode {
    pub code: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

/// Storage of record. Every method must be safe to call from many
/// connections at once; reservations are atomic.
#[async_trait]
pub trait Repository: Send + Sync {
    // ---- users ----
    async fn find_user_by_email(&self, email: &str) -> RepoResult<Option<User>>;
    async fn find_user_by_id(&self, id: UserId) -> RepoResult<Option<User>>;
    /// Fails with `Duplicate` when the email is taken.
    async fn create_user(&self, user: NewUser) -> RepoResult<User>;
    async fn update_password(&self, id: UserId, password_hash: String) -> RepoResult<()>;
    async fn set_user_active(&self, id: UserId, active: bool) -> RepoResult<()>;

    // ---- sessions ----
    async fn create_session(&self, session: Session) -> RepoResult<()>;
    /// Only sessions that have not yet expired.
    async fn find_valid_session(&self, token: &str) -> RepoResult<Option<Session>>;
    async fn delete_session(&self, token: &str) -> RepoResult<bool>;
    async fn delete_sessions_for_user(&self, user_id: UserId) -> RepoResult<usize>;

    // ---- files ----
    /// Hand out a file id that no other caller will ever receive.
    async fn reserve_file_id(&self) -> RepoResult<FileId>;
    async fn create_file(&self, file: FileRecord) -> RepoResult<()>;
    /// Soft-deleted files are invisible here.
    async fn find_file(&self, id: FileId) -> RepoResult<Option<FileRecord>>;
    async fn find_files_by_owner(&self, owner_id: UserId) -> RepoResult<Vec<FileRecord>>;
    async fn rename_file(&self, id: FileId, name: String) -> RepoResult<()>;
    async fn soft_delete_file(&self, id: FileId) -> RepoResult<()>;
    /// Record a brand-new file together with its first version and the
    /// owner's grant. Either all three rows are written or none are.
    async fn create_file_with_version(
        &self,
        file: FileRecord,
        version: VersionRecord,
        owner: Permission,
    ) -> RepoResult<()>;

    // ---- versions ----
    /// Hand out the next version number of a live file. Numbers are never
    /// reused, even when the upload that reserved one fails.
    async fn reserve_version_number(&self, file_id: FileId) -> RepoResult<VersionNumber>;
    async fn create_version(&self, version: VersionRecord) -> RepoResult<()>;
    /// Record a version of a live file and move the current-version pointer
    /// to it unless the pointer is already past it, in one step. Returns the
    /// pointer after the call.
    async fn append_version(&self, version: VersionRecord) -> RepoResult<VersionNumber>;
    async fn find_version(
        &self,
        file_id: FileId,
        version: VersionNumber,
    ) -> RepoResult<Option<VersionRecord>>;
    /// Newest first.
    async fn list_versions(&self, file_id: FileId) -> RepoResult<Vec<VersionRecord>>;

    // ---- permissions ----
    async fn find_permission(&self, file_id: FileId, user_id: UserId) -> RepoResult<Option<Permission>>;
    /// Fails with `Duplicate` when the user already holds a grant on the file.
    async fn add_permission(&self, permission: Permission) -> RepoResult<()>;
    async fn update_permission(
        &self,
        file_id: FileId,
        user_id: UserId,
        level: PermissionLevel,
    ) -> RepoResult<()>;
    async fn remove_permission(&self, file_id: FileId, user_id: UserId) -> RepoResult<bool>;
    async fn list_permissions_for_file(&self, file_id: FileId) -> RepoResult<Vec<Permission>>;
    /// Non-owner grants held by `user_id` on live files.
    async fn list_shared_with_user(&self, user_id: UserId) -> RepoResult<Vec<(FileRecord, Permission)>>;

    // ---- reset codes ----
    /// Fails with `Duplicate` if the code is already outstanding.
    async fn create_reset_code(&self, code: ResetCode) -> RepoResult<()>;
    /// Only unused, unexpired codes.
    async fn find_valid_reset_code(&self, code: &str) -> RepoResult<Option<ResetCode>>;
    async fn mark_reset_code_used(&self, code: &str) -> RepoResult<()>;
    async fn delete_reset_codes_for_user(&self, user_id: UserId) -> RepoResult<usize>;

    // ---- housekeeping ----
    /// Drop expired sessions and expired or used reset codes.
    /// Returns `(sessions, codes)` removed.
    async fn purge_expired(&self) -> RepoResult<(usize, usize)>;
}
