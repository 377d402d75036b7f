use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{
    FileRecord, NewUser, Permission, RepoError, RepoResult, Repository, ResetCode, Session, User,
    VersionRecord,
};
use crate::protocol::payload::{FileId, UserId, VersionNumber};
use crate::protocol::PermissionLevel;

#[derive(Default)]
struct State {
    users: HashMap<UserId, User>,
    user_ids_by_email: HashMap<String, UserId>,
    sessions: HashMap<String, Session>,
    files: HashMap<FileId, FileRecord>,
    versions: HashMap<FileId, BTreeMap<VersionNumber, VersionRecord>>,
    /// Highest version number handed out per file.
    version_counters: HashMap<FileId, VersionNumber>,
    permissions: HashMap<(FileId, UserId), Permission>,
    reset_codes: HashMap<String, ResetCode>,
    last_user_id: UserId,
    last_file_id: FileId,
}

impl State {
    fn live_file(&self, id: FileId) -> Option<&FileRecord> {
        self.files.get(&id).filter(|f| !f.is_deleted)
    }
}

/// Process-local repository. Everything lives behind one lock, so every
/// method is atomic with respect to every other.
#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty repository whose file ids start after `last_file_id`.
    pub fn with_file_ids_after(last_file_id: FileId) -> Self {
        Self {
            state: RwLock::new(State {
                last_file_id,
                ..State::default()
            }),
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_user_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        let state = self.state.read().await;
        Ok(state
            .user_ids_by_email
            .get(email)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn find_user_by_id(&self, id: UserId) -> RepoResult<Option<User>> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn create_user(&self, user: NewUser) -> RepoResult<User> {
        let mut state = self.state.write().await;
        if state.user_ids_by_email.contains_key(&user.email) {
            return Err(RepoError::Duplicate("Email".into()));
        }

        state.last_user_id += 1;
        let record = User {
            id: state.last_user_id,
            email: user.email,
            password_hash: user.password_hash,
            display_name: user.display_name,
            is_active: true,
            created_at: Utc::now(),
        };
        state.user_ids_by_email.insert(record.email.clone(), record.id);
        state.users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_password(&self, id: UserId, password_hash: String) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| RepoError::Missing("User".into()))?;
        user.password_hash = password_hash;
        Ok(())
    }

    async fn set_user_active(&self, id: UserId, active: bool) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| RepoError::Missing("User".into()))?;
        user.is_active = active;
        Ok(())
    }

    async fn create_session(&self, session: Session) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if state.sessions.contains_key(&session.token) {
            return Err(RepoError::Duplicate("Session".into()));
        }
        state.sessions.insert(session.token.clone(), session);
        Ok(())
    }

    async fn find_valid_session(&self, token: &str) -> RepoResult<Option<Session>> {
        let now = Utc::now();
        Ok(self
            .state
            .read()
            .await
            .sessions
            .get(token)
            .filter(|s| s.expires_at > now)
            .cloned())
    }

    async fn delete_session(&self, token: &str) -> RepoResult<bool> {
        Ok(self.state.write().await.sessions.remove(token).is_some())
    }

    async fn delete_sessions_for_user(&self, user_id: UserId) -> RepoResult<usize> {
        let mut state = self.state.write().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, s| s.user_id != user_id);
        Ok(before - state.sessions.len())
    }

    async fn reserve_file_id(&self) -> RepoResult<FileId> {
        let mut state = self.state.write().await;
        state.last_file_id += 1;
        Ok(state.last_file_id)
    }

    async fn create_file(&self, file: FileRecord) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if state.files.contains_key(&file.id) {
            return Err(RepoError::Duplicate("File".into()));
        }
        let counter = state.version_counters.entry(file.id).or_default();
        *counter = (*counter).max(file.current_version);
        state.files.insert(file.id, file);
        Ok(())
    }

    async fn find_file(&self, id: FileId) -> RepoResult<Option<FileRecord>> {
        Ok(self.state.read().await.live_file(id).cloned())
    }

    async fn find_files_by_owner(&self, owner_id: UserId) -> RepoResult<Vec<FileRecord>> {
        let state = self.state.read().await;
        let mut files: Vec<FileRecord> = state
            .files
            .values()
            .filter(|f| f.owner_id == owner_id && !f.is_deleted)
            .cloned()
            .collect();
        files.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(files)
    }

    async fn rename_file(&self, id: FileId, name: String) -> RepoResult<()> {
        let mut state = self.state.write().await;
        match state.files.get_mut(&id) {
            Some(file) if !file.is_deleted => {
                file.name = name;
                Ok(())
            }
            _ => Err(RepoError::Missing("File".into())),
        }
    }

    async fn soft_delete_file(&self, id: FileId) -> RepoResult<()> {
        let mut state = self.state.write().await;
        match state.files.get_mut(&id) {
            Some(file) if !file.is_deleted => {
                file.is_deleted = true;
                Ok(())
            }
            _ => Err(RepoError::Missing("File".into())),
        }
    }

    async fn create_file_with_version(
        &self,
        file: FileRecord,
        version: VersionRecord,
        owner: Permission,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let grant_key = (owner.file_id, owner.user_id);
        // Check every constraint before touching anything.
        if state.files.contains_key(&file.id) {
            return Err(RepoError::Duplicate("File".into()));
        }
        if state
            .versions
            .get(&version.file_id)
            .is_some_and(|v| v.contains_key(&version.version_number))
        {
            return Err(RepoError::Duplicate("Version".into()));
        }
        if state.permissions.contains_key(&grant_key) {
            return Err(RepoError::Duplicate("Permission".into()));
        }

        let counter = state.version_counters.entry(file.id).or_default();
        *counter = (*counter).max(file.current_version);
        state
            .versions
            .entry(version.file_id)
            .or_default()
            .insert(version.version_number, version);
        state.permissions.insert(grant_key, owner);
        state.files.insert(file.id, file);
        Ok(())
    }

    async fn reserve_version_number(&self, file_id: FileId) -> RepoResult<VersionNumber> {
        let mut state = self.state.write().await;
        let current = state
            .live_file(file_id)
            .map(|f| f.current_version)
            .ok_or_else(|| RepoError::Missing("File".into()))?;
        let recorded = state
            .versions
            .get(&file_id)
            .and_then(|v| v.keys().next_back().copied())
            .unwrap_or(0);

        let counter = state.version_counters.entry(file_id).or_default();
        let next = (*counter).max(current).max(recorded) + 1;
        *counter = next;
        Ok(next)
    }

    async fn create_version(&self, version: VersionRecord) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let versions = state.versions.entry(version.file_id).or_default();
        if versions.contains_key(&version.version_number) {
            return Err(RepoError::Duplicate("Version".into()));
        }
        versions.insert(version.version_number, version);
        Ok(())
    }

    async fn append_version(&self, version: VersionRecord) -> RepoResult<VersionNumber> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let file = match state.files.get_mut(&version.file_id) {
            Some(file) if !file.is_deleted => file,
            _ => return Err(RepoError::Missing("File".into())),
        };
        let versions = state.versions.entry(version.file_id).or_default();
        if versions.contains_key(&version.version_number) {
            return Err(RepoError::Duplicate("Version".into()));
        }

        file.current_version = file.current_version.max(version.version_number);
        versions.insert(version.version_number, version);
        Ok(file.current_version)
    }

    async fn find_version(
        &self,
        file_id: FileId,
        version: VersionNumber,
    ) -> RepoResult<Option<VersionRecord>> {
        Ok(self
            .state
            .read()
            .await
            .versions
            .get(&file_id)
            .and_then(|v| v.get(&version))
            .cloned())
    }

    async fn list_versions(&self, file_id: FileId) -> RepoResult<Vec<VersionRecord>> {
        Ok(self
            .state
            .read()
            .await
            .versions
            .get(&file_id)
            .map(|v| v.values().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_permission(&self, file_id: FileId, user_id: UserId) -> RepoResult<Option<Permission>> {
        Ok(self
            .state
            .read()
            .await
            .permissions
            .get(&(file_id, user_id))
            .cloned())
    }

    async fn add_permission(&self, permission: Permission) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let key = (permission.file_id, permission.user_id);
        if state.permissions.contains_key(&key) {
            return Err(RepoError::Duplicate("Permission".into()));
        }
        state.permissions.insert(key, permission);
        Ok(())
    }

    async fn update_permission(
        &self,
        file_id: FileId,
        user_id: UserId,
        level: PermissionLevel,
    ) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let grant = state
            .permissions
            .get_mut(&(file_id, user_id))
            .ok_or_else(|| RepoError::Missing("Permission".into()))?;
        grant.level = level;
        Ok(())
    }

    async fn remove_permission(&self, file_id: FileId, user_id: UserId) -> RepoResult<bool> {
        Ok(self
            .state
            .write()
            .await
            .permissions
            .remove(&(file_id, user_id))
            .is_some())
    }

    async fn list_permissions_for_file(&self, file_id: FileId) -> RepoResult<Vec<Permission>> {
        let state = self.state.read().await;
        let mut grants: Vec<Permission> = state
            .permissions
            .values()
            .filter(|p| p.file_id == file_id)
            .cloned()
            .collect();
        grants.sort_by(|a, b| b.level.cmp(&a.level).then(a.granted_at.cmp(&b.granted_at)));
        Ok(grants)
    }

    async fn list_shared_with_user(&self, user_id: UserId) -> RepoResult<Vec<(FileRecord, Permission)>> {
        let state = self.state.read().await;
        let mut shared: Vec<(FileRecord, Permission)> = state
            .permissions
            .values()
            .filter(|p| p.user_id == user_id && p.level != PermissionLevel::Owner)
            .filter_map(|p| state.live_file(p.file_id).map(|f| (f.clone(), p.clone())))
            .collect();
        shared.sort_by(|a, b| b.1.granted_at.cmp(&a.1.granted_at).then(b.0.id.cmp(&a.0.id)));
        Ok(shared)
    }

    async fn create_reset_code(&self, code: ResetCode) -> RepoResult<()> {
        let mut state = self.state.write().await;
        if state.reset_codes.contains_key(&code.code) {
            return Err(RepoError::Duplicate("Reset code".into()));
        }
        state.reset_codes.insert(code.code.clone(), code);
        Ok(())
    }

    async fn find_valid_reset_code(&self, code: &str) -> RepoResult<Option<ResetCode>> {
        let now = Utc::now();
        Ok(self
            .state
            .read()
            .await
            .reset_codes
            .get(code)
            .filter(|c| !c.used && c.expires_at > now)
            .cloned())
    }

    async fn mark_reset_code_used(&self, code: &str) -> RepoResult<()> {
        let mut state = self.state.write().await;
        let entry = state
            .reset_codes
            .get_mut(code)
            .ok_or_else(|| RepoError::Missing("Reset code".into()))?;
        entry.used = true;
        Ok(())
    }

    async fn delete_reset_codes_for_user(&self, user_id: UserId) -> RepoResult<usize> {
        let mut state = self.state.write().await;
        let before = state.reset_codes.len();
        state.reset_codes.retain(|_, c| c.user_id != user_id);
        Ok(before - state.reset_codes.len())
    }

    async fn purge_expired(&self) -> RepoResult<(usize, usize)> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let sessions_before = state.sessions.len();
        state.sessions.retain(|_, s| s.expires_at > now);
        let codes_before = state.reset_codes.len();
        state.reset_codes.retain(|_, c| !c.used && c.expires_at > now);

        Ok((
            sessions_before - state.sessions.len(),
            codes_before - state.reset_codes.len(),
        ))
    }
}
