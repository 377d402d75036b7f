//! Session resolution, permission checks and credential helpers shared by
//! every handler.

use rand::Rng;

use crate::context::{ConnectionContext, Identity};
use crate::error::{Result, ServiceError};
use crate::protocol::payload::{FileId, UserId};
use crate::protocol::{PermissionLevel, Request};
use crate::repository::{FileRecord, Repository};

const SESSION_TOKEN_BYTES: usize = 32;

/// Resolve who is calling. A connection that already authenticated keeps
/// its identity without another lookup.
pub async fn authenticate(
    repo: &dyn Repository,
    request: &Request,
    ctx: &mut ConnectionContext,
) -> Result<Identity> {
    if let Some(identity) = ctx.identity() {
        return Ok(identity.clone());
    }

    let token = match request.session_token.as_deref() {
        Some(token) if !token.is_empty() => token,
        _ => return Err(ServiceError::unauthorized("Session token required")),
    };

    let session = repo
        .find_valid_session(token)
        .await?
        .ok_or_else(|| ServiceError::unauthorized("Invalid or expired session"))?;

    let user = repo
        .find_user_by_id(session.user_id)
        .await?
        .ok_or_else(|| ServiceError::unauthorized("User not found"))?;

    if !user.is_active {
        return Err(ServiceError::unauthorized("Account is disabled"));
    }

    let identity = Identity {
        session_token: session.token,
        user_id: user.id,
        email: user.email,
    };
    ctx.set_identity(identity.clone());
    Ok(identity)
}

/// Load a live file and check that `user_id` holds at least `required` on it.
pub async fn authorize_file(
    repo: &dyn Repository,
    file_id: FileId,
    user_id: UserId,
    required: PermissionLevel,
    denied: &str,
) -> Result<(FileRecord, PermissionLevel)> {
    let file = repo
        .find_file(file_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("File not found"))?;

    let level = repo
        .find_permission(file_id, user_id)
        .await?
        .map(|p| p.level);

    match level {
        Some(level) if level.satisfies(required) => Ok((file, level)),
        _ => {
            tracing::debug!(file_id, user_id, %required, "permission denied");
            Err(ServiceError::forbidden(denied))
        }
    }
}

/// bcrypt is CPU-bound, so it runs off the reactor.
pub async fn hash_password(password: &str, cost: u32) -> Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await?
        .map_err(|e| ServiceError::Internal(format!("password hashing failed: {}", e)))
}

pub async fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let password = password.to_string();
    let hash = hash.to_string();
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await?;
    match verified {
        Ok(ok) => Ok(ok),
        Err(e) => {
            // A corrupt stored hash should read as a failed login, not a crash.
            tracing::warn!(error = %e, "stored password hash could not be verified");
            Ok(false)
        }
    }
}

/// 256 random bits, hex encoded.
pub fn new_session_token() -> String {
    let bytes: [u8; SESSION_TOKEN_BYTES] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Six decimal digits, never starting with zero.
pub fn new_reset_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999u32).to_string()
}
