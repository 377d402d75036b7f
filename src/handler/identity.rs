use async_trait::async_trait;
use chrono::Utc;

use super::{caller, decode, Handler, Outcome};
use crate::auth;
use crate::context::{ConnectionContext, Identity};
use crate::error::{Result, ServiceError};
use crate::protocol::payload::{
    ForgotPasswordRequest, LoginInfo, LoginRequest, Notice, RegisterRequest, ResetCodeIssued,
    ResetPasswordRequest, UserInfo,
};
use crate::protocol::Request;
use crate::repository::{NewUser, RepoError, ResetCode, Session};
use crate::service::Services;
use crate::validation;

const RESET_CODE_ATTEMPTS: usize = 5;

fn ttl(duration: std::time::Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| ServiceError::Internal(format!("ttl out of range: {}", e)))
}

/// Lowercased, trimmed email without format checks. Used where an unknown
/// address must not be distinguishable from a malformed one.
fn lookup_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Err(ServiceError::validation("Email is required"));
    }
    Ok(email)
}

/// REGISTER
pub struct Register;

#[async_trait]
impl Handler for Register {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        _ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let req: RegisterRequest = decode(request)?;
        let email = validation::normalize_email(&req.email)?;
        validation::validate_password(&req.password)?;
        let display_name = validation::normalize_display_name(&req.display_name)?;

        if services.repo.find_user_by_email(&email).await?.is_some() {
            return Err(ServiceError::conflict("Email already registered"));
        }

        let password_hash = auth::hash_password(&req.password, services.limits.bcrypt_cost).await?;
        let user = services
            .repo
            .create_user(NewUser {
                email,
                password_hash,
                display_name,
            })
            .await
            .map_err(|e| match e {
                RepoError::Duplicate(_) => ServiceError::conflict("Email already registered"),
                other => other.into(),
            })?;

        tracing::info!(user_id = user.id, "user registered");
        Outcome::ok_with(
            "Registration successful",
            &UserInfo {
                user_id: user.id,
                email: user.email,
                display_name: user.display_name,
            },
        )
    }
}

/// LOGIN
pub struct Login;

#[async_trait]
impl Handler for Login {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let req: LoginRequest = decode(request)?;
        let email = lookup_email(&req.email)?;
        if req.password.is_empty() {
            return Err(ServiceError::validation("Password is required"));
        }

        let invalid = || ServiceError::unauthorized("Invalid email or password");
        let user = services
            .repo
            .find_user_by_email(&email)
            .await?
            .ok_or_else(invalid)?;
        if !user.is_active {
            return Err(ServiceError::unauthorized("Account is disabled"));
        }
        if !auth::verify_password(&req.password, &user.password_hash).await? {
            tracing::info!(peer = %ctx.peer(), user_id = user.id, "failed login");
            return Err(invalid());
        }

        let now = Utc::now();
        let token = auth::new_session_token();
        services
            .repo
            .create_session(Session {
                token: token.clone(),
                user_id: user.id,
                expires_at: now + ttl(services.limits.session_ttl)?,
                created_at: now,
            })
            .await?;

        ctx.set_identity(Identity {
            session_token: token.clone(),
            user_id: user.id,
            email: user.email.clone(),
        });
        tracing::info!(peer = %ctx.peer(), user_id = user.id, "login");

        Outcome::ok_with(
            "Login successful",
            &LoginInfo {
                token,
                user_id: user.id,
                display_name: user.display_name,
                email: user.email,
            },
        )
    }
}

/// LOGOUT. Always succeeds once the caller is authenticated.
pub struct Logout;

#[async_trait]
impl Handler for Logout {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let token = match request.session_token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => token.to_string(),
            None => caller(ctx)
                .map(|identity| identity.session_token)
                .map_err(|_| ServiceError::unauthorized("No session to logout"))?,
        };

        let existed = services.repo.delete_session(&token).await?;
        let identity = ctx.clear_identity();
        tracing::info!(
            peer = %ctx.peer(),
            user_id = identity.map(|i| i.user_id),
            existed,
            "logout"
        );
        Ok(Outcome::ok("Logout successful"))
    }
}

/// FORGOT_PASSWORD
pub struct ForgotPassword;

#[async_trait]
impl Handler for ForgotPassword {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        _ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let req: ForgotPasswordRequest = decode(request)?;
        let email = lookup_email(&req.email)?;
        let issued = ResetCodeIssued {
            message: "Check your email for the OTP code".to_string(),
            expires_in_minutes: services.limits.reset_code_ttl.as_secs() / 60,
        };

        // Unknown and disabled accounts get the same answer as a real one.
        let user = match services.repo.find_user_by_email(&email).await? {
            Some(user) if user.is_active => user,
            Some(user) => {
                tracing::warn!(user_id = user.id, "reset requested for disabled account, no code sent");
                return Outcome::ok_with("If the email exists, an OTP has been sent", &issued);
            }
            None => return Outcome::ok_with("If the email exists, an OTP has been sent", &issued),
        };

        services.repo.delete_reset_codes_for_user(user.id).await?;

        let now = Utc::now();
        let expires_at = now + ttl(services.limits.reset_code_ttl)?;
        let mut code = None;
        for _ in 0..RESET_CODE_ATTEMPTS {
            let candidate = auth::new_reset_code();
            let created = services
                .repo
                .create_reset_code(ResetCode {
                    code: candidate.clone(),
                    user_id: user.id,
                    expires_at,
                    used: false,
                    created_at: now,
                })
                .await;
            match created {
                Ok(()) => {
                    code = Some(candidate);
                    break;
                }
                Err(RepoError::Duplicate(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let code = code.ok_or_else(|| ServiceError::Internal("no free reset code".into()))?;

        if let Err(e) = services.notifier.send_reset_code(&email, &code).await {
            if services.notifier.is_enabled() {
                return Err(ServiceError::Internal(format!("failed to send reset code: {:#}", e)));
            }
            tracing::warn!(user_id = user.id, error = %e, "reset code delivery failed");
        }

        tracing::info!(user_id = user.id, "reset code issued");
        Outcome::ok_with("OTP has been sent to your email", &issued)
    }
}

/// RESET_PASSWORD
pub struct ResetPassword;

#[async_trait]
impl Handler for ResetPassword {
    async fn handle(
        &self,
        services: &Services,
        request: &Request,
        _ctx: &mut ConnectionContext,
    ) -> Result<Outcome> {
        let req: ResetPasswordRequest = decode(request)?;
        let code = req.token.trim();
        if code.is_empty() {
            return Err(ServiceError::validation("Reset token is required"));
        }
        validation::validate_password(&req.new_password)?;

        let reset = services
            .repo
            .find_valid_reset_code(code)
            .await?
            .ok_or_else(|| ServiceError::unauthorized("Invalid or expired reset token"))?;

        let hash = auth::hash_password(&req.new_password, services.limits.bcrypt_cost).await?;
        services.repo.update_password(reset.user_id, hash).await?;
        services.repo.mark_reset_code_used(&reset.code).await?;
        let dropped = services.repo.delete_sessions_for_user(reset.user_id).await?;

        tracing::info!(user_id = reset.user_id, sessions = dropped, "password reset");
        Outcome::ok_with(
            "Password reset successful",
            &Notice {
                message: "Your password has been reset. Please login with your new password."
                    .to_string(),
            },
        )
    }
}
