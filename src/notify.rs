//! Out-of-band delivery of password reset codes.

use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_reset_code(&self, email: &str, code: &str) -> anyhow::Result<()>;

    /// A disabled notifier's failures never block the reset flow.
    fn is_enabled(&self) -> bool;
}

/// Writes codes to the log instead of mailing them. Development only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_reset_code(&self, email: &str, code: &str) -> anyhow::Result<()> {
        tracing::warn!(%email, %code, "mail delivery not configured, logging reset code instead");
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}
