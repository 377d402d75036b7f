use std::collections::HashMap;
use std::sync::Arc;

use crate::auth;
use crate::context::{ConnectionContext, PendingTransfer};
use crate::error::ServiceError;
use crate::handler::{self, Handler, Transition};
use crate::protocol::{Operation, Request, Response, StatusCode};
use crate::service::Services;

/// Routes a decoded request to its handler.
pub struct Dispatcher {
    handlers: HashMap<Operation, Arc<dyn Handler>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: handler::all().into_iter().collect(),
        }
    }

    /// Produce the response for one request. A successful transfer begin
    /// leaves its pending transfer on `ctx` for the connection to drive.
    pub async fn dispatch(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Response {
        let op = request.operation;
        let response = match self.route(services, request, ctx).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(peer = %ctx.peer(), %op, error = %e, "request refused");
                e.into_response()
            }
        };
        response.correlated(&request.correlation_id)
    }

    async fn route(
        &self,
        services: &Services,
        request: &Request,
        ctx: &mut ConnectionContext,
    ) -> Result<Response, ServiceError> {
        let op = request.operation;
        let handler = match self.handlers.get(&op) {
            Some(handler) => handler,
            // READY only means something inside a download handshake.
            None if op == Operation::Ready => {
                return Err(ServiceError::validation("no download is pending"))
            }
            None => return Err(ServiceError::validation(format!("Unsupported operation: {}", op))),
        };

        if op.requires_auth() {
            auth::authenticate(services.repo.as_ref(), request, ctx).await?;
        }

        let outcome = handler.handle(services, request, ctx).await?;
        let pending = match outcome.transition {
            Transition::None => None,
            Transition::ReceiveUpload(upload) => Some(PendingTransfer::Upload(upload)),
            Transition::SendDownload(download) => Some(PendingTransfer::Download(download)),
        };

        if let Some(pending) = pending {
            if outcome.response.success && !ctx.set_pending(pending) {
                tracing::error!(peer = %ctx.peer(), %op, "transfer begun while another is pending");
                return Ok(Response::error(StatusCode::ServerError, "An internal error occurred"));
            }
        }
        Ok(outcome.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::Fixture;
    use serde_json::json;

    async fn login(fx: &Fixture, dispatcher: &Dispatcher, email: &str) -> String {
        let mut ctx = fx.ctx();
        let register = Request::new(Operation::Register)
            .with_data(&json!({ "email": email, "password": "password1", "displayName": "Tester" }))
            .unwrap();
        assert!(dispatcher.dispatch(&fx.services, &register, &mut ctx).await.success);

        let login = Request::new(Operation::Login)
            .with_data(&json!({ "email": email, "password": "password1" }))
            .unwrap();
        let resp = dispatcher.dispatch(&fx.services, &login, &mut ctx).await;
        resp.payload::<crate::protocol::payload::LoginInfo>().unwrap().token
    }

    #[tokio::test]
    async fn test_ping_needs_no_session_and_echoes_correlation() {
        let fx = Fixture::new().await;
        let dispatcher = Dispatcher::new();
        let mut ctx = fx.ctx();

        let req = Request::new(Operation::Ping).with_correlation_id("abc-1");
        let resp = dispatcher.dispatch(&fx.services, &req, &mut ctx).await;
        assert!(resp.success);
        assert_eq!(resp.message, "PONG");
        assert_eq!(resp.correlation_id.as_deref(), Some("abc-1"));
    }

    #[tokio::test]
    async fn test_protected_operations_need_a_session() {
        let fx = Fixture::new().await;
        let dispatcher = Dispatcher::new();
        let mut ctx = fx.ctx();

        let resp = dispatcher
            .dispatch(&fx.services, &Request::new(Operation::ListMyFiles), &mut ctx)
            .await;
        assert_eq!(resp.status_code, StatusCode::Unauthorized);

        let req = Request::new(Operation::ListMyFiles).with_token("bogus");
        let resp = dispatcher.dispatch(&fx.services, &req, &mut ctx).await;
        assert_eq!(resp.status_code, StatusCode::Unauthorized);
        assert_eq!(resp.message, "Invalid or expired session");
    }

    #[tokio::test]
    async fn test_token_from_another_connection_authenticates() {
        let fx = Fixture::new().await;
        let dispatcher = Dispatcher::new();
        let token = login(&fx, &dispatcher, "tok@example.com").await;

        let mut fresh = fx.ctx();
        let req = Request::new(Operation::ListMyFiles).with_token(token);
        let resp = dispatcher.dispatch(&fx.services, &req, &mut fresh).await;
        assert!(resp.success, "{}", resp.message);
        assert!(fresh.is_authenticated());
    }

    #[tokio::test]
    async fn test_stray_ready_is_refused() {
        let fx = Fixture::new().await;
        let dispatcher = Dispatcher::new();
        let mut ctx = fx.ctx();

        let resp = dispatcher
            .dispatch(&fx.services, &Request::new(Operation::Ready), &mut ctx)
            .await;
        assert_eq!(resp.status_code, StatusCode::ValidationError);
        assert_eq!(resp.message, "no download is pending");
    }

    #[tokio::test]
    async fn test_upload_begin_leaves_pending_transfer() {
        let fx = Fixture::new().await;
        let dispatcher = Dispatcher::new();
        let token = login(&fx, &dispatcher, "up@example.com").await;
        let mut ctx = fx.ctx();

        let req = Request::new(Operation::UploadBegin)
            .with_token(token)
            .with_data(&json!({ "fileName": "a.txt", "fileSize": 3, "sha256": "ab".repeat(32) }))
            .unwrap();
        let resp = dispatcher.dispatch(&fx.services, &req, &mut ctx).await;
        assert!(resp.success);
        assert!(matches!(ctx.take_pending(), Some(PendingTransfer::Upload(_))));
    }

    #[tokio::test]
    async fn test_every_operation_but_ready_is_routed() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.handlers.len(), 18);
        assert!(!dispatcher.handlers.contains_key(&Operation::Ready));
    }
}
