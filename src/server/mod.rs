//! TCP host: accept loop, connection pool, housekeeping and shutdown.

pub mod connection;
pub mod dispatcher;

use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_native_tls::TlsAcceptor;

use crate::config::{Config, Overflow};
use crate::network::idle::IdleTimeout;
use crate::network::{write_frame, AsyncStream};
use crate::protocol::{Response, StatusCode};
use crate::repository::Repository;
use crate::service::Services;
use dispatcher::Dispatcher;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub max_clients: usize,
    pub overflow: Overflow,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    pub drain_timeout: Duration,
}

impl From<&Config> for ServerOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_clients: config.max_clients,
            overflow: config.overflow,
            idle_timeout: config.idle_timeout,
            cleanup_interval: config.cleanup_interval,
            drain_timeout: config.drain_timeout,
        }
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

pub struct Server {
    services: Services,
    dispatcher: Arc<Dispatcher>,
    options: ServerOptions,
    tls: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(services: Services, options: ServerOptions) -> Self {
        Self {
            services,
            dispatcher: Arc::new(Dispatcher::new()),
            options,
            tls: None,
        }
    }

    /// Negotiate TLS on every accepted socket before any framing.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Accept connections until `shutdown` resolves, then give live
    /// connections up to the drain timeout to finish.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr()?;
        if self.tls.is_none() {
            tracing::warn!(%local, "serving plain TCP; credentials travel unencrypted");
        }
        tracing::info!(
            %local,
            max_clients = self.options.max_clients,
            overflow = ?self.options.overflow,
            idle_timeout = %humantime::format_duration(self.options.idle_timeout),
            "listening"
        );

        let slots = Arc::new(Semaphore::new(self.options.max_clients));
        let mut connections = JoinSet::new();
        let janitor = tokio::spawn(janitor(
            self.services.repo.clone(),
            self.options.cleanup_interval,
        ));

        tokio::pin!(shutdown);
        loop {
            // Queue mode holds off accepting until a slot frees up.
            let reserved = match self.options.overflow {
                Overflow::Queue => tokio::select! {
                    _ = &mut shutdown => break,
                    permit = slots.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                Overflow::Reject => None,
            };

            let (socket, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            while connections.try_join_next().is_some() {}

            let permit = match reserved {
                Some(permit) => permit,
                None => match slots.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!(%peer, "server busy, rejecting connection");
                        connections.spawn(reject(socket, self.options.idle_timeout));
                        continue;
                    }
                },
            };

            let services = self.services.clone();
            let dispatcher = self.dispatcher.clone();
            let tls = self.tls.clone();
            let idle = self.options.idle_timeout;
            connections.spawn(async move {
                handle(socket, peer, tls, services, dispatcher, idle, permit).await;
            });
        }

        janitor.abort();
        tracing::info!(live = connections.len(), "shutting down, draining connections");
        let drained = tokio::time::timeout(self.options.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "drain timeout elapsed, dropping connections"
            );
            connections.shutdown().await;
        }
        tracing::info!("server stopped");
        Ok(())
    }
}

async fn handle(
    socket: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    services: Services,
    dispatcher: Arc<Dispatcher>,
    idle: Duration,
    _permit: OwnedSemaphorePermit,
) {
    if let Err(e) = tune(&socket) {
        tracing::debug!(%peer, error = %e, "socket options not applied");
    }
    tracing::info!(%peer, "client connected");

    let stream: Box<dyn AsyncStream> = match tls {
        None => Box::new(socket),
        Some(acceptor) => match tokio::time::timeout(idle, acceptor.accept(socket)).await {
            Ok(Ok(tls_stream)) => Box::new(tls_stream),
            Ok(Err(e)) => {
                tracing::warn!(%peer, error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                tracing::warn!(%peer, "TLS handshake timed out");
                return;
            }
        },
    };

    let mut stream = IdleTimeout::new(stream, idle);
    match connection::serve(&mut stream, peer, &services, &dispatcher).await {
        Ok(()) => tracing::info!(%peer, "client disconnected"),
        Err(e) => tracing::warn!(%peer, error = %e, "connection closed"),
    }
}

/// Keepalive and no-delay on an accepted socket.
fn tune(socket: &TcpStream) -> io::Result<()> {
    socket.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(socket).set_tcp_keepalive(&keepalive)
}

async fn reject(mut socket: TcpStream, limit: Duration) {
    let busy = Response::error(StatusCode::ServerError, "server busy");
    let Ok(bytes) = busy.to_bytes() else { return };
    let _ = tokio::time::timeout(limit, write_frame(&mut socket, &bytes)).await;
}

/// Periodically drop expired sessions and reset codes.
async fn janitor(repo: Arc<dyn Repository>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match repo.purge_expired().await {
            Ok((sessions, codes)) => {
                tracing::debug!(sessions, reset_codes = codes, "purged expired credentials")
            }
            Err(e) => tracing::warn!(error = %e, "housekeeping failed"),
        }
    }
}
