//! HTTP server setup.
//!
//! # Responsibilities
//! - Own the shared server state and the application
//! - Accept connections and drive each one with an [`H1Connection`]
//! - Keep the cached `date` header fresh
//! - Coordinate graceful shutdown with the lifecycle subsystem

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::ServerConfig;
use crate::error::ServeError;
use crate::http::app::Application;
use crate::http::engine::{EngineContext, H1Connection};
use crate::http::upgrade::UpgradeHandler;
use crate::net::connection::ServerState;
use crate::net::listener::Listener;
use crate::net::tcp::serve_stream;
use crate::net::transport::Protocol;

const DATE_REFRESH: Duration = Duration::from_secs(1);
/// Pause after an accept error that is not about a single connection (EMFILE, ENOBUFS, ...).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// HTTP/1.1 server.
pub struct HttpServer {
    config: ServerConfig,
    state: Arc<ServerState>,
    app: Arc<dyn Application>,
    upgrade: Option<Arc<dyn UpgradeHandler>>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ServerConfig, app: impl Application) -> Self {
        let state = Arc::new(ServerState::new(&config.http));
        Self {
            config,
            state,
            app: Arc::new(app),
            upgrade: None,
        }
    }

    /// Hand connections that ask for `handler.protocol()` over to `handler`.
    pub fn with_upgrade_handler(mut self, handler: impl UpgradeHandler) -> Self {
        self.upgrade = Some(Arc::new(handler));
        self
    }

    /// Shared state, for inspection while the server runs.
    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until `shutdown` fires, then drain live connections.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServeError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            limit_concurrency = ?self.config.http.limit_concurrency,
            keep_alive_timeout_secs = self.config.http.keep_alive_timeout_secs,
            "HTTP server starting"
        );

        let ctx = EngineContext {
            config: Arc::new(self.config.http.clone()),
            server: self.state.clone(),
            app: self.app.clone(),
            upgrade: self.upgrade.clone(),
        };
        let transport_config = Arc::new(self.config.transport.clone());

        let ticker = {
            let state = self.state.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(DATE_REFRESH);
                loop {
                    interval.tick().await;
                    state.refresh_date();
                }
            })
        };

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => {
                    let (stream, peer_addr, permit) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!(error = %err, "Accept failed");
                            if let Some(pause) = accept_backoff(&err) {
                                tokio::time::sleep(pause).await;
                            }
                            continue;
                        }
                    };
                    tracing::trace!(peer_addr = %peer_addr, "Serving connection");

                    let ctx = ctx.clone();
                    let transport_config = transport_config.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        serve_stream(stream, &transport_config, move |transport| {
                            H1Connection::new(transport, ctx) as Arc<dyn Protocol>
                        })
                        .await;
                    });
                }
            }
        }

        tracing::info!(
            connections = self.state.connection_count(),
            tasks = self.state.task_count(),
            "Shutting down"
        );
        drop(listener);
        self.state.shutdown_all();

        let timeout = Duration::from_secs(self.config.shutdown.graceful_timeout_secs);
        if !self.state.wait_for_drain(timeout).await {
            tracing::warn!(
                connections = self.state.connection_count(),
                tasks = self.state.task_count(),
                "Graceful shutdown timed out"
            );
        }
        ticker.abort();

        tracing::info!(
            total_requests = self.state.total_requests(),
            "HTTP server stopped"
        );
        Ok(())
    }
}

/// How long to wait before accepting again after `err`.
///
/// Errors tied to one aborted connection are retried at once; anything else
/// (descriptor exhaustion, memory pressure) would fail again immediately.
fn accept_backoff(err: &ServeError) -> Option<Duration> {
    let io_err = match err {
        ServeError::Accept(io_err) | ServeError::Io(io_err) => io_err,
        ServeError::Bind { .. } => return Some(ACCEPT_BACKOFF),
    };
    match io_err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}
