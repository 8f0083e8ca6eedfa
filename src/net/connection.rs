//! Connection identity and state shared by every connection of a server.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Registry of live connections, so shutdown can reach each of them
//! - Count running exchanges (tasks) for the concurrency limit
//! - Hold the default response headers, with a date refreshed once per second
//!
//! # Design Decisions
//! - Built once at startup and passed around as `Arc<ServerState>`; no globals
//! - Default headers are an `ArcSwap` snapshot: readers never block the refresher

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::HttpConfig;
use crate::http::wire::Header;
use crate::net::transport::Protocol;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Value of the `server` default header.
pub const SERVER_NAME: &str = "h1-engine";

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which default headers to emit.
#[derive(Debug, Clone)]
struct DefaultHeaderSettings {
    server: bool,
    date: bool,
    extra: Vec<Header>,
}

/// State shared by all connections of one server.
pub struct ServerState {
    connections: DashMap<ConnectionId, Arc<dyn Protocol>>,
    tasks: Arc<AtomicUsize>,
    total_requests: AtomicU64,
    header_settings: DefaultHeaderSettings,
    default_headers: ArcSwap<Vec<Header>>,
}

impl ServerState {
    pub fn new(config: &HttpConfig) -> Self {
        let header_settings = DefaultHeaderSettings {
            server: config.server_header,
            date: config.date_header,
            extra: config
                .default_headers
                .iter()
                .map(|(name, value)| {
                    (
                        Bytes::from(name.to_ascii_lowercase()),
                        Bytes::from(value.clone()),
                    )
                })
                .collect(),
        };
        let state = Self {
            connections: DashMap::new(),
            tasks: Arc::new(AtomicUsize::new(0)),
            total_requests: AtomicU64::new(0),
            header_settings,
            default_headers: ArcSwap::from_pointee(Vec::new()),
        };
        state.refresh_date();
        state
    }

    /// Track a live connection.
    pub fn register(&self, id: ConnectionId, protocol: Arc<dyn Protocol>) {
        self.connections.insert(id, protocol);
        metrics::set_active_connections(self.connections.len());
    }

    pub fn deregister(&self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            metrics::set_active_connections(self.connections.len());
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Record a running exchange. The count drops when the guard is dropped.
    pub fn track_task(&self) -> TaskGuard {
        self.tasks.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            tasks: Arc::clone(&self.tasks),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.load(Ordering::SeqCst)
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Current default response headers.
    pub fn default_headers(&self) -> Arc<Vec<Header>> {
        self.default_headers.load_full()
    }

    /// Rebuild the default headers with the current time in `date`.
    pub fn refresh_date(&self) {
        let settings = &self.header_settings;
        let mut headers = Vec::with_capacity(settings.extra.len() + 2);
        if settings.server {
            headers.push((Bytes::from_static(b"server"), Bytes::from_static(SERVER_NAME.as_bytes())));
        }
        if settings.date {
            headers.push((
                Bytes::from_static(b"date"),
                Bytes::from(httpdate::fmt_http_date(SystemTime::now())),
            ));
        }
        headers.extend(settings.extra.iter().cloned());
        self.default_headers.store(Arc::new(headers));
    }

    /// Ask every live connection to finish its current exchange and close.
    pub fn shutdown_all(&self) {
        let protocols: Vec<Arc<dyn Protocol>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        tracing::info!(connections = protocols.len(), "Shutting down connections");
        for protocol in protocols {
            protocol.shutdown();
        }
    }

    /// Wait until no connection or exchange is left, or `timeout` elapses.
    ///
    /// Returns `true` if everything drained in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            while self.connection_count() > 0 || self.task_count() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("connections", &self.connection_count())
            .field("tasks", &self.task_count())
            .field("total_requests", &self.total_requests())
            .finish()
    }
}

/// Guard for one running exchange.
/// Decrements the task count when dropped.
#[derive(Debug)]
pub struct TaskGuard {
    tasks: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tasks.fetch_sub(1, Ordering::SeqCst);
    }
}
