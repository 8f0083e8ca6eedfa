//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::http::wire::DEFAULT_MAX_HEAD_SIZE;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// HTTP/1.1 engine settings.
    pub http: HttpConfig,

    /// Socket driver buffer sizes.
    pub transport: TransportConfig,

    /// Graceful shutdown settings.
    pub shutdown: ShutdownConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8000").
    pub bind_address: String,

    /// Maximum concurrent connections (accept backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Per-connection HTTP/1.1 engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Close idle keep-alive connections after this many seconds.
    pub keep_alive_timeout_secs: u64,

    /// Answer 503 once this many connections or running exchanges exist.
    pub limit_concurrency: Option<usize>,

    /// Unread request body bytes after which reading is paused.
    pub max_buffered_body: usize,

    /// Largest accepted request line plus headers.
    pub max_head_size: usize,

    /// Mount point reported to applications in the scope.
    pub root_path: String,

    /// Emit one access log line per response.
    pub access_log: bool,

    /// Add `server: h1-engine` to responses.
    pub server_header: bool,

    /// Add `date` to responses.
    pub date_header: bool,

    /// Extra headers added to every response.
    pub default_headers: Vec<(String, String)>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout_secs: 5,
            limit_concurrency: None,
            max_buffered_body: 65_536,
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
            root_path: String::new(),
            access_log: true,
            server_header: true,
            date_header: true,
            default_headers: Vec::new(),
        }
    }
}

/// Socket driver settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Queued output above which the protocol is told to stop writing.
    pub write_high_water: usize,

    /// Queued output at or below which writing may resume.
    pub write_low_water: usize,

    /// Size of a single socket read.
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            write_high_water: 65_536,
            write_low_water: 16_384,
            read_buffer_size: 16_384,
        }
    }
}

/// Graceful shutdown settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long to wait for in-flight exchanges before giving up.
    pub graceful_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_secs: 30,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
