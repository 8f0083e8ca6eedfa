//! HTTP/1.1 protocol engine.
//!
//! Turns a byte stream into request/response exchanges with an application,
//! one connection at a time.

// Core subsystems
pub mod config;
pub mod error;
pub mod http;
pub mod net;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ServerConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
