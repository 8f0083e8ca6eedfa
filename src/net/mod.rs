//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tcp.rs (socket driver implementing Transport)
//!     → transport.rs (Transport / Protocol boundary)
//!     → Hand off to the HTTP/1.1 engine
//!
//! connection.rs: state shared by all connections (registry, task count,
//! default headers)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection registered for graceful shutdown
//! - Protocols only see the Transport trait, never the socket

pub mod connection;
pub mod listener;
pub mod tcp;
pub mod transport;

pub use connection::{ConnectionId, ServerState};
pub use listener::Listener;
pub use transport::{Protocol, Transport};
