//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → server stops accepting → every connection asked to finish
//!             → bounded wait for connections and exchanges to drain → exit
//! ```
//!
//! # Design Decisions
//! - Shutdown never cancels an in-flight exchange; it only stops socket reuse
//! - Shutdown has timeout: forced exit after deadline

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
