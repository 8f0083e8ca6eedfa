//! Crate-level error types.
//!
//! Errors specific to one subsystem live next to it ([`WireError`] in the
//! parser, [`ConfigError`] in the loader) and are re-exported here.

use thiserror::Error;

pub use crate::config::loader::ConfigError;
pub use crate::http::wire::WireError;

/// Error type returned by applications.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// Contract violations on the application side of an exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Events were sent out of order (body before start, or a second start).
    #[error("expected '{expected}' message, but got '{got}'")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    /// A message was sent after the final body event.
    #[error("unexpected message after response completed")]
    ResponseAlreadyComplete,
    /// The serializer rejected the event.
    #[error(transparent)]
    Protocol(#[from] WireError),
}

/// Errors from binding or running the server.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
