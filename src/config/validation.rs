//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, watermarks ordered, addresses parse)
//! - Reject default headers that could not be written on the wire
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::ServerConfig;
use crate::http::wire::is_token;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    let http = &config.http;
    if http.keep_alive_timeout_secs == 0 {
        errors.push(ValidationError::new("http.keep_alive_timeout_secs", "must be > 0"));
    }
    if http.limit_concurrency == Some(0) {
        errors.push(ValidationError::new("http.limit_concurrency", "must be > 0 when set"));
    }
    if http.max_buffered_body == 0 {
        errors.push(ValidationError::new("http.max_buffered_body", "must be > 0"));
    }
    if http.max_head_size == 0 {
        errors.push(ValidationError::new("http.max_head_size", "must be > 0"));
    }
    if !http.root_path.is_empty() && !http.root_path.starts_with('/') {
        errors.push(ValidationError::new("http.root_path", "must be empty or start with '/'"));
    }
    for (name, value) in &http.default_headers {
        if !is_token(name.as_bytes()) {
            errors.push(ValidationError::new(
                "http.default_headers",
                format!("'{name}' is not a valid header name"),
            ));
        }
        if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
            errors.push(ValidationError::new(
                "http.default_headers",
                format!("value of '{name}' contains a line break"),
            ));
        }
    }

    let transport = &config.transport;
    if transport.write_low_water >= transport.write_high_water {
        errors.push(ValidationError::new(
            "transport.write_low_water",
            "must be lower than write_high_water",
        ));
    }
    if transport.read_buffer_size == 0 {
        errors.push(ValidationError::new("transport.read_buffer_size", "must be > 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
