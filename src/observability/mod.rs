//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! engine, exchanges, server:
//!     → logging.rs (structured log events, access log)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout via tracing-subscriber
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```

pub mod logging;
pub mod metrics;
