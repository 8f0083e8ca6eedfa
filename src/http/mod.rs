//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Transport bytes
//!     → engine.rs (H1Connection, one per socket)
//!     → wire.rs (incremental HTTP/1.1 parser and serializer)
//!     → cycle.rs (one request/response exchange)
//!     → app.rs (Application called with Scope, receive, send)
//!     → cycle.rs (response events framed and written back)
//!
//! flow.rs: read/write backpressure shared by the engine and its exchanges
//! upgrade.rs: hand-off of the socket to another protocol
//! server.rs: accept loop and graceful shutdown
//! ```

pub mod app;
pub mod cycle;
pub mod engine;
pub mod flow;
pub mod server;
pub mod upgrade;
pub mod wire;

pub use app::{Application, ReceiveEvent, ResponseEvent, Scheme, Scope};
pub use cycle::{RequestReceiver, ResponseSender};
pub use engine::{EngineContext, H1Connection};
pub use server::HttpServer;
pub use upgrade::UpgradeHandler;
