//! Handing a connection over to another wire protocol.
//!
//! When a request carries `Connection: upgrade` and an `Upgrade` value that
//! matches [`UpgradeHandler::protocol`], the HTTP/1.1 engine stops processing
//! the socket. The handler's protocol then receives `on_connect` and one
//! `on_data` call with the re-encoded request head followed by any bytes that
//! were already buffered behind it.

use std::sync::Arc;

use crate::net::connection::ServerState;
use crate::net::transport::{Protocol, Transport};

/// Factory for the protocol that takes over an upgraded connection.
pub trait UpgradeHandler: Send + Sync + 'static {
    /// Upgrade token this handler accepts (compared case-insensitively), e.g. `"websocket"`.
    fn protocol(&self) -> &str;

    /// Build the protocol that will own `transport` from now on.
    fn upgrade(&self, transport: Arc<dyn Transport>, server: Arc<ServerState>) -> Arc<dyn Protocol>;
}
