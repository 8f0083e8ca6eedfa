//! Transport / protocol boundary.
//!
//! # Responsibilities
//! - [`Transport`]: what a protocol may ask of the socket (write, close, pause/resume reads)
//! - [`Protocol`]: the callbacks a socket driver delivers to whoever owns the connection
//!
//! # Design Decisions
//! - Both traits are object-safe and `Send + Sync`; drivers hold `Arc<dyn Protocol>`
//! - Callbacks are synchronous; protocols spawn tasks for anything that needs to await
//! - The protocol slot is replaceable so an upgrade can hand the socket to another protocol

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// Operations a protocol can perform on its underlying connection.
pub trait Transport: Send + Sync + 'static {
    /// Queue bytes for writing. Never blocks; pressure is reported via
    /// [`Protocol::on_write_blocked`].
    fn write(&self, data: Bytes);

    /// Flush queued bytes, then close the connection.
    fn close(&self);

    /// Stop delivering [`Protocol::on_data`] until resumed.
    fn pause_reading(&self);

    fn resume_reading(&self);

    /// True once [`Transport::close`] was called or the peer went away.
    fn is_closing(&self) -> bool;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Whether the bytes are carried over TLS (selects the `https` scheme).
    fn is_tls(&self) -> bool {
        false
    }

    /// Route subsequent callbacks to a different protocol.
    fn set_protocol(&self, protocol: Arc<dyn Protocol>);
}

/// Callbacks delivered by a transport driver.
pub trait Protocol: Send + Sync + 'static {
    fn on_connect(&self);

    fn on_data(&self, data: &[u8]);

    /// The peer closed its sending side.
    fn on_eof(&self);

    /// The connection is gone. Called exactly once, last.
    fn on_close(&self);

    /// Buffered output dropped below the low-water mark.
    fn on_writable(&self);

    /// Buffered output rose above the high-water mark.
    fn on_write_blocked(&self);

    /// Ask the connection to finish what it is doing and close.
    fn shutdown(&self) {}
}
