//! Read/write backpressure for a single connection.
//!
//! # Responsibilities
//! - Pause/resume reading on the transport, only on an actual state change
//! - Track write pressure reported by the transport
//! - Let senders wait (`drain`) until the transport can take more bytes
//!
//! # Design Decisions
//! - Flags are atomics so transport callbacks never contend with the engine's lock
//! - The writable gate is a `watch` channel: late subscribers see the current state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::net::transport::Transport;

/// Backpressure state for one connection.
pub struct FlowControl {
    transport: Arc<dyn Transport>,
    read_paused: AtomicBool,
    write_paused: AtomicBool,
    writable: watch::Sender<bool>,
}

impl FlowControl {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (writable, _) = watch::channel(true);
        Self {
            transport,
            read_paused: AtomicBool::new(false),
            write_paused: AtomicBool::new(false),
            writable,
        }
    }

    /// Wait until the transport can accept more output.
    pub async fn drain(&self) {
        let mut rx = self.writable.subscribe();
        // The sender lives as long as `self`, so this only fails if it was dropped.
        let _ = rx.wait_for(|writable| *writable).await;
    }

    pub fn pause_reading(&self) {
        if !self.read_paused.swap(true, Ordering::AcqRel) {
            self.transport.pause_reading();
        }
    }

    pub fn resume_reading(&self) {
        if self.read_paused.swap(false, Ordering::AcqRel) {
            self.transport.resume_reading();
        }
    }

    pub fn pause_writing(&self) {
        if !self.write_paused.swap(true, Ordering::AcqRel) {
            self.writable.send_replace(false);
        }
    }

    pub fn resume_writing(&self) {
        if self.write_paused.swap(false, Ordering::AcqRel) {
            self.writable.send_replace(true);
        }
    }

    pub fn is_read_paused(&self) -> bool {
        self.read_paused.load(Ordering::Acquire)
    }

    pub fn is_write_paused(&self) -> bool {
        self.write_paused.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for FlowControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowControl")
            .field("read_paused", &self.is_read_paused())
            .field("write_paused", &self.is_write_paused())
            .finish()
    }
}
