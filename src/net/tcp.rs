//! Tokio `TcpStream` driver implementing [`Transport`].
//!
//! # Data Flow
//! ```text
//! socket read half ──read loop (honours pause)──▶ Protocol::on_data
//! Transport::write ──mpsc──▶ writer task ──▶ socket write half
//!                     │
//!                     └─ buffered > high water ─▶ Protocol::on_write_blocked
//!                        buffered <= low water ─▶ Protocol::on_writable
//! ```
//!
//! # Design Decisions
//! - `write` never blocks: bytes are queued and accounted; pressure is reported
//!   back to the protocol instead
//! - `close` flushes everything queued before shutting the socket down
//! - The protocol slot is swappable so upgrades can take over mid-stream

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::config::TransportConfig;
use crate::net::transport::{Protocol, Transport};

enum WriteOp {
    Data(Bytes),
    Close,
}

/// Why the read loop stopped.
enum ReadEnd {
    Eof,
    Closed,
    Error(std::io::Error),
}

/// A TCP connection driven by two tokio tasks.
pub struct TcpTransport {
    writes: mpsc::UnboundedSender<WriteOp>,
    closing: AtomicBool,
    closed: watch::Sender<bool>,
    read_paused: watch::Sender<bool>,
    buffered: AtomicUsize,
    write_blocked: AtomicBool,
    high_water: usize,
    low_water: usize,
    protocol: Mutex<Option<Arc<dyn Protocol>>>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl TcpTransport {
    fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.protocol
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.protocol
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn mark_closed(&self) {
        self.closing.store(true, Ordering::Release);
        self.closed.send_replace(true);
    }

    async fn read_loop(&self, reader: &mut OwnedReadHalf, buffer_size: usize) -> ReadEnd {
        let mut buf = vec![0u8; buffer_size.max(1)];
        let mut paused = self.read_paused.subscribe();
        let mut closed = self.closed.subscribe();
        loop {
            let is_paused = *paused.borrow();
            if is_paused {
                tokio::select! {
                    _ = until_set(&mut closed) => return ReadEnd::Closed,
                    resumed = until_cleared(&mut paused) => if !resumed {
                        return ReadEnd::Closed;
                    },
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = until_set(&mut closed) => return ReadEnd::Closed,
                _ = until_set(&mut paused) => continue,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return ReadEnd::Eof,
                    Ok(n) => {
                        if let Some(protocol) = self.protocol() {
                            protocol.on_data(&buf[..n]);
                        }
                    }
                    Err(err) => return ReadEnd::Error(err),
                },
            }
        }
    }
}

/// Wait until the flag is `true`; `false` if the sender is gone.
async fn until_set(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|v| *v).await.is_ok()
}

/// Wait until the flag is `false`; `false` if the sender is gone.
async fn until_cleared(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|v| !*v).await.is_ok()
}

async fn write_loop(
    transport: Arc<TcpTransport>,
    mut writer: OwnedWriteHalf,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Data(data) => {
                if let Err(err) = writer.write_all(&data).await {
                    tracing::debug!(peer_addr = ?transport.peer, error = %err, "Write failed");
                    break;
                }
                let remaining = transport.buffered.fetch_sub(data.len(), Ordering::AcqRel) - data.len();
                if remaining <= transport.low_water && transport.write_blocked.swap(false, Ordering::AcqRel) {
                    if let Some(protocol) = transport.protocol() {
                        protocol.on_writable();
                    }
                }
            }
            WriteOp::Close => break,
        }
    }
    let _ = writer.shutdown().await;
    transport.mark_closed();
}

impl Transport for TcpTransport {
    fn write(&self, data: Bytes) {
        if data.is_empty() || self.closing.load(Ordering::Acquire) {
            return;
        }
        let len = data.len();
        let buffered = self.buffered.fetch_add(len, Ordering::AcqRel) + len;
        if self.writes.send(WriteOp::Data(data)).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return;
        }
        if buffered > self.high_water && !self.write_blocked.swap(true, Ordering::AcqRel) {
            if let Some(protocol) = self.protocol() {
                protocol.on_write_blocked();
            }
        }
    }

    fn close(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            let _ = self.writes.send(WriteOp::Close);
        }
    }

    fn pause_reading(&self) {
        self.read_paused.send_replace(true);
    }

    fn resume_reading(&self) {
        self.read_paused.send_replace(false);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn set_protocol(&self, protocol: Arc<dyn Protocol>) {
        *self.protocol.lock().unwrap_or_else(PoisonError::into_inner) = Some(protocol);
    }
}

/// Drive `stream` until it closes, delivering callbacks to the protocol built
/// by `make_protocol`.
pub async fn serve_stream<F>(stream: TcpStream, config: &TransportConfig, make_protocol: F)
where
    F: FnOnce(Arc<dyn Transport>) -> Arc<dyn Protocol>,
{
    let peer = stream.peer_addr().ok();
    let local = stream.local_addr().ok();
    if let Err(err) = stream.set_nodelay(true) {
        tracing::trace!(peer_addr = ?peer, error = %err, "Could not set TCP_NODELAY");
    }
    let (mut reader, writer) = stream.into_split();

    let (writes, ops) = mpsc::unbounded_channel();
    let (closed, _) = watch::channel(false);
    let (read_paused, _) = watch::channel(false);
    let transport = Arc::new(TcpTransport {
        writes,
        closing: AtomicBool::new(false),
        closed,
        read_paused,
        buffered: AtomicUsize::new(0),
        write_blocked: AtomicBool::new(false),
        high_water: config.write_high_water,
        low_water: config.write_low_water,
        protocol: Mutex::new(None),
        peer,
        local,
    });

    let protocol = make_protocol(transport.clone());
    transport.set_protocol(protocol.clone());
    let writer_task = tokio::spawn(write_loop(transport.clone(), writer, ops));
    protocol.on_connect();
    drop(protocol);

    match transport.read_loop(&mut reader, config.read_buffer_size).await {
        ReadEnd::Eof => {
            if let Some(protocol) = transport.protocol() {
                protocol.on_eof();
            }
        }
        ReadEnd::Error(err) => {
            tracing::debug!(peer_addr = ?peer, error = %err, "Read failed");
        }
        ReadEnd::Closed => {}
    }
    transport.close();

    if let Err(err) = writer_task.await {
        tracing::warn!(peer_addr = ?peer, error = %err, "Writer task failed");
    }
    transport.mark_closed();
    if let Some(protocol) = transport.take_protocol() {
        protocol.on_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Echoes every chunk back and closes on the byte `q`.
    struct Echo {
        transport: Arc<dyn Transport>,
        events: Mutex<Vec<&'static str>>,
    }

    impl Protocol for Echo {
        fn on_connect(&self) {
            self.events.lock().unwrap().push("connect");
        }
        fn on_data(&self, data: &[u8]) {
            if data.contains(&b'q') {
                self.transport.close();
            } else {
                self.transport.write(Bytes::copy_from_slice(data));
            }
        }
        fn on_eof(&self) {
            self.events.lock().unwrap().push("eof");
        }
        fn on_close(&self) {
            self.events.lock().unwrap().push("close");
        }
        fn on_writable(&self) {}
        fn on_write_blocked(&self) {}
    }

    async fn spawn_echo() -> (SocketAddr, tokio::sync::oneshot::Receiver<Arc<Echo>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut echo = None;
            serve_stream(stream, &TransportConfig::default(), |transport| {
                let protocol = Arc::new(Echo {
                    transport,
                    events: Mutex::new(Vec::new()),
                });
                echo = Some(protocol.clone());
                protocol as Arc<dyn Protocol>
            })
            .await;
            let _ = tx.send(echo.unwrap());
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn echoes_and_reports_eof() {
        let (addr, done) = spawn_echo().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client.shutdown().await.unwrap();
        let echo = tokio::time::timeout(Duration::from_secs(2), done).await.unwrap().unwrap();
        assert_eq!(*echo.events.lock().unwrap(), vec!["connect", "eof", "close"]);
    }

    #[tokio::test]
    async fn close_flushes_then_ends_stream() {
        let (addr, done) = spawn_echo().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        client.write_all(b"q").await.unwrap();

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        let echo = tokio::time::timeout(Duration::from_secs(2), done).await.unwrap().unwrap();
        assert_eq!(*echo.events.lock().unwrap(), vec!["connect", "close"]);
    }
}
