//! Per-connection HTTP/1.1 protocol engine.
//!
//! # Responsibilities
//! - Receive transport callbacks and feed bytes into the [`H1Parser`]
//! - Create one exchange per request and run the application for it
//! - Pause reads on pipelining and on unread request body past the high-water mark
//! - Refuse requests past the concurrency limit with a fixed 503
//! - Hand the socket over to an [`UpgradeHandler`] on a supported upgrade
//! - Close idle keep-alive connections after a timeout
//!
//! # States
//! ```text
//! idle ──request──▶ active ──response complete──▶ keep-alive wait ──bytes──▶ active …
//!                     │                               │
//!                     └─pipelined bytes: Paused───────┘
//! any ──parse error / timeout / close──▶ closed
//! ```
//!
//! # Design Decisions
//! - All per-connection state sits behind one mutex, never held across an await
//! - Transport writes happen under that mutex so response bytes keep their order
//! - Only one exchange is active at a time; the next request waits in the parser buffer

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::HttpConfig;
use crate::http::app::{Application, Scheme, Scope};
use crate::http::cycle::{self, BodyFrame, CycleShared};
use crate::http::flow::FlowControl;
use crate::http::upgrade::UpgradeHandler;
use crate::http::wire::{has_token, H1Parser, Outbound, PeerState, RequestHead, WireEvent};
use crate::net::connection::{ConnectionId, ServerState};
use crate::net::transport::{Protocol, Transport};
use crate::observability::metrics;

const UNSUPPORTED_UPGRADE: &[u8] = b"Unsupported upgrade request.";

/// Everything a connection shares with the rest of the server.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<HttpConfig>,
    pub server: Arc<ServerState>,
    pub app: Arc<dyn Application>,
    pub upgrade: Option<Arc<dyn UpgradeHandler>>,
}

/// The exchange currently running on a connection.
pub(crate) struct ActiveCycle {
    pub shared: Arc<CycleShared>,
    /// Dropped when the exchange ends, which wakes any pending `receive`.
    pub body_tx: Option<mpsc::UnboundedSender<BodyFrame>>,
}

impl ActiveCycle {
    fn close_body(&mut self) {
        self.body_tx = None;
    }
}

pub(crate) struct EngineState {
    pub parser: H1Parser,
    pub cycle: Option<ActiveCycle>,
    keep_alive_timer: Option<JoinHandle<()>>,
    /// Set once the socket was handed to an upgrade handler.
    detached: bool,
}

/// A pending upgrade, completed after the connection lock is released.
pub(crate) struct Handoff {
    handler: Arc<dyn UpgradeHandler>,
    raw: Bytes,
}

/// HTTP/1.1 protocol for a single connection.
pub struct H1Connection {
    me: Weak<H1Connection>,
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    flow: FlowControl,
    ctx: EngineContext,
    client: Option<SocketAddr>,
    server: Option<SocketAddr>,
    scheme: Scheme,
    state: Mutex<EngineState>,
}

impl std::fmt::Debug for H1Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Connection")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl H1Connection {
    pub fn new(transport: Arc<dyn Transport>, ctx: EngineContext) -> Arc<Self> {
        let parser = H1Parser::new(ctx.config.max_head_size);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: ConnectionId::new(),
            flow: FlowControl::new(transport.clone()),
            client: transport.peer_addr(),
            server: transport.local_addr(),
            scheme: if transport.is_tls() { Scheme::Https } else { Scheme::Http },
            transport,
            ctx,
            state: Mutex::new(EngineState {
                parser,
                cycle: None,
                keep_alive_timer: None,
                detached: false,
            }),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub(crate) fn config(&self) -> &HttpConfig {
        &self.ctx.config
    }

    pub(crate) fn server_state(&self) -> &ServerState {
        &self.ctx.server
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_keep_alive(state: &mut EngineState) {
        if let Some(timer) = state.keep_alive_timer.take() {
            timer.abort();
        }
    }

    /// Pull events out of the parser until it needs more bytes or must wait.
    fn handle_events(&self, state: &mut EngineState) -> Option<Handoff> {
        loop {
            let event = match state.parser.next_event() {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(
                        connection_id = %self.id,
                        peer_addr = ?self.client,
                        error = %err,
                        "Invalid HTTP request received."
                    );
                    metrics::record_invalid_request();
                    self.transport.close();
                    return None;
                }
            };

            match event {
                WireEvent::NeedMoreData => return None,
                WireEvent::Paused => {
                    self.flow.pause_reading();
                    return None;
                }
                WireEvent::ConnectionClosed => {
                    if let Some(active) = state.cycle.as_mut() {
                        active.shared.mark_disconnected();
                        active.close_body();
                    }
                    if !self.transport.is_closing() {
                        self.transport.close();
                    }
                    return None;
                }
                WireEvent::RequestLine(head) => {
                    if has_token(&head.headers, b"connection", b"upgrade") {
                        return self.handle_upgrade(state, &head);
                    }
                    self.dispatch(state, &head);
                }
                WireEvent::BodyChunk(data) => {
                    if !matches!(state.parser.our_state(), PeerState::SendResponse | PeerState::SendBody) {
                        continue;
                    }
                    let Some(active) = state.cycle.as_ref() else {
                        continue;
                    };
                    let unread = active.shared.add_unread(data.len());
                    if let Some(tx) = &active.body_tx {
                        let _ = tx.send(BodyFrame::Data(data));
                    }
                    if unread > self.ctx.config.max_buffered_body {
                        self.flow.pause_reading();
                    }
                }
                WireEvent::MessageComplete => match state.parser.our_state() {
                    PeerState::Done => {
                        // Response already went out; the leftover body was discarded.
                        self.flow.resume_reading();
                        if state.parser.start_next_cycle().is_err() {
                            return None;
                        }
                        if state.cycle.is_none() && !state.detached && !self.transport.is_closing() {
                            self.arm_keep_alive(state);
                        }
                    }
                    PeerState::SendResponse | PeerState::SendBody => {
                        if let Some(tx) = state.cycle.as_ref().and_then(|a| a.body_tx.as_ref()) {
                            let _ = tx.send(BodyFrame::End);
                        }
                    }
                    _ => {}
                },
            }
        }
    }

    /// Start an exchange for a request, or a 503 when over the limit.
    fn dispatch(&self, state: &mut EngineState, head: &RequestHead) {
        let Some(conn) = self.me.upgrade() else {
            return;
        };
        Self::cancel_keep_alive(state);
        let scope = Scope::from_head(
            head,
            self.scheme,
            &self.ctx.config.root_path,
            self.client,
            self.server,
        );

        let server = &self.ctx.server;
        let over_limit = self.ctx.config.limit_concurrency.is_some_and(|limit| {
            server.connection_count() > limit || server.task_count() >= limit
        });
        let app: Arc<dyn Application> = if over_limit {
            tracing::warn!(
                connection_id = %self.id,
                connections = server.connection_count(),
                tasks = server.task_count(),
                "Exceeded concurrency limit."
            );
            metrics::record_concurrency_rejection();
            Arc::new(cycle::service_unavailable)
        } else {
            self.ctx.app.clone()
        };

        let new = cycle::new_cycle(
            conn,
            &scope,
            state.parser.waiting_for_continue(),
            server.track_task(),
        );
        state.cycle = Some(ActiveCycle {
            shared: new.shared,
            body_tx: Some(new.body_tx),
        });
        metrics::record_request(&scope.method);
        tracing::trace!(connection_id = %self.id, method = %scope.method, path = %scope.path, "Dispatching request");
        tokio::spawn(cycle::run_app(app, scope, new.receiver, new.sender));
    }

    fn handle_upgrade(&self, state: &mut EngineState, head: &RequestHead) -> Option<Handoff> {
        let requested = head
            .header(b"upgrade")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();
        let handler = self
            .ctx
            .upgrade
            .as_ref()
            .filter(|h| h.protocol().as_bytes().eq_ignore_ascii_case(&requested));

        let Some(handler) = handler else {
            tracing::warn!(
                connection_id = %self.id,
                upgrade = %String::from_utf8_lossy(&requested),
                "Unsupported upgrade request."
            );
            metrics::record_upgrade("unsupported");
            self.reject_upgrade(&mut state.parser);
            return None;
        };

        tracing::debug!(connection_id = %self.id, protocol = handler.protocol(), "Upgrading connection");
        metrics::record_upgrade("accepted");
        self.ctx.server.deregister(self.id);
        state.detached = true;
        Self::cancel_keep_alive(state);

        let mut raw = head.to_bytes();
        raw.extend_from_slice(&state.parser.take_buffered());
        Some(Handoff {
            handler: handler.clone(),
            raw: raw.freeze(),
        })
    }

    fn reject_upgrade(&self, parser: &mut H1Parser) {
        let headers = vec![
            (Bytes::from_static(b"content-type"), Bytes::from_static(b"text/plain; charset=utf-8")),
            (Bytes::from_static(b"connection"), Bytes::from_static(b"close")),
            (
                Bytes::from_static(b"content-length"),
                Bytes::from(UNSUPPORTED_UPGRADE.len().to_string()),
            ),
        ];
        let events = [
            Outbound::Response { status: 400, headers },
            Outbound::Data(Bytes::from_static(UNSUPPORTED_UPGRADE)),
            Outbound::EndOfMessage,
        ];
        for event in events {
            match parser.serialize(event) {
                Ok(bytes) => self.transport.write(bytes),
                Err(err) => {
                    tracing::debug!(connection_id = %self.id, error = %err, "Could not write upgrade rejection");
                    break;
                }
            }
        }
        self.transport.close();
    }

    /// Give the socket to the upgrade handler. Must run without the state lock held.
    pub(crate) fn complete_upgrade(&self, handoff: Handoff) {
        let protocol = handoff
            .handler
            .upgrade(self.transport.clone(), self.ctx.server.clone());
        protocol.on_connect();
        protocol.on_data(&handoff.raw);
        self.transport.set_protocol(protocol);
    }

    /// Called by the exchange once its final body event was written.
    pub(crate) fn on_response_complete(&self, state: &mut EngineState) -> Option<Handoff> {
        self.ctx.server.record_request();
        if self.transport.is_closing() {
            return None;
        }

        state.cycle = None;
        self.flow.resume_reading();

        let mut handoff = None;
        if state.parser.our_state() == PeerState::Done && state.parser.their_state() == PeerState::Done {
            if state.parser.start_next_cycle().is_ok() {
                handoff = self.handle_events(state);
            }
        }

        if state.cycle.is_none() && !state.detached && !self.transport.is_closing() {
            self.arm_keep_alive(state);
        }
        handoff
    }

    fn arm_keep_alive(&self, state: &mut EngineState) {
        Self::cancel_keep_alive(state);
        let me = self.me.clone();
        let timeout = Duration::from_secs(self.ctx.config.keep_alive_timeout_secs);
        state.keep_alive_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(conn) = me.upgrade() {
                conn.on_keep_alive_timeout();
            }
        }));
    }

    fn on_keep_alive_timeout(&self) {
        let mut state = self.lock_state();
        state.keep_alive_timer = None;
        if self.transport.is_closing() || state.cycle.is_some() || state.detached {
            return;
        }
        tracing::debug!(connection_id = %self.id, "Keep-alive timeout, closing connection");
        let _ = state.parser.serialize(Outbound::ConnectionClosed);
        self.transport.close();
    }

    fn run_events(&self, feed: impl FnOnce(&mut H1Parser)) {
        let handoff = {
            let mut state = self.lock_state();
            if state.detached {
                return;
            }
            Self::cancel_keep_alive(&mut state);
            feed(&mut state.parser);
            self.handle_events(&mut state)
        };
        if let Some(handoff) = handoff {
            self.complete_upgrade(handoff);
        }
    }
}

impl Protocol for H1Connection {
    fn on_connect(&self) {
        if let Some(me) = self.me.upgrade() {
            self.ctx.server.register(self.id, me);
        }
        tracing::debug!(connection_id = %self.id, peer_addr = ?self.client, "Connected");
    }

    fn on_data(&self, data: &[u8]) {
        self.run_events(|parser| parser.feed(data));
    }

    fn on_eof(&self) {
        self.run_events(H1Parser::feed_eof);
    }

    fn on_close(&self) {
        self.ctx.server.deregister(self.id);
        tracing::debug!(connection_id = %self.id, peer_addr = ?self.client, "Disconnected");

        {
            let mut state = self.lock_state();
            Self::cancel_keep_alive(&mut state);
            if let Some(mut active) = state.cycle.take() {
                active.shared.mark_disconnected();
                active.close_body();
            }
            if state.parser.our_state() != PeerState::Error {
                let _ = state.parser.serialize(Outbound::ConnectionClosed);
            }
        }
        self.flow.resume_writing();
    }

    fn on_writable(&self) {
        self.flow.resume_writing();
    }

    fn on_write_blocked(&self) {
        self.flow.pause_writing();
    }

    /// Close now if idle, otherwise close once the current exchange completes.
    fn shutdown(&self) {
        let mut state = self.lock_state();
        match state.cycle.as_ref() {
            Some(active) if !active.shared.is_complete() => active.shared.disable_keep_alive(),
            _ => {
                Self::cancel_keep_alive(&mut state);
                let _ = state.parser.serialize(Outbound::ConnectionClosed);
                self.transport.close();
            }
        }
    }
}
