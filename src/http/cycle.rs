//! One request/response exchange.
//!
//! # Responsibilities
//! - Feed request body frames to the application ([`RequestReceiver`])
//! - Turn application response events into wire bytes ([`ResponseSender`])
//! - Enforce event ordering: one start, then body events, nothing after the last one
//! - Translate application failures into a 500 or a closed connection
//!
//! # Data Flow
//! ```text
//! engine ──BodyFrame──▶ mpsc ──▶ RequestReceiver::receive ──▶ application
//! application ──ResponseEvent──▶ ResponseSender::send ──▶ H1Parser::serialize ──▶ transport
//! ```
//!
//! # Design Decisions
//! - Disconnect is the body channel closing: dropping the sender wakes every waiter
//! - The response head goes out as soon as `start` is sent; framing comes from the
//!   application's headers (chunked or close-delimited when no length is given)
//! - Locks are taken engine first, then cycle; never the other way round

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::error::{AppError, ExchangeError};
use crate::http::app::{Application, ReceiveEvent, ResponseEvent, Scope};
use crate::http::engine::H1Connection;
use crate::http::wire::{Header, Outbound, PeerState};
use crate::net::connection::TaskGuard;
use crate::observability::metrics;

const PLAIN_TEXT: &[u8] = b"text/plain; charset=utf-8";
const INTERNAL_ERROR: &str = "Internal Server Error";
const SERVICE_UNAVAILABLE: &str = "Service Unavailable";

/// Request body as delivered by the engine.
#[derive(Debug)]
pub(crate) enum BodyFrame {
    Data(Bytes),
    End,
}

/// Mutable per-exchange state.
#[derive(Debug)]
pub(crate) struct CycleState {
    pub response_started: bool,
    pub response_complete: bool,
    /// Monotonic: once set it is never cleared.
    pub disconnected: bool,
    pub keep_alive: bool,
    pub waiting_for_continue: bool,
    task: Option<TaskGuard>,
}

/// Fields of the request line needed for the access log.
#[derive(Debug)]
struct RequestSummary {
    method: String,
    path: String,
    http_version: &'static str,
    client: Option<SocketAddr>,
}

/// State shared between the engine and the two application handles.
#[derive(Debug)]
pub(crate) struct CycleShared {
    conn: Arc<H1Connection>,
    request: RequestSummary,
    state: Mutex<CycleState>,
    /// Body bytes handed to the channel but not yet received by the application.
    unread: AtomicUsize,
}

impl CycleShared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, CycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.lock().response_complete
    }

    /// Mark the client as gone unless the response already went out.
    pub(crate) fn mark_disconnected(&self) {
        let mut state = self.lock();
        if !state.response_complete {
            state.disconnected = true;
        }
    }

    pub(crate) fn disable_keep_alive(&self) {
        self.lock().keep_alive = false;
    }

    /// Account for body bytes about to be queued; returns the new unread total.
    pub(crate) fn add_unread(&self, len: usize) -> usize {
        self.unread.fetch_add(len, Ordering::AcqRel) + len
    }

    fn release_task(&self) {
        self.lock().task.take();
    }

    /// Send `100 Continue` if the client asked for it and nothing was sent yet.
    fn send_continue(&self) {
        let mut engine = self.conn.lock_state();
        let mut state = self.lock();
        if !state.waiting_for_continue {
            return;
        }
        state.waiting_for_continue = false;
        if self.conn.transport().is_closing() || !engine.parser.waiting_for_continue() {
            return;
        }
        match engine.parser.serialize(Outbound::Informational {
            status: 100,
            headers: Vec::new(),
        }) {
            Ok(bytes) => self.conn.transport().write(bytes),
            Err(err) => tracing::debug!(connection_id = %self.conn.id(), error = %err, "Could not send 100 Continue"),
        }
    }

    async fn send(self: &Arc<Self>, event: ResponseEvent) -> Result<(), ExchangeError> {
        let flow = self.conn.flow();
        let disconnected = self.lock().disconnected;
        if flow.is_write_paused() && !disconnected {
            flow.drain().await;
        }

        let kind = event.kind();

        let handoff = {
            let mut engine = self.conn.lock_state();
            let mut state = self.lock();
            if state.disconnected {
                return Ok(());
            }

            if !state.response_started {
                let ResponseEvent::Start { status, headers } = event else {
                    return Err(ExchangeError::UnexpectedMessage {
                        expected: "http.response.start",
                        got: kind,
                    });
                };
                state.response_started = true;
                state.waiting_for_continue = false;
                self.log_access(status);
                let headers = self.response_headers(headers);
                let head = engine.parser.serialize(Outbound::Response { status, headers })?;
                self.conn.transport().write(head);
                return Ok(());
            }

            if state.response_complete {
                return Err(ExchangeError::ResponseAlreadyComplete);
            }

            let ResponseEvent::Body { body, more_body } = event else {
                return Err(ExchangeError::UnexpectedMessage {
                    expected: "http.response.body",
                    got: kind,
                });
            };

            let mut out = BytesMut::new();
            out.extend_from_slice(&engine.parser.serialize(Outbound::Data(body))?);
            if !more_body {
                out.extend_from_slice(&engine.parser.serialize(Outbound::EndOfMessage)?);
                state.response_complete = true;
            }
            if !out.is_empty() {
                self.conn.transport().write(out.freeze());
            }

            if !state.response_complete {
                return Ok(());
            }

            state.task.take();
            let must_close = engine.parser.our_state() == PeerState::MustClose || !state.keep_alive;
            drop(state);

            if must_close {
                let _ = engine.parser.serialize(Outbound::ConnectionClosed);
                self.conn.transport().close();
            }
            if let Some(active) = engine.cycle.as_mut().filter(|a| Arc::ptr_eq(&a.shared, self)) {
                active.body_tx = None;
            }
            self.conn.on_response_complete(&mut engine)
        };

        if let Some(handoff) = handoff {
            self.conn.complete_upgrade(handoff);
        }
        Ok(())
    }

    /// Default headers the application did not override, then the application's.
    fn response_headers(&self, app_headers: Vec<Header>) -> Vec<Header> {
        let defaults = self.conn.server_state().default_headers();
        let mut headers: Vec<Header> = defaults
            .iter()
            .filter(|(name, _)| !app_headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)))
            .cloned()
            .collect();
        headers.extend(app_headers);
        headers
    }

    fn log_access(&self, status: u16) {
        if !self.conn.config().access_log {
            return;
        }
        let client = self
            .request
            .client
            .map_or_else(|| "-".to_string(), |addr| addr.to_string());
        tracing::info!(
            target: "h1_engine::access",
            client = %client,
            method = %self.request.method,
            path = %self.request.path,
            http_version = self.request.http_version,
            status,
            "{} - \"{} {} HTTP/{}\" {}",
            client,
            self.request.method,
            self.request.path,
            self.request.http_version,
            status
        );
    }

    async fn send_500(self: &Arc<Self>) {
        let result = async {
            self.send(ResponseEvent::Start {
                status: 500,
                headers: close_headers(INTERNAL_ERROR),
            })
            .await?;
            self.send(ResponseEvent::body(INTERNAL_ERROR, false)).await
        }
        .await;
        if let Err(err) = result {
            tracing::debug!(connection_id = %self.conn.id(), error = %err, "Could not send 500 response");
            self.conn.transport().close();
        }
    }
}

fn close_headers(body: &str) -> Vec<Header> {
    vec![
        (Bytes::from_static(b"content-type"), Bytes::from_static(PLAIN_TEXT)),
        (Bytes::from_static(b"connection"), Bytes::from_static(b"close")),
        (Bytes::from_static(b"content-length"), Bytes::from(body.len().to_string())),
    ]
}

/// Application-side handle for reading the request body.
#[derive(Debug)]
pub struct RequestReceiver {
    shared: Arc<CycleShared>,
    body_rx: mpsc::UnboundedReceiver<BodyFrame>,
    body_finished: bool,
}

impl RequestReceiver {
    /// Wait for the next piece of request body.
    ///
    /// Returns [`ReceiveEvent::Disconnect`] once the client is gone or the
    /// response has completed.
    pub async fn receive(&mut self) -> ReceiveEvent {
        self.shared.send_continue();

        {
            let state = self.shared.lock();
            if state.disconnected || state.response_complete {
                return ReceiveEvent::Disconnect;
            }
        }

        if self.body_finished {
            // Nothing more will arrive; wait for the exchange to end.
            while self.body_rx.recv().await.is_some() {}
            return ReceiveEvent::Disconnect;
        }

        self.shared.conn.flow().resume_reading();
        let Some(first) = self.body_rx.recv().await else {
            return ReceiveEvent::Disconnect;
        };

        let mut body = BytesMut::new();
        let mut frame = Some(first);
        while let Some(current) = frame.take() {
            match current {
                BodyFrame::Data(data) => {
                    body.extend_from_slice(&data);
                    frame = self.body_rx.try_recv().ok();
                }
                BodyFrame::End => self.body_finished = true,
            }
        }
        self.shared.unread.fetch_sub(body.len(), Ordering::AcqRel);

        let state = self.shared.lock();
        if state.disconnected || state.response_complete {
            return ReceiveEvent::Disconnect;
        }
        ReceiveEvent::Body {
            body: body.freeze(),
            more_body: !self.body_finished,
        }
    }
}

/// Application-side handle for producing the response.
#[derive(Debug, Clone)]
pub struct ResponseSender {
    shared: Arc<CycleShared>,
}

impl ResponseSender {
    /// Send one response event.
    ///
    /// After the client disconnected this is a no-op returning `Ok(())`.
    pub async fn send(&self, event: ResponseEvent) -> Result<(), ExchangeError> {
        self.shared.send(event).await
    }
}

/// Handles created for one exchange.
pub(crate) struct NewCycle {
    pub shared: Arc<CycleShared>,
    pub body_tx: mpsc::UnboundedSender<BodyFrame>,
    pub receiver: RequestReceiver,
    pub sender: ResponseSender,
}

pub(crate) fn new_cycle(
    conn: Arc<H1Connection>,
    scope: &Scope,
    waiting_for_continue: bool,
    task: TaskGuard,
) -> NewCycle {
    let (body_tx, body_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(CycleShared {
        conn,
        request: RequestSummary {
            method: scope.method.clone(),
            path: scope.path_with_query(),
            http_version: scope.http_version.as_str(),
            client: scope.client,
        },
        state: Mutex::new(CycleState {
            response_started: false,
            response_complete: false,
            disconnected: false,
            keep_alive: true,
            waiting_for_continue,
            task: Some(task),
        }),
        unread: AtomicUsize::new(0),
    });
    NewCycle {
        receiver: RequestReceiver {
            shared: shared.clone(),
            body_rx,
            body_finished: false,
        },
        sender: ResponseSender {
            shared: shared.clone(),
        },
        shared,
        body_tx,
    }
}

/// Run the application for one exchange and clean up after it.
pub(crate) async fn run_app(
    app: Arc<dyn Application>,
    scope: Scope,
    receiver: RequestReceiver,
    sender: ResponseSender,
) {
    let shared = sender.shared.clone();
    let connection_id = shared.conn.id();
    let result = AssertUnwindSafe(async move { app.call(scope, receiver, sender).await })
        .catch_unwind()
        .await;

    let (started, complete, disconnected) = {
        let state = shared.lock();
        (state.response_started, state.response_complete, state.disconnected)
    };

    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(panic) => Some(panic_message(panic.as_ref())),
    };

    match failure {
        Some(error) => {
            tracing::error!(connection_id = %connection_id, error = %error, "Exception in application");
            metrics::record_app_error();
            if !started {
                shared.send_500().await;
            } else {
                shared.conn.transport().close();
            }
        }
        None if !started && !disconnected => {
            tracing::error!(connection_id = %connection_id, "Application returned without starting response.");
            metrics::record_app_error();
            shared.send_500().await;
        }
        None if !complete && !disconnected => {
            tracing::error!(connection_id = %connection_id, "Application returned without completing response.");
            metrics::record_app_error();
            shared.conn.transport().close();
        }
        None => {}
    }
    shared.release_task();
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "application panicked".to_string()
    }
}

/// Answers every request with `503 Service Unavailable` and closes.
pub(crate) async fn service_unavailable(
    _scope: Scope,
    _receive: RequestReceiver,
    send: ResponseSender,
) -> Result<(), AppError> {
    send.send(ResponseEvent::Start {
        status: 503,
        headers: close_headers(SERVICE_UNAVAILABLE),
    })
    .await?;
    send.send(ResponseEvent::body(SERVICE_UNAVAILABLE, false)).await?;
    Ok(())
}
