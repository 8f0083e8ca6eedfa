//! The contract between the protocol engine and request-handling code.
//!
//! An [`Application`] is called once per exchange with a [`Scope`], a
//! [`RequestReceiver`] for the request body and a [`ResponseSender`] for the
//! response. Any `Fn(Scope, RequestReceiver, ResponseSender) -> impl Future`
//! qualifies:
//!
//! ```no_run
//! use h1_engine::http::app::{ResponseEvent, Scope};
//! use h1_engine::http::{RequestReceiver, ResponseSender};
//! use h1_engine::error::AppError;
//!
//! async fn hello(_scope: Scope, _rx: RequestReceiver, tx: ResponseSender) -> Result<(), AppError> {
//!     tx.send(ResponseEvent::start(200, vec![])).await?;
//!     tx.send(ResponseEvent::body("hi", false)).await?;
//!     Ok(())
//! }
//! ```

use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::net::SocketAddr;

use crate::error::AppError;
use crate::http::cycle::{RequestReceiver, ResponseSender};
use crate::http::wire::{Header, RequestHead, Version};

/// URL scheme of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Read-only description of one request.
#[derive(Debug, Clone)]
pub struct Scope {
    pub method: String,
    pub scheme: Scheme,
    /// `"1.0"` or `"1.1"`.
    pub http_version: Version,
    /// Percent-decoded path.
    pub path: String,
    /// Path exactly as received, without the query.
    pub raw_path: Bytes,
    /// Bytes after the first `?`, without the `?`.
    pub query_string: Bytes,
    pub root_path: String,
    /// Lower-cased names, values as received.
    pub headers: Vec<Header>,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
}

impl Scope {
    pub(crate) fn from_head(
        head: &RequestHead,
        scheme: Scheme,
        root_path: &str,
        client: Option<SocketAddr>,
        server: Option<SocketAddr>,
    ) -> Self {
        let (raw_path, query_string) = match head.target.iter().position(|&b| b == b'?') {
            Some(pos) => (head.target.slice(..pos), head.target.slice(pos + 1..)),
            None => (head.target.clone(), Bytes::new()),
        };
        Self {
            method: head.method.clone(),
            scheme,
            http_version: head.version,
            path: percent_decode(&raw_path),
            raw_path,
            query_string,
            root_path: root_path.to_owned(),
            headers: head.headers.clone(),
            client,
            server,
        }
    }

    /// First header with the given lower-case name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.as_ref() == name.as_bytes())
            .map(|(_, v)| v.as_ref())
    }

    /// `root_path + path`, followed by `?query` when present.
    pub fn path_with_query(&self) -> String {
        let mut out = format!("{}{}", self.root_path, self.path);
        if !self.query_string.is_empty() {
            out.push('?');
            out.push_str(&String::from_utf8_lossy(&self.query_string));
        }
        out
    }
}

/// Decode `%XX` escapes; invalid escapes are kept literally.
fn percent_decode(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' && i + 2 < raw.len() {
            if let (Some(hi), Some(lo)) = (hex_digit(raw[i + 1]), hex_digit(raw[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// What `RequestReceiver::receive` hands to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEvent {
    /// Request body bytes; `more_body == false` marks the last piece.
    Body { body: Bytes, more_body: bool },
    /// The client went away, or the response is already complete.
    Disconnect,
}

/// What the application hands to `ResponseSender::send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Start { status: u16, headers: Vec<Header> },
    Body { body: Bytes, more_body: bool },
}

impl ResponseEvent {
    pub fn start(status: u16, headers: Vec<(&'static str, &'static str)>) -> Self {
        ResponseEvent::Start {
            status,
            headers: headers
                .into_iter()
                .map(|(n, v)| (Bytes::from_static(n.as_bytes()), Bytes::from_static(v.as_bytes())))
                .collect(),
        }
    }

    pub fn body(body: impl Into<Bytes>, more_body: bool) -> Self {
        ResponseEvent::Body {
            body: body.into(),
            more_body,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ResponseEvent::Start { .. } => "http.response.start",
            ResponseEvent::Body { .. } => "http.response.body",
        }
    }
}

/// A request handler.
pub trait Application: Send + Sync + 'static {
    fn call(
        &self,
        scope: Scope,
        receive: RequestReceiver,
        send: ResponseSender,
    ) -> BoxFuture<'static, Result<(), AppError>>;
}

impl<F, Fut> Application for F
where
    F: Fn(Scope, RequestReceiver, ResponseSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AppError>> + Send + 'static,
{
    fn call(
        &self,
        scope: Scope,
        receive: RequestReceiver,
        send: ResponseSender,
    ) -> BoxFuture<'static, Result<(), AppError>> {
        Box::pin(self(scope, receive, send))
    }
}
