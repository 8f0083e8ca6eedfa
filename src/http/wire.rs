//! Incremental HTTP/1.1 wire parser and serializer (server role).
//!
//! # Responsibilities
//! - Buffer raw bytes and turn them into [`WireEvent`]s one at a time
//! - Decide request body framing (Content-Length / chunked / none)
//! - Serialize outbound response events with the framing the headers imply
//! - Track `our_state` / `their_state` so callers know if the socket can be reused
//!
//! # States
//! ```text
//! their_state: Idle → SendBody → Done | MustClose → (Idle via start_next_cycle) | Closed
//! our_state:   Idle → SendResponse → SendBody → Done | MustClose → …
//! ```
//! Any malformed input moves `their_state` to `Error`; misuse on our side moves
//! `our_state` to `Error`. Both are terminal.
//!
//! Nothing here performs I/O: bytes in, events out; events in, bytes out.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// A header as it appears on the wire. Request header names are lower-cased.
pub type Header = (Bytes, Bytes);

/// Default cap on an incomplete request head (request line + headers).
pub const DEFAULT_MAX_HEAD_SIZE: usize = 16 * 1024;

/// Maximum number of request headers accepted.
const MAX_HEADERS: usize = 100;

/// Maximum length of a chunk-size line (including extensions).
const MAX_CHUNK_LINE_LEN: usize = 1024;

/// Wire-level protocol errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// The request line or header block does not follow the HTTP/1.1 grammar.
    #[error("malformed request head: {0}")]
    Parse(#[from] httparse::Error),
    /// Some other violation in what the peer sent.
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    /// The request head grew beyond the configured limit before completing.
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),
    /// Transfer-Encoding other than a lone `chunked`.
    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,
    /// The peer closed the stream in the middle of a message.
    #[error("peer closed connection mid-message")]
    IncompleteMessage,
    /// `next_event` was called after the peer already produced an error.
    #[error("cannot receive data when peer state is error")]
    PeerErrored,
    /// We tried to send something the protocol state does not allow.
    #[error("local protocol error: {0}")]
    Local(&'static str),
}

impl WireError {
    /// Whether the error was caused by the remote peer.
    pub fn is_remote(&self) -> bool {
        !matches!(self, WireError::Local(_))
    }

    /// Status code a server would answer this error with.
    pub fn status_hint(&self) -> u16 {
        match self {
            WireError::HeadTooLarge(_) => 431,
            WireError::UnsupportedTransferEncoding => 501,
            WireError::Local(_) => 500,
            _ => 400,
        }
    }
}

/// HTTP versions a request can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// The version as it appears in a `Scope` (`"1.0"` / `"1.1"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "1.0",
            Version::Http11 => "1.1",
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed request line and header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: Bytes,
    pub version: Version,
    pub headers: Vec<Header>,
}

impl RequestHead {
    /// First header with the given (lower-case) name.
    pub fn header(&self, name: &[u8]) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, v)| v)
    }

    /// Re-encode the head as it would have appeared on the wire.
    pub fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.extend_from_slice(b" ");
        out.extend_from_slice(&self.target);
        out.extend_from_slice(b" HTTP/");
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Events produced by feeding bytes into the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// A complete request line and header block.
    RequestLine(RequestHead),
    /// A slice of request body.
    BodyChunk(Bytes),
    /// The current request has been fully received.
    MessageComplete,
    /// Nothing more can be produced without more bytes.
    NeedMoreData,
    /// A further request is buffered but the current cycle is not finished.
    Paused,
    /// The peer closed its side cleanly between messages.
    ConnectionClosed,
}

/// Outbound events accepted by [`H1Parser::serialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A 1xx interim response, e.g. `100 Continue`.
    Informational { status: u16, headers: Vec<Header> },
    /// Final response status line and headers.
    Response { status: u16, headers: Vec<Header> },
    /// A piece of response body.
    Data(Bytes),
    /// End of the response body.
    EndOfMessage,
    /// We are closing the connection.
    ConnectionClosed,
}

/// Per-direction protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    SendResponse,
    SendBody,
    Done,
    MustClose,
    Closed,
    Error,
}

/// Coarse view of the read side, mostly for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Idle,
    ReadingHeaders,
    ReadingBody,
    Done,
    Closed,
    Error,
}

/// Outcome of one body decoding step.
enum BodyProgress {
    Chunk(Bytes),
    Complete,
    NeedMore,
}

#[derive(Debug)]
enum ChunkPhase {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailers,
}

/// Request body decoder.
#[derive(Debug)]
enum BodyReader {
    Length { remaining: u64 },
    Chunked { phase: ChunkPhase },
}

impl BodyReader {
    fn decode(&mut self, buf: &mut BytesMut, eof: bool) -> Result<BodyProgress, WireError> {
        match self {
            BodyReader::Length { remaining } => {
                if *remaining == 0 {
                    return Ok(BodyProgress::Complete);
                }
                if buf.is_empty() {
                    return need_more(eof);
                }
                let n = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= n as u64;
                Ok(BodyProgress::Chunk(buf.split_to(n).freeze()))
            }
            BodyReader::Chunked { phase } => loop {
                match phase {
                    ChunkPhase::Size => {
                        let Some(line) = split_line(buf, MAX_CHUNK_LINE_LEN)? else {
                            return need_more(eof);
                        };
                        let size = parse_chunk_size(&line)?;
                        *phase = if size == 0 {
                            ChunkPhase::Trailers
                        } else {
                            ChunkPhase::Data { remaining: size }
                        };
                    }
                    ChunkPhase::Data { remaining } => {
                        if buf.is_empty() {
                            return need_more(eof);
                        }
                        let n = (*remaining).min(buf.len() as u64) as usize;
                        *remaining -= n as u64;
                        if *remaining == 0 {
                            *phase = ChunkPhase::DataCrlf;
                        }
                        return Ok(BodyProgress::Chunk(buf.split_to(n).freeze()));
                    }
                    ChunkPhase::DataCrlf => {
                        if buf.len() < 2 {
                            return need_more(eof);
                        }
                        if &buf[..2] != b"\r\n" {
                            return Err(WireError::Malformed("missing CRLF after chunk data"));
                        }
                        let _ = buf.split_to(2);
                        *phase = ChunkPhase::Size;
                    }
                    ChunkPhase::Trailers => {
                        let Some(line) = split_line(buf, MAX_CHUNK_LINE_LEN)? else {
                            return need_more(eof);
                        };
                        if line.is_empty() {
                            return Ok(BodyProgress::Complete);
                        }
                        if !line.contains(&b':') {
                            return Err(WireError::Malformed("invalid trailer line"));
                        }
                    }
                }
            },
        }
    }
}

fn need_more(eof: bool) -> Result<BodyProgress, WireError> {
    if eof {
        Err(WireError::IncompleteMessage)
    } else {
        Ok(BodyProgress::NeedMore)
    }
}

/// Split one CRLF-terminated line off the front of `buf` (without the CRLF).
fn split_line(buf: &mut BytesMut, max: usize) -> Result<Option<Bytes>, WireError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) if pos > max => Err(WireError::Malformed("line too long")),
        Some(pos) => {
            let line = buf.split_to(pos).freeze();
            let _ = buf.split_to(2);
            Ok(Some(line))
        }
        None if buf.len() > max => Err(WireError::Malformed("line too long")),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, WireError> {
    let size = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let size = std::str::from_utf8(size)
        .map_err(|_| WireError::Malformed("invalid chunk size"))?
        .trim_matches(|c| c == ' ' || c == '\t');
    if size.is_empty() || size.len() > 16 {
        return Err(WireError::Malformed("invalid chunk size"));
    }
    u64::from_str_radix(size, 16).map_err(|_| WireError::Malformed("invalid chunk size"))
}

/// Response body encoder.
#[derive(Debug)]
enum BodyWriter {
    /// HEAD responses and statuses that never carry a body.
    Suppressed,
    Length { remaining: u64 },
    Chunked,
    /// HTTP/1.0 peer without a declared length: the body ends when we close.
    CloseDelimited,
}

impl BodyWriter {
    fn encode(&mut self, data: &[u8], out: &mut BytesMut) -> Result<(), WireError> {
        match self {
            BodyWriter::Suppressed => {}
            BodyWriter::Length { remaining } => {
                if data.len() as u64 > *remaining {
                    return Err(WireError::Local("too much data for declared Content-Length"));
                }
                *remaining -= data.len() as u64;
                out.extend_from_slice(data);
            }
            BodyWriter::Chunked => {
                if !data.is_empty() {
                    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
                    out.extend_from_slice(data);
                    out.extend_from_slice(b"\r\n");
                }
            }
            BodyWriter::CloseDelimited => out.extend_from_slice(data),
        }
        Ok(())
    }

    fn finish(&self, out: &mut BytesMut) -> Result<(), WireError> {
        match self {
            BodyWriter::Length { remaining } if *remaining > 0 => {
                Err(WireError::Local("too little data for declared Content-Length"))
            }
            BodyWriter::Chunked => {
                out.extend_from_slice(b"0\r\n\r\n");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// How a response body is delimited, judged from its status and headers.
enum Framing {
    NoBody,
    Length(u64),
    Chunked,
    Unknown,
}

/// Incremental HTTP/1.1 server-side connection state machine.
#[derive(Debug)]
pub struct H1Parser {
    buf: BytesMut,
    max_head_size: usize,
    eof: bool,
    their_state: PeerState,
    our_state: PeerState,
    reader: Option<BodyReader>,
    writer: Option<BodyWriter>,
    request_method: Option<String>,
    their_version: Option<Version>,
    keep_alive: bool,
    waiting_for_continue: bool,
}

impl Default for H1Parser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEAD_SIZE)
    }
}

impl H1Parser {
    /// Create a parser that rejects request heads larger than `max_head_size`.
    pub fn new(max_head_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_head_size,
            eof: false,
            their_state: PeerState::Idle,
            our_state: PeerState::Idle,
            reader: None,
            writer: None,
            request_method: None,
            their_version: None,
            keep_alive: true,
            waiting_for_continue: false,
        }
    }

    /// Append received bytes to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Record that the peer closed its sending side.
    pub fn feed_eof(&mut self) {
        self.eof = true;
    }

    pub fn our_state(&self) -> PeerState {
        self.our_state
    }

    pub fn their_state(&self) -> PeerState {
        self.their_state
    }

    /// Coarse read-side state.
    pub fn state(&self) -> ParserState {
        match self.their_state {
            PeerState::Idle | PeerState::SendResponse if self.buf.is_empty() => ParserState::Idle,
            PeerState::Idle | PeerState::SendResponse => ParserState::ReadingHeaders,
            PeerState::SendBody => ParserState::ReadingBody,
            PeerState::Done | PeerState::MustClose => ParserState::Done,
            PeerState::Closed => ParserState::Closed,
            PeerState::Error => ParserState::Error,
        }
    }

    /// Whether both sides still allow the connection to be reused.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The peer sent `Expect: 100-continue` and has not been answered yet.
    pub fn waiting_for_continue(&self) -> bool {
        self.waiting_for_continue
    }

    pub fn their_version(&self) -> Option<Version> {
        self.their_version
    }

    /// Number of received bytes not yet turned into events.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Hand over every byte not yet consumed (used for protocol upgrades).
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Pull the next event out of the buffered bytes.
    pub fn next_event(&mut self) -> Result<WireEvent, WireError> {
        if self.their_state == PeerState::Error {
            return Err(WireError::PeerErrored);
        }
        self.extract_event().inspect_err(|_| {
            self.their_state = PeerState::Error;
        })
    }

    fn extract_event(&mut self) -> Result<WireEvent, WireError> {
        match self.their_state {
            PeerState::Idle | PeerState::SendResponse => self.read_head(),
            PeerState::SendBody => self.read_body(),
            PeerState::Done | PeerState::MustClose => {
                if !self.buf.is_empty() {
                    Ok(WireEvent::Paused)
                } else if self.eof {
                    self.their_state = PeerState::Closed;
                    Ok(WireEvent::ConnectionClosed)
                } else {
                    Ok(WireEvent::NeedMoreData)
                }
            }
            PeerState::Closed => Ok(WireEvent::ConnectionClosed),
            PeerState::Error => Err(WireError::PeerErrored),
        }
    }

    fn read_head(&mut self) -> Result<WireEvent, WireError> {
        if self.buf.is_empty() {
            if self.eof {
                self.their_state = PeerState::Closed;
                return Ok(WireEvent::ConnectionClosed);
            }
            return Ok(WireEvent::NeedMoreData);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(&self.buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if self.buf.len() > self.max_head_size {
                    return Err(WireError::HeadTooLarge(self.max_head_size));
                }
                if self.eof {
                    return Err(WireError::IncompleteMessage);
                }
                return Ok(WireEvent::NeedMoreData);
            }
        };
        if len > self.max_head_size {
            return Err(WireError::HeadTooLarge(self.max_head_size));
        }

        let method = req
            .method
            .ok_or(WireError::Malformed("missing method"))?
            .to_owned();
        let target = Bytes::copy_from_slice(
            req.path.ok_or(WireError::Malformed("missing request target"))?.as_bytes(),
        );
        let version = match req.version {
            Some(0) => Version::Http10,
            Some(1) => Version::Http11,
            _ => return Err(WireError::Malformed("unsupported HTTP version")),
        };
        let headers: Vec<Header> = req
            .headers
            .iter()
            .map(|h| {
                (
                    Bytes::from(h.name.to_ascii_lowercase()),
                    Bytes::copy_from_slice(trim_ows(h.value)),
                )
            })
            .collect();
        let _ = self.buf.split_to(len);

        let reader = request_body_reader(version, &headers)?;
        self.keep_alive = version == Version::Http11 && !has_token(&headers, b"connection", b"close");
        self.waiting_for_continue = version == Version::Http11
            && headers
                .iter()
                .any(|(n, v)| n.as_ref() == b"expect" && v.eq_ignore_ascii_case(b"100-continue"));
        self.request_method = Some(method.clone());
        self.their_version = Some(version);
        self.reader = Some(reader);
        self.their_state = PeerState::SendBody;
        if self.our_state == PeerState::Idle {
            self.our_state = PeerState::SendResponse;
        }

        Ok(WireEvent::RequestLine(RequestHead {
            method,
            target,
            version,
            headers,
        }))
    }

    fn read_body(&mut self) -> Result<WireEvent, WireError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(WireError::Malformed("body without framing"));
        };
        match reader.decode(&mut self.buf, self.eof)? {
            BodyProgress::Chunk(data) => {
                self.waiting_for_continue = false;
                Ok(WireEvent::BodyChunk(data))
            }
            BodyProgress::NeedMore => Ok(WireEvent::NeedMoreData),
            BodyProgress::Complete => {
                self.reader = None;
                self.waiting_for_continue = false;
                self.their_state = PeerState::Done;
                self.settle();
                Ok(WireEvent::MessageComplete)
            }
        }
    }

    /// Serialize an outbound event into wire bytes.
    pub fn serialize(&mut self, event: Outbound) -> Result<Bytes, WireError> {
        if self.our_state == PeerState::Error {
            return Err(WireError::Local("cannot send when our state is error"));
        }
        self.write_event(event).inspect_err(|_| {
            self.our_state = PeerState::Error;
        })
    }

    fn write_event(&mut self, event: Outbound) -> Result<Bytes, WireError> {
        let mut out = BytesMut::new();
        match event {
            Outbound::Informational { status, headers } => {
                if self.our_state != PeerState::SendResponse {
                    return Err(WireError::Local("informational response outside of a cycle"));
                }
                if !(100..200).contains(&status) || status == 101 {
                    return Err(WireError::Local("informational status must be 1xx"));
                }
                write_head(&mut out, status, &headers)?;
                self.waiting_for_continue = false;
            }
            Outbound::Response { status, headers } => {
                if self.our_state != PeerState::SendResponse {
                    return Err(WireError::Local("response sent in wrong state"));
                }
                if !(200..1000).contains(&status) {
                    return Err(WireError::Local("final response status must be >= 200"));
                }
                let (headers, writer) = self.prepare_response(status, headers)?;
                write_head(&mut out, status, &headers)?;
                self.writer = Some(writer);
                self.waiting_for_continue = false;
                self.our_state = PeerState::SendBody;
            }
            Outbound::Data(data) => {
                let Some(writer) = self.writer.as_mut().filter(|_| self.our_state == PeerState::SendBody)
                else {
                    return Err(WireError::Local("body data sent before response head"));
                };
                writer.encode(&data, &mut out)?;
            }
            Outbound::EndOfMessage => {
                let Some(writer) = self.writer.take().filter(|_| self.our_state == PeerState::SendBody)
                else {
                    return Err(WireError::Local("end of message sent before response head"));
                };
                writer.finish(&mut out)?;
                if matches!(writer, BodyWriter::CloseDelimited) {
                    self.keep_alive = false;
                }
                self.our_state = PeerState::Done;
                self.settle();
            }
            Outbound::ConnectionClosed => {
                self.our_state = PeerState::Closed;
            }
        }
        Ok(out.freeze())
    }

    /// Fix up framing and connection headers, returning the body writer to use.
    fn prepare_response(
        &mut self,
        status: u16,
        mut headers: Vec<Header>,
    ) -> Result<(Vec<Header>, BodyWriter), WireError> {
        let is_head = self.request_method.as_deref() == Some("HEAD");
        let mut need_close = false;

        // HEAD answers carry the headers a GET would have produced.
        let mut framing = response_framing(status, &headers)?;
        if matches!(framing, Framing::Unknown) {
            set_header(&mut headers, b"content-length", None);
            if self.their_version == Some(Version::Http11) {
                set_header(&mut headers, b"transfer-encoding", Some(Bytes::from_static(b"chunked")));
                framing = Framing::Chunked;
            } else {
                set_header(&mut headers, b"transfer-encoding", None);
                if !is_head {
                    need_close = true;
                }
            }
        }

        if has_token(&headers, b"connection", b"close") {
            self.keep_alive = false;
        }
        if !self.keep_alive || need_close {
            self.keep_alive = false;
            let mut tokens: Vec<Bytes> = comma_values(&headers, b"connection")
                .into_iter()
                .filter(|t| !t.eq_ignore_ascii_case(b"keep-alive") && !t.eq_ignore_ascii_case(b"close"))
                .collect();
            tokens.push(Bytes::from_static(b"close"));
            tokens.sort();
            set_header(&mut headers, b"connection", Some(Bytes::from(tokens.join(&b", "[..]))));
        }

        let writer = if is_head {
            BodyWriter::Suppressed
        } else {
            match framing {
                Framing::NoBody => BodyWriter::Suppressed,
                Framing::Length(n) => BodyWriter::Length { remaining: n },
                Framing::Chunked => BodyWriter::Chunked,
                Framing::Unknown => BodyWriter::CloseDelimited,
            }
        };
        Ok((headers, writer))
    }

    /// Once keep-alive is off, any finished side must close.
    fn settle(&mut self) {
        if !self.keep_alive {
            if self.our_state == PeerState::Done {
                self.our_state = PeerState::MustClose;
            }
            if self.their_state == PeerState::Done {
                self.their_state = PeerState::MustClose;
            }
        }
    }

    /// Reset both sides for the next request on a kept-alive connection.
    pub fn start_next_cycle(&mut self) -> Result<(), WireError> {
        if self.our_state != PeerState::Done || self.their_state != PeerState::Done {
            return Err(WireError::Local("not in a reusable state"));
        }
        self.our_state = PeerState::Idle;
        self.their_state = PeerState::Idle;
        self.reader = None;
        self.writer = None;
        self.request_method = None;
        self.keep_alive = true;
        self.waiting_for_continue = false;
        Ok(())
    }
}

fn trim_ows(value: &[u8]) -> &[u8] {
    let start = value.iter().position(|b| !matches!(b, b' ' | b'\t')).unwrap_or(value.len());
    let end = value.iter().rposition(|b| !matches!(b, b' ' | b'\t')).map_or(start, |p| p + 1);
    &value[start..end]
}

/// Comma-separated, trimmed, lower-cased tokens across all headers named `name`.
fn comma_values(headers: &[Header], name: &[u8]) -> Vec<Bytes> {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(|&b| b == b','))
        .map(|t| Bytes::from(trim_ows(t).to_ascii_lowercase()))
        .filter(|t| !t.is_empty())
        .collect()
}

pub(crate) fn has_token(headers: &[Header], name: &[u8], token: &[u8]) -> bool {
    comma_values(headers, name).iter().any(|t| t.as_ref() == token)
}

/// Replace every header named `name` by at most one new value.
fn set_header(headers: &mut Vec<Header>, name: &'static [u8], value: Option<Bytes>) {
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    if let Some(value) = value {
        headers.push((Bytes::from_static(name), value));
    }
}

fn unique_header<'a>(headers: &'a [Header], name: &[u8]) -> Result<Option<&'a Bytes>, WireError> {
    let mut found = None;
    for (n, v) in headers {
        if n.eq_ignore_ascii_case(name) {
            if found.is_some() {
                return Err(WireError::Malformed("duplicate framing header"));
            }
            found = Some(v);
        }
    }
    Ok(found)
}

fn parse_content_length(value: &[u8]) -> Option<u64> {
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(value).ok()?.parse().ok()
}

fn request_body_reader(version: Version, headers: &[Header]) -> Result<BodyReader, WireError> {
    let te = unique_header(headers, b"transfer-encoding")?;
    let cl = unique_header(headers, b"content-length")?;
    match (te, cl) {
        (Some(_), Some(_)) => Err(WireError::Malformed(
            "both Content-Length and Transfer-Encoding present",
        )),
        (Some(te), None) => {
            if version == Version::Http10 || !te.eq_ignore_ascii_case(b"chunked") {
                return Err(WireError::UnsupportedTransferEncoding);
            }
            Ok(BodyReader::Chunked { phase: ChunkPhase::Size })
        }
        (None, Some(cl)) => {
            let remaining =
                parse_content_length(cl).ok_or(WireError::Malformed("invalid Content-Length"))?;
            Ok(BodyReader::Length { remaining })
        }
        (None, None) => Ok(BodyReader::Length { remaining: 0 }),
    }
}

fn response_framing(status: u16, headers: &[Header]) -> Result<Framing, WireError> {
    if (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(Framing::NoBody);
    }
    let chunked = comma_values(headers, b"transfer-encoding")
        .last()
        .is_some_and(|t| t.as_ref() == b"chunked");
    if chunked {
        return Ok(Framing::Chunked);
    }
    let lengths = comma_values(headers, b"content-length");
    match lengths.first() {
        Some(first) => {
            if lengths.iter().any(|l| l != first) {
                return Err(WireError::Local("conflicting Content-Length values"));
            }
            parse_content_length(first)
                .map(Framing::Length)
                .ok_or(WireError::Local("invalid Content-Length"))
        }
        None => Ok(Framing::Unknown),
    }
}

/// Header name must be an RFC 7230 token.
pub(crate) fn is_token(name: &[u8]) -> bool {
    !name.is_empty()
        && name.iter().all(|&b| {
            matches!(
                b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                    | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z'
            )
        })
}

fn write_head(out: &mut BytesMut, status: u16, headers: &[Header]) -> Result<(), WireError> {
    let reason = http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("");
    out.extend_from_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    for (name, value) in headers {
        if !is_token(name) {
            return Err(WireError::Local("invalid response header name"));
        }
        if value.iter().any(|&b| b == b'\r' || b == b'\n' || b == 0) {
            return Err(WireError::Local("invalid response header value"));
        }
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(name: &'static str, value: &'static str) -> Header {
        (Bytes::from_static(name.as_bytes()), Bytes::from_static(value.as_bytes()))
    }

    fn drain(parser: &mut H1Parser) -> Vec<WireEvent> {
        let mut events = Vec::new();
        loop {
            let event = parser.next_event().unwrap();
            let stop = matches!(
                event,
                WireEvent::NeedMoreData | WireEvent::Paused | WireEvent::ConnectionClosed
            );
            events.push(event);
            if stop {
                return events;
            }
        }
    }

    fn body_of(events: &[WireEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                WireEvent::BodyChunk(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Minimal chunked-body decoder for checking serialized responses.
    fn dechunk(mut raw: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let pos = raw.windows(2).position(|w| w == b"\r\n").unwrap();
            let size = usize::from_str_radix(std::str::from_utf8(&raw[..pos]).unwrap(), 16).unwrap();
            raw = &raw[pos + 2..];
            if size == 0 {
                return body;
            }
            body.extend_from_slice(&raw[..size]);
            raw = &raw[size + 2..];
        }
    }

    #[test]
    fn parses_simple_get() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET /hello?x=1 HTTP/1.1\r\nHost: x\r\nX-Thing:  spaced \r\n\r\n");
        let events = drain(&mut parser);
        let WireEvent::RequestLine(head) = &events[0] else {
            panic!("expected request line, got {:?}", events[0]);
        };
        assert_eq!(head.method, "GET");
        assert_eq!(head.target.as_ref(), b"/hello?x=1");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.header(b"host").unwrap().as_ref(), b"x");
        assert_eq!(head.header(b"x-thing").unwrap().as_ref(), b"spaced");
        assert_eq!(events[1], WireEvent::MessageComplete);
        assert_eq!(events[2], WireEvent::NeedMoreData);
        assert_eq!(parser.their_state(), PeerState::Done);
        assert_eq!(parser.our_state(), PeerState::SendResponse);
    }

    #[test]
    fn byte_at_a_time_feeding() {
        let raw = b"POST /up HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut parser = H1Parser::default();
        let mut events = Vec::new();
        for byte in raw.iter() {
            parser.feed(&[*byte]);
            events.extend(drain(&mut parser));
        }
        assert!(matches!(events.iter().find(|e| matches!(e, WireEvent::RequestLine(_))), Some(_)));
        assert_eq!(body_of(&events), b"hello");
        assert!(events.contains(&WireEvent::MessageComplete));
        assert_eq!(parser.state(), ParserState::Done);
    }

    #[test]
    fn reports_reading_headers_for_partial_head() {
        let mut parser = H1Parser::default();
        assert_eq!(parser.state(), ParserState::Idle);
        parser.feed(b"GET / HTTP/1.1\r\nHo");
        assert_eq!(parser.next_event().unwrap(), WireEvent::NeedMoreData);
        assert_eq!(parser.state(), ParserState::ReadingHeaders);
    }

    #[test]
    fn chunked_body_with_extensions_and_trailers() {
        let mut parser = H1Parser::default();
        parser.feed(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              5;name=value\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n",
        );
        let events = drain(&mut parser);
        assert_eq!(body_of(&events), b"hello world");
        assert!(events.contains(&WireEvent::MessageComplete));
    }

    #[test]
    fn chunked_body_split_mid_chunk() {
        let mut parser = H1Parser::default();
        parser.feed(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nA\r\n01234");
        let first = drain(&mut parser);
        assert_eq!(body_of(&first), b"01234");
        parser.feed(b"56789\r\n0\r\n\r\n");
        let second = drain(&mut parser);
        assert_eq!(body_of(&second), b"56789");
        assert!(second.contains(&WireEvent::MessageComplete));
    }

    #[test]
    fn pipelined_request_pauses() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let events = drain(&mut parser);
        assert!(matches!(&events[0], WireEvent::RequestLine(h) if h.target.as_ref() == b"/a"));
        assert_eq!(events[1], WireEvent::MessageComplete);
        assert_eq!(events[2], WireEvent::Paused);
        // Still paused until our response completes.
        assert_eq!(parser.next_event().unwrap(), WireEvent::Paused);

        parser
            .serialize(Outbound::Response { status: 200, headers: vec![hdr("content-length", "0")] })
            .unwrap();
        parser.serialize(Outbound::EndOfMessage).unwrap();
        parser.start_next_cycle().unwrap();
        let events = drain(&mut parser);
        assert!(matches!(&events[0], WireEvent::RequestLine(h) if h.target.as_ref() == b"/b"));
    }

    #[test]
    fn malformed_request_line_is_error() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET\x01 / HTTP/1.1\r\n\r\n");
        let err = parser.next_event().unwrap_err();
        assert!(err.is_remote());
        assert_eq!(parser.their_state(), PeerState::Error);
        assert_eq!(parser.state(), ParserState::Error);
        assert!(matches!(parser.next_event(), Err(WireError::PeerErrored)));
    }

    #[test]
    fn rejects_ambiguous_framing() {
        let mut parser = H1Parser::default();
        parser.feed(
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\nabc",
        );
        assert!(matches!(parser.next_event(), Err(WireError::Malformed(_))));
    }

    #[test]
    fn rejects_unsupported_transfer_encoding() {
        let mut parser = H1Parser::default();
        parser.feed(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n");
        let err = parser.next_event().unwrap_err();
        assert_eq!(err.status_hint(), 501);
    }

    #[test]
    fn rejects_oversized_head() {
        let mut parser = H1Parser::new(64);
        parser.feed(b"GET / HTTP/1.1\r\n");
        parser.feed(&[b'a'; 80]);
        let err = parser.next_event().unwrap_err();
        assert!(matches!(err, WireError::HeadTooLarge(64)));
        assert_eq!(err.status_hint(), 431);
    }

    #[test]
    fn eof_between_messages_is_clean_close() {
        let mut parser = H1Parser::default();
        parser.feed_eof();
        assert_eq!(parser.next_event().unwrap(), WireEvent::ConnectionClosed);
        assert_eq!(parser.their_state(), PeerState::Closed);
    }

    #[test]
    fn eof_mid_body_is_error() {
        let mut parser = H1Parser::default();
        parser.feed(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc");
        let _ = drain(&mut parser);
        parser.feed_eof();
        assert!(matches!(parser.next_event(), Err(WireError::IncompleteMessage)));
    }

    #[test]
    fn serializes_status_line_with_reason() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        let _ = drain(&mut parser);
        let head = parser
            .serialize(Outbound::Response {
                status: 200,
                headers: vec![hdr("content-type", "text/plain"), hdr("content-length", "2")],
            })
            .unwrap();
        let body = parser.serialize(Outbound::Data(Bytes::from_static(b"hi"))).unwrap();
        let end = parser.serialize(Outbound::EndOfMessage).unwrap();
        assert_eq!(
            head.as_ref(),
            b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 2\r\n\r\n"
        );
        assert_eq!(body.as_ref(), b"hi");
        assert!(end.is_empty());
        assert_eq!(parser.our_state(), PeerState::Done);
        parser.start_next_cycle().unwrap();
    }

    #[test]
    fn unknown_status_has_empty_reason() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET / HTTP/1.1\r\n\r\n");
        let _ = drain(&mut parser);
        let head = parser
            .serialize(Outbound::Response { status: 599, headers: vec![hdr("content-length", "0")] })
            .unwrap();
        assert!(head.starts_with(b"HTTP/1.1 599 \r\n"));
    }

    #[test]
    fn chunked_response_round_trips() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET / HTTP/1.1\r\n\r\n");
        let _ = drain(&mut parser);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(
            &parser.serialize(Outbound::Response { status: 200, headers: vec![] }).unwrap(),
        );
        for part in [&b"alpha"[..], b"", b"beta"] {
            wire.extend_from_slice(&parser.serialize(Outbound::Data(Bytes::copy_from_slice(part))).unwrap());
        }
        wire.extend_from_slice(&parser.serialize(Outbound::EndOfMessage).unwrap());

        let split = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let head = std::str::from_utf8(&wire[..split]).unwrap();
        assert!(head.contains("transfer-encoding: chunked\r\n"));
        assert_eq!(dechunk(&wire[split..]), b"alphabeta");
    }

    #[test]
    fn head_response_suppresses_body() {
        let mut parser = H1Parser::default();
        parser.feed(b"HEAD /x HTTP/1.1\r\n\r\n");
        let _ = drain(&mut parser);
        let head = parser
            .serialize(Outbound::Response { status: 200, headers: vec![hdr("content-length", "5")] })
            .unwrap();
        let body = parser.serialize(Outbound::Data(Bytes::from_static(b"hello"))).unwrap();
        let end = parser.serialize(Outbound::EndOfMessage).unwrap();
        assert!(head.ends_with(b"content-length: 5\r\n\r\n"));
        assert!(body.is_empty());
        assert!(end.is_empty());
        assert_eq!(parser.our_state(), PeerState::Done);
    }

    #[test]
    fn head_without_length_advertises_chunked_like_get() {
        let mut parser = H1Parser::default();
        parser.feed(b"HEAD / HTTP/1.1\r\n\r\n");
        let _ = drain(&mut parser);
        let head = parser.serialize(Outbound::Response { status: 200, headers: vec![] }).unwrap();
        assert!(head.ends_with(b"transfer-encoding: chunked\r\n\r\n"));
        assert!(parser.serialize(Outbound::Data(Bytes::from_static(b"x"))).unwrap().is_empty());
        assert!(parser.serialize(Outbound::EndOfMessage).unwrap().is_empty());
    }

    #[test]
    fn http10_peer_gets_close_delimited_body() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET / HTTP/1.0\r\n\r\n");
        let _ = drain(&mut parser);
        assert!(!parser.keep_alive());
        let head = parser.serialize(Outbound::Response { status: 200, headers: vec![] }).unwrap();
        let text = std::str::from_utf8(&head).unwrap();
        assert!(!text.contains("transfer-encoding"));
        assert!(text.contains("connection: close\r\n"));
        let body = parser.serialize(Outbound::Data(Bytes::from_static(b"raw"))).unwrap();
        assert_eq!(body.as_ref(), b"raw");
        parser.serialize(Outbound::EndOfMessage).unwrap();
        assert_eq!(parser.our_state(), PeerState::MustClose);
        assert_eq!(parser.their_state(), PeerState::MustClose);
        assert!(parser.start_next_cycle().is_err());
    }

    #[test]
    fn connection_close_request_forces_must_close() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        let _ = drain(&mut parser);
        assert_eq!(parser.their_state(), PeerState::MustClose);
        let head = parser
            .serialize(Outbound::Response { status: 204, headers: vec![hdr("connection", "keep-alive")] })
            .unwrap();
        assert!(head.ends_with(b"connection: close\r\n\r\n"));
        parser.serialize(Outbound::EndOfMessage).unwrap();
        assert_eq!(parser.our_state(), PeerState::MustClose);
    }

    #[test]
    fn response_connection_close_disables_keep_alive() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET / HTTP/1.1\r\n\r\n");
        let _ = drain(&mut parser);
        assert_eq!(parser.their_state(), PeerState::Done);
        parser
            .serialize(Outbound::Response {
                status: 503,
                headers: vec![hdr("content-length", "0"), hdr("connection", "close")],
            })
            .unwrap();
        parser.serialize(Outbound::EndOfMessage).unwrap();
        assert_eq!(parser.our_state(), PeerState::MustClose);
        assert_eq!(parser.their_state(), PeerState::MustClose);
    }

    #[test]
    fn content_length_is_enforced() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET / HTTP/1.1\r\n\r\n");
        let _ = drain(&mut parser);
        parser
            .serialize(Outbound::Response { status: 200, headers: vec![hdr("content-length", "2")] })
            .unwrap();
        let err = parser.serialize(Outbound::Data(Bytes::from_static(b"toolong"))).unwrap_err();
        assert!(!err.is_remote());
        assert_eq!(parser.our_state(), PeerState::Error);
    }

    #[test]
    fn too_little_data_fails_end_of_message() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET / HTTP/1.1\r\n\r\n");
        let _ = drain(&mut parser);
        parser
            .serialize(Outbound::Response { status: 200, headers: vec![hdr("content-length", "4")] })
            .unwrap();
        parser.serialize(Outbound::Data(Bytes::from_static(b"ab"))).unwrap();
        assert!(parser.serialize(Outbound::EndOfMessage).is_err());
    }

    #[test]
    fn data_before_response_is_local_error() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET / HTTP/1.1\r\n\r\n");
        let _ = drain(&mut parser);
        assert!(matches!(
            parser.serialize(Outbound::Data(Bytes::from_static(b"x"))),
            Err(WireError::Local(_))
        ));
    }

    #[test]
    fn expect_continue_is_tracked() {
        let mut parser = H1Parser::default();
        parser.feed(b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n");
        let _ = drain(&mut parser);
        assert!(parser.waiting_for_continue());
        let interim = parser
            .serialize(Outbound::Informational { status: 100, headers: vec![] })
            .unwrap();
        assert_eq!(interim.as_ref(), b"HTTP/1.1 100 Continue\r\n\r\n");
        assert!(!parser.waiting_for_continue());
        assert_eq!(parser.our_state(), PeerState::SendResponse);
    }

    #[test]
    fn rejects_header_injection_in_response() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET / HTTP/1.1\r\n\r\n");
        let _ = drain(&mut parser);
        let err = parser
            .serialize(Outbound::Response { status: 200, headers: vec![hdr("x-bad", "a\r\nb: c")] })
            .unwrap_err();
        assert!(matches!(err, WireError::Local(_)));
    }

    #[test]
    fn request_head_re_encodes() {
        let mut parser = H1Parser::default();
        parser.feed(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nextra");
        let WireEvent::RequestLine(head) = parser.next_event().unwrap() else {
            panic!("expected request line");
        };
        assert_eq!(
            head.to_bytes().as_ref(),
            b"GET /ws HTTP/1.1\r\nupgrade: websocket\r\nconnection: Upgrade\r\n\r\n"
        );
        assert_eq!(parser.take_buffered().as_ref(), b"extra");
    }
}
