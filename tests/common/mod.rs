//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use h1_engine::config::ServerConfig;
use h1_engine::error::{AppError, ServeError};
use h1_engine::http::{
    Application, HttpServer, ReceiveEvent, RequestReceiver, ResponseEvent, ResponseSender, Scope,
    UpgradeHandler,
};
use h1_engine::lifecycle::Shutdown;
use h1_engine::net::{Listener, ServerState};

/// A server running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), ServeError>>,
}

impl TestServer {
    /// Trigger shutdown and wait for the server to return.
    pub async fn stop(self) -> Result<(), ServeError> {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
    }
}

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.http.access_log = false;
    config.shutdown.graceful_timeout_secs = 2;
    config
}

pub async fn start_server(config: ServerConfig, app: impl Application) -> TestServer {
    start_with(HttpServer::new(config, app)).await
}

pub async fn start_with_upgrade(
    config: ServerConfig,
    app: impl Application,
    handler: impl UpgradeHandler,
) -> TestServer {
    start_with(HttpServer::new(config, app).with_upgrade_handler(handler)).await
}

async fn start_with(server: HttpServer) -> TestServer {
    let listener = Listener::bind(&server.config().listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = server.state();
    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    let handle = tokio::spawn(server.run(listener, receiver));
    TestServer {
        addr,
        state,
        shutdown,
        handle,
    }
}

/// Answers `Hello, world!`, or echoes the body back on `/echo`.
pub async fn hello_app(
    scope: Scope,
    mut receive: RequestReceiver,
    send: ResponseSender,
) -> Result<(), AppError> {
    if scope.path == "/echo" {
        let mut body = Vec::new();
        loop {
            match receive.receive().await {
                ReceiveEvent::Body { body: chunk, more_body } => {
                    body.extend_from_slice(&chunk);
                    if !more_body {
                        break;
                    }
                }
                ReceiveEvent::Disconnect => return Ok(()),
            }
        }
        send.send(ResponseEvent::start(200, vec![("content-type", "text/plain")]))
            .await?;
        send.send(ResponseEvent::body(body, false)).await?;
        return Ok(());
    }

    send.send(ResponseEvent::start(200, vec![("content-type", "text/plain")]))
        .await?;
    send.send(ResponseEvent::body("Hello, world!", false)).await?;
    Ok(())
}

/// A response as seen on the wire.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

/// Minimal HTTP/1.1 client over a raw socket.
pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).await.unwrap();
    }

    pub async fn shutdown_write(&mut self) {
        self.stream.shutdown().await.unwrap();
    }

    async fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
            .await
            .expect("timed out reading from server")
            .unwrap_or(0);
        self.buf.extend_from_slice(&chunk[..n]);
        n
    }

    async fn read_line(&mut self) -> String {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                return String::from_utf8(line[..pos].to_vec()).unwrap();
            }
            assert!(self.fill().await > 0, "connection closed mid-line");
        }
    }

    async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            assert!(self.fill().await > 0, "connection closed mid-body");
        }
        self.buf.drain(..n).collect()
    }

    /// Read one response. HEAD responses must be read with `read_head_only`.
    pub async fn read_response(&mut self) -> RawResponse {
        let mut response = self.read_head_only().await;
        let chunked = response
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        if chunked {
            loop {
                let size_line = self.read_line().await;
                let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
                if size == 0 {
                    let trailer = self.read_line().await;
                    assert!(trailer.is_empty());
                    break;
                }
                let data = self.read_exact(size).await;
                response.body.extend_from_slice(&data);
                let crlf = self.read_line().await;
                assert!(crlf.is_empty());
            }
        } else if let Some(length) = response.header("content-length") {
            let length: usize = length.parse().unwrap();
            response.body = self.read_exact(length).await;
        } else if !matches!(response.status, 100..=199 | 204 | 304) {
            while self.fill().await > 0 {}
            response.body = std::mem::take(&mut self.buf);
        }
        response
    }

    pub async fn read_head_only(&mut self) -> RawResponse {
        let status_line = self.read_line().await;
        let mut parts = status_line.splitn(3, ' ');
        assert_eq!(parts.next(), Some("HTTP/1.1"), "bad status line {status_line:?}");
        let status = parts.next().unwrap().parse().unwrap();

        let mut headers = Vec::new();
        loop {
            let line = self.read_line().await;
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').unwrap();
            headers.push((name.to_string(), value.trim().to_string()));
        }
        RawResponse {
            status,
            headers,
            body: Vec::new(),
        }
    }

    /// Read until `needle` shows up, returning everything up to and including it.
    pub async fn read_until(&mut self, needle: &[u8]) -> Vec<u8> {
        loop {
            if let Some(pos) = self.buf.windows(needle.len()).position(|w| w == needle) {
                return self.buf.drain(..pos + needle.len()).collect();
            }
            assert!(self.fill().await > 0, "connection closed before {needle:?}");
        }
    }

    /// Everything the server sends until it closes the socket.
    pub async fn read_to_close(&mut self) -> Vec<u8> {
        while self.fill().await > 0 {}
        std::mem::take(&mut self.buf)
    }

    /// True once the server closed its side.
    pub async fn is_closed(&mut self) -> bool {
        self.buf.is_empty() && self.fill().await == 0
    }
}

pub async fn get(addr: SocketAddr, path: &str) -> RawResponse {
    let mut client = Client::connect(addr).await;
    client
        .send(format!("GET {path} HTTP/1.1\r\nhost: test\r\n\r\n").as_bytes())
        .await;
    client.read_response().await
}
