//! h1-engine demo server.
//!
//! Serves a small application over the HTTP/1.1 engine:
//! - `/echo` streams the request body back
//! - anything else answers `Hello, world!`
//!
//! ```text
//! h1-engine --config server.toml --bind 0.0.0.0:8000 --limit-concurrency 512
//! ```

use std::path::PathBuf;

use clap::Parser;

use h1_engine::config::{self, validation::validate_config, ConfigError, ServerConfig};
use h1_engine::error::AppError;
use h1_engine::http::{HttpServer, ReceiveEvent, RequestReceiver, ResponseEvent, ResponseSender, Scope};
use h1_engine::lifecycle::{signals, Shutdown};
use h1_engine::net::Listener;
use h1_engine::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "h1-engine")]
#[command(about = "HTTP/1.1 protocol engine demo server", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`
    #[arg(short, long)]
    bind: Option<String>,

    /// Override `observability.log_level`
    #[arg(long)]
    log_level: Option<String>,

    /// Override `http.limit_concurrency`
    #[arg(long)]
    limit_concurrency: Option<usize>,
}

impl Cli {
    fn load(&self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => config::load_config(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
        if self.limit_concurrency.is_some() {
            config.http.limit_concurrency = self.limit_concurrency;
        }
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

async fn demo_app(
    scope: Scope,
    mut receive: RequestReceiver,
    send: ResponseSender,
) -> Result<(), AppError> {
    if scope.path == "/echo" {
        send.send(ResponseEvent::start(
            200,
            vec![("content-type", "application/octet-stream")],
        ))
        .await?;
        loop {
            match receive.receive().await {
                ReceiveEvent::Body { body, more_body } => {
                    send.send(ResponseEvent::body(body, more_body)).await?;
                    if !more_body {
                        return Ok(());
                    }
                }
                ReceiveEvent::Disconnect => return Ok(()),
            }
        }
    }

    send.send(ResponseEvent::start(
        200,
        vec![
            ("content-type", "text/plain; charset=utf-8"),
            ("content-length", "13"),
        ],
    ))
    .await?;
    send.send(ResponseEvent::body("Hello, world!", false)).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.load()?;

    logging::init(&config.observability.log_level);
    tracing::info!("h1-engine v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        keep_alive_timeout_secs = config.http.keep_alive_timeout_secs,
        limit_concurrency = ?config.http.limit_concurrency,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move {
        signals::wait_for_termination().await;
        shutdown.trigger();
    });

    let server = HttpServer::new(config, demo_app);
    server.run(listener, receiver).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
