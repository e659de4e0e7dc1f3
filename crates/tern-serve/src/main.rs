//! tern-serve: run the tern HTTP/1.x engine from the command line
//!
//! Routes:
//! - `GET /`            plain greeting
//! - `ANY /echo`        request line, headers and body echoed back
//! - `GET /ws`          WebSocket echo
//! - `CONNECT host:port` raw TCP tunnel

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tern_core::upgrade::{self, Message, WebSocket};
use tern_core::{Error, Method, Reply, Request, Response, Server, ServerConfig, WebSocketConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tern-serve")]
#[command(about = "HTTP/1.x server with WebSocket and CONNECT support", long_about = None)]
struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Runtime worker threads (default: one per CPU)
    #[arg(short, long)]
    workers: Option<usize>,

    #[arg(long)]
    read_timeout_secs: Option<u64>,

    #[arg(long)]
    write_timeout_secs: Option<u64>,

    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[cfg(feature = "tls")]
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<String>,

    #[cfg(feature = "tls")]
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<String>,

    /// Value of the Server header; empty to omit it
    #[arg(long, default_value = "tern")]
    server_name: String,

    /// Offer permessage-deflate to WebSocket clients
    #[arg(long)]
    websocket_compression: bool,

    /// Seconds to wait for open connections on shutdown
    #[arg(long, default_value_t = 30)]
    shutdown_grace_secs: u64,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::default().with_server_name(
            Some(self.server_name.clone()).filter(|name| !name.is_empty()),
        );
        if let Some(secs) = self.read_timeout_secs {
            config = config.with_read_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.write_timeout_secs {
            config = config.with_write_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.idle_timeout_secs {
            config = config.with_idle_timeout(Duration::from_secs(secs));
        }
        config
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tern_serve=info,tern_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let workers = cli.workers.unwrap_or_else(num_cpus::get).max(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    runtime.block_on(run(cli, workers))
}

async fn run(cli: Cli, workers: usize) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;
    let config = cli.server_config();
    let websocket = Arc::new(WebSocketConfig {
        enable_compression: cli.websocket_compression,
        ..WebSocketConfig::default()
    });

    tracing::info!(
        %addr,
        workers,
        read_timeout = ?config.read_timeout,
        write_timeout = ?config.write_timeout,
        idle_timeout = ?config.idle_timeout,
        websocket_compression = websocket.enable_compression,
        "configuration loaded"
    );

    let builder = Server::builder(move |req: Request| {
        let websocket = Arc::clone(&websocket);
        async move { route(req, &websocket).await }
    })
    .config(config);

    #[cfg(feature = "tls")]
    let builder = match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert), Some(key)) => {
            tracing::info!(cert = %cert, "TLS enabled");
            builder.tls(tern_core::TlsConfig::new(cert, key))
        }
        _ => builder,
    };

    let server = builder.build()?;

    let grace = Duration::from_secs(cli.shutdown_grace_secs);
    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(grace_secs = grace.as_secs(), "shutdown requested");
            if !signal_server.graceful_shutdown(Some(grace)).await {
                tracing::warn!(
                    remaining = signal_server.tracker().count(),
                    "grace period elapsed with connections still open"
                );
            }
        }
    });

    match server.listen_and_serve(addr).await {
        Err(Error::ServerClosed) => {
            // Let the drain finish before the runtime drops its tasks
            server.graceful_shutdown(Some(grace)).await;
            tracing::info!("server stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}

async fn route(req: Request, websocket: &WebSocketConfig) -> Reply {
    if req.method() == Method::Connect {
        return upgrade::connect(&req).await;
    }

    match req.path() {
        "/" => Response::text("Hello from tern\n").into(),
        "/echo" => echo(req).into(),
        "/ws" => upgrade::websocket(&req, websocket, echo_socket),
        _ => Response::not_found().into(),
    }
}

fn echo(mut req: Request) -> Response {
    let (major, minor) = req.version();
    let mut text = format!("{} {} HTTP/{}.{}\n", req.method(), req.target(), major, minor);
    for (name, value) in req.headers().iter() {
        text.push_str(&format!("{}: {}\n", name, value));
    }
    text.push('\n');
    let mut out = text.into_bytes();
    if let Some(body) = req.take_body() {
        out.extend_from_slice(&body);
    }
    Response::text(out)
}

async fn echo_socket(mut ws: WebSocket) {
    loop {
        let echoed = match ws.recv().await {
            Ok(Some(Message::Text(text))) => ws.send_text(text).await,
            Ok(Some(Message::Binary(data))) => ws.send_binary(data).await,
            Ok(Some(_)) => Ok(()),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "websocket closed with error");
                break;
            }
        };
        if let Err(e) = echoed {
            tracing::debug!(error = %e, "websocket send failed");
            break;
        }
    }
}
