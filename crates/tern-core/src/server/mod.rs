//! Listener, accept loop and server-wide state
//!
//! - One tokio task per accepted connection
//! - SO_REUSEPORT / TCP_NODELAY listener sockets
//! - Graceful shutdown through [`ConnectionTracker`]

mod session;

use crate::io::{BufferPool, Upgraded};
use crate::parser::Limits;
use crate::request::Request;
use crate::response::Reply;
use crate::{Error, Result};
use futures_util::future::BoxFuture;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};

#[cfg(feature = "tls")]
use crate::tls::TlsConfig;
#[cfg(feature = "tls")]
use std::collections::HashMap;

use session::serve_connection;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Default `Server` header; `None` leaves it out
    pub server_name: Option<String>,
    /// Deadline for reading a request head and body
    pub read_timeout: Option<Duration>,
    /// Deadline for writing a response head and body
    pub write_timeout: Option<Duration>,
    /// How long a kept-alive connection may sit between requests.
    /// Falls back to `read_timeout`.
    pub idle_timeout: Option<Duration>,
    pub limits: Limits,
    /// Initial capacity of pooled read buffers
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: Some("tern".to_string()),
            read_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            limits: Limits::default(),
            read_buffer_size: 4096,
        }
    }
}

impl ServerConfig {
    pub fn with_server_name(mut self, name: Option<String>) -> Self {
        self.server_name = name;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Deadline for the TLS handshake: the tighter of the read and write
    /// timeouts, if either is set
    pub fn handshake_timeout(&self) -> Option<Duration> {
        match (self.read_timeout, self.write_timeout) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (r, w) => r.or(w),
        }
    }

    /// Wait allowed for the next request on a kept-alive connection
    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        self.idle_timeout.or(self.read_timeout)
    }
}

/// Application entry point, called once per request
///
/// Implemented for any `Fn(Request) -> impl Future<Output = impl Into<Reply>>`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request) -> BoxFuture<'static, Reply>;
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: Into<Reply> + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, Reply> {
        let fut = self(req);
        Box::pin(async move { fut.await.into() })
    }
}

/// Decides right after accept whether a peer is served at all
pub type AddrFilter = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// Engine for a protocol negotiated through ALPN instead of HTTP/1.x
pub type ProtocolHandler = Arc<dyn Fn(Upgraded) -> BoxFuture<'static, ()> + Send + Sync>;

// ============================================================================
// Connection Tracking for Graceful Shutdown
// ============================================================================

/// Tracks active connections for graceful shutdown
///
/// Used to:
/// - Count active connections
/// - Signal shutdown to the accept loop and idle sessions
/// - Wait for existing connections to drain
#[derive(Debug)]
pub struct ConnectionTracker {
    active: AtomicU64,
    shutting_down: AtomicBool,
    drained: Notify,
    signal: watch::Sender<bool>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            active: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            drained: Notify::new(),
            signal,
        }
    }

    /// Count a connection as active until the guard is dropped
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Get current active connection count
    #[inline]
    pub fn count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Signal that shutdown is in progress
    pub fn start_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.signal.send_replace(true);
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Receiver that changes once shutdown starts
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Resolve once no connection is active
    pub async fn wait_idle(&self) {
        loop {
            let drained = self.drained.notified();
            if self.count() == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// Keeps a connection counted by its [`ConnectionTracker`]
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}

/// State shared by the accept loop and every session
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) pool: BufferPool,
    pub(crate) tracker: Arc<ConnectionTracker>,
    addr_filter: Option<AddrFilter>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<tokio_rustls::TlsAcceptor>,
    #[cfg(feature = "tls")]
    pub(crate) protocols: HashMap<String, ProtocolHandler>,
}

/// Builder for [`Server`]
pub struct ServerBuilder {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    addr_filter: Option<AddrFilter>,
    #[cfg(feature = "tls")]
    tls: Option<TlsConfig>,
    #[cfg(feature = "tls")]
    protocols: HashMap<String, ProtocolHandler>,
}

impl ServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Drop connections from peers the filter rejects, before reading
    /// anything from them
    pub fn addr_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.addr_filter = Some(Arc::new(filter));
        self
    }

    /// Terminate TLS on every accepted connection
    #[cfg(feature = "tls")]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Serve connections that negotiate `protocol` via ALPN with `handler`
    /// instead of HTTP/1.x
    #[cfg(feature = "tls")]
    pub fn next_protocol<F, Fut>(mut self, protocol: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Upgraded) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: ProtocolHandler =
            Arc::new(move |io| -> BoxFuture<'static, ()> { Box::pin(handler(io)) });
        self.protocols.insert(protocol.into(), handler);
        self
    }

    pub fn build(self) -> Result<Server> {
        #[cfg(feature = "tls")]
        let tls = match self.tls {
            Some(mut tls) => {
                for protocol in self.protocols.keys() {
                    let name = protocol.as_bytes().to_vec();
                    if !tls.alpn_protocols.contains(&name) {
                        tls.alpn_protocols.push(name);
                    }
                }
                Some(tokio_rustls::TlsAcceptor::from(tls.build_server_config()?))
            }
            None => None,
        };

        Ok(Server {
            shared: Arc::new(Shared {
                pool: BufferPool::new(self.config.read_buffer_size, 1024),
                config: self.config,
                handler: self.handler,
                tracker: Arc::new(ConnectionTracker::new()),
                addr_filter: self.addr_filter,
                #[cfg(feature = "tls")]
                tls,
                #[cfg(feature = "tls")]
                protocols: self.protocols,
            }),
        })
    }
}

/// HTTP/1.x server
///
/// Cloning is cheap; clones share the same listener state, so one clone can
/// run [`Server::serve`] while another calls [`Server::graceful_shutdown`].
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn builder<H: Handler>(handler: H) -> ServerBuilder {
        ServerBuilder {
            config: ServerConfig::default(),
            handler: Arc::new(handler),
            addr_filter: None,
            #[cfg(feature = "tls")]
            tls: None,
            #[cfg(feature = "tls")]
            protocols: HashMap::new(),
        }
    }

    /// Plaintext server with the given configuration
    pub fn new<H: Handler>(config: ServerConfig, handler: H) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool: BufferPool::new(config.read_buffer_size, 1024),
                config,
                handler: Arc::new(handler),
                tracker: Arc::new(ConnectionTracker::new()),
                addr_filter: None,
                #[cfg(feature = "tls")]
                tls: None,
                #[cfg(feature = "tls")]
                protocols: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.shared.tracker
    }

    /// Bind `addr` with [`create_optimized_socket`] and serve it
    pub async fn listen_and_serve(&self, addr: SocketAddr) -> Result<()> {
        let socket = create_optimized_socket(&addr)?;
        socket.set_nonblocking(true)?;
        let listener = TcpListener::from_std(socket.into())?;
        self.serve(listener).await
    }

    /// Accept connections until shutdown, spawning one session per
    /// connection
    ///
    /// Always ends with [`Error::ServerClosed`] once shutdown starts.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let tracker = &self.shared.tracker;
        let mut shutdown = tracker.subscribe();
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "listening");
        }

        let mut backoff = Duration::ZERO;
        loop {
            if tracker.is_shutting_down() {
                return Err(Error::ServerClosed);
            }

            let accepted = tokio::select! {
                _ = shutdown.changed() => continue,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => {
                    backoff = Duration::ZERO;
                    conn
                }
                Err(e) => {
                    backoff = (backoff * 2).clamp(Duration::from_millis(5), Duration::from_secs(1));
                    tracing::warn!(error = %e, retry_in = ?backoff, "accept failed");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            self.spawn_session(stream, peer);
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        if let Some(filter) = &self.shared.addr_filter {
            if !filter(peer) {
                tracing::debug!(%peer, "connection rejected by address filter");
                return;
            }
        }
        let _ = stream.set_nodelay(true);

        let guard = self.shared.tracker.track();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let _guard = guard;
            serve_connection(shared, stream, peer).await;
        });
    }

    /// Stop accepting; idle keep-alive connections are closed, busy ones
    /// finish their current exchange
    pub fn shutdown(&self) {
        self.shared.tracker.start_shutdown();
    }

    /// [`Server::shutdown`], then wait for sessions to drain
    ///
    /// Returns `false` when `timeout` passed with sessions still running.
    /// Hijacked connections count until their hijacker returns.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> bool {
        self.shutdown();
        let drained = self.shared.tracker.wait_idle();
        match timeout {
            Some(limit) => tokio::time::timeout(limit, drained).await.is_ok(),
            None => {
                drained.await;
                true
            }
        }
    }
}

/// Create a TCP socket with optimizations
pub fn create_optimized_socket(addr: &SocketAddr) -> std::io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    // SO_REUSEADDR - allow binding to address in TIME_WAIT
    socket.set_reuse_address(true)?;

    // SO_REUSEPORT - enable kernel load balancing across threads
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    // TCP_NODELAY - disable Nagle's algorithm for lower latency
    socket.set_nodelay(true)?;

    socket.bind(&(*addr).into())?;
    socket.listen(1024)?;

    Ok(socket)
}
