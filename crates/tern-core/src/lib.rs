//! tern-core: HTTP/1.x server engine
//!
//! Connection sessions with keep-alive, a bounded request parser, response
//! head serialization, and protocol upgrades (WebSocket, CONNECT tunnels)
//! that take over the raw connection.
//!
//! ## Features
//! - `tls` - TLS termination and ALPN dispatch via rustls (default)

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod error;
pub mod header;
pub mod io;
pub mod parser;
pub mod request;
pub mod response;
pub mod server;
pub mod upgrade;
pub mod url;
pub mod writer;

#[cfg(feature = "tls")]
pub mod tls;

// Re-exports
pub use error::{Error, Limit, ParseError, Result, Unsupported, UpgradeError};
pub use header::{Cookie, HeaderStore, MediaType, RequestHeaders, SameSite};
pub use io::{BufferPool, Upgraded};
pub use parser::{read_request, Limits, Method};
pub use request::{FormError, Request, RequestBuilder};
pub use response::{Body, Reply, Response, ResponseBuilder, StatusCode};
pub use url::{Query, Url, UrlError};
pub use writer::write_head;

pub use server::{create_optimized_socket, ConnectionTracker, Handler, Server, ServerBuilder, ServerConfig};

// Upgrade re-exports
pub use upgrade::{Message, WebSocket, WebSocketConfig, WebSocketError};

#[cfg(feature = "tls")]
pub use tls::{load_certs, load_private_key, TlsConfig};
