//! Error types for tern-core
//!
//! Every failure the engine can hit while serving a connection is classified
//! here. Classification decides what the peer sees: parser, limit and
//! unsupported-feature errors become a canned wire response, network errors
//! close the connection silently.

use crate::response::StatusCode;
use crate::url::UrlError;
use bytes::Bytes;
use thiserror::Error;

/// Result type alias for tern operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the tern HTTP engine
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request head
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A head section exceeded its configured byte ceiling
    #[error("{0} exceeds its size limit")]
    LimitExceeded(Limit),

    /// Request asks for a feature the engine does not implement
    #[error("unsupported: {0}")]
    Unsupported(Unsupported),

    /// EOF, reset or timeout on the socket
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Recovered panic inside the application handler
    #[error("handler fault: {0}")]
    HandlerFault(String),

    /// Upgrade request failed validation
    #[error("upgrade rejected: {0}")]
    Upgrade(#[from] UpgradeError),

    /// Refused header operation
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Invalid URL
    #[error("invalid url: {0}")]
    Url(#[from] UrlError),

    /// TLS error
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server is shutting down and no longer accepts connections
    #[error("server closed")]
    ServerClosed,
}

impl Error {
    /// Status used when this error is reported to the peer.
    ///
    /// `None` means the error is never reported (network failures, handler
    /// faults, local misuse).
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Parse(e) => Some(e.status()),
            Error::LimitExceeded(_) => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            Error::Unsupported(_) => Some(StatusCode::NOT_IMPLEMENTED),
            Error::Upgrade(e) => Some(e.status()),
            _ => None,
        }
    }

    /// Exact bytes written to the socket before closing, if any
    pub fn canned_response(&self) -> Option<Bytes> {
        let status = self.status()?;
        Some(crate::writer::canned(status, &self.response_text()))
    }

    /// Plaintext body reported to the peer
    ///
    /// Errors without a status read as a bare 500 so internals never leak.
    pub fn response_text(&self) -> String {
        let status = self.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match self {
            Error::Parse(ParseError::MisdirectedTarget(target)) => {
                format!("{} {}: {}\n", status.as_u16(), status.reason_phrase(), target)
            }
            Error::Unsupported(u) => format!("{} {}\n", status.as_u16(), u),
            Error::Upgrade(e) => format!("{}\n", e),
            _ => format!("{} {}\n", status.as_u16(), status.reason_phrase()),
        }
    }

    /// Whether this is one of the common "peer went away" conditions
    pub fn is_common_network_error(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Error::Network(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::TimedOut
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Which part of the request head overflowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Headline,
    HeaderLine,
    HeaderBlock,
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Limit::Headline => "request line",
            Limit::HeaderLine => "header line",
            Limit::HeaderBlock => "header block",
        })
    }
}

/// Malformed request head
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    MalformedHeadline,

    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("malformed HTTP version: {0}")]
    MalformedVersion(String),

    #[error("unparsable request target: {0}")]
    MisdirectedTarget(String),

    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("declared body of {length} bytes exceeds limit of {limit} bytes")]
    ContentTooLarge { length: u64, limit: u64 },
}

impl ParseError {
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::MalformedHeadline => StatusCode::URI_TOO_LONG,
            ParseError::InvalidMethod(_) => StatusCode::NOT_IMPLEMENTED,
            ParseError::MalformedVersion(_) => StatusCode::BAD_REQUEST,
            ParseError::MisdirectedTarget(_) => StatusCode::MISDIRECTED_REQUEST,
            ParseError::MalformedHeader(_) => StatusCode::BAD_REQUEST,
            ParseError::ContentTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Features rejected with a fixed 501 response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Unsupported {
    #[error("Unsupported transfer encoding")]
    TransferEncoding,

    #[error("Unsupported protocol version")]
    ProtocolVersion { major: u8, minor: u8 },
}

/// Upgrade (WebSocket / CONNECT) validation failure
///
/// The display text is sent verbatim as the plaintext response body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    #[error("websocket: upgrade requires request method GET")]
    WebSocketMethod,

    #[error("websocket: 'Upgrade' token not found in 'Connection' header")]
    MissingConnectionUpgrade,

    #[error("websocket: 'websocket' token not found in 'Upgrade' header")]
    MissingUpgradeToken,

    #[error("websocket: only version 13 is supported")]
    UnsupportedVersion,

    #[error("websocket: 'Sec-WebSocket-Key' header is missing or blank")]
    MissingKey,

    #[error("proxy: tunneling is available only for HTTP/1.x")]
    TunnelProtocol,

    #[error("proxy: tunneling requires request method CONNECT")]
    TunnelMethod,

    #[error("proxy: 'Host' header invalid, empty or not available")]
    TunnelHost,

    #[error("proxy: destination '{0}' not available for connection")]
    TunnelDial(String),
}

impl UpgradeError {
    pub fn status(&self) -> StatusCode {
        match self {
            UpgradeError::WebSocketMethod | UpgradeError::TunnelMethod => {
                StatusCode::METHOD_NOT_ALLOWED
            }
            UpgradeError::UnsupportedVersion => StatusCode::NOT_IMPLEMENTED,
            UpgradeError::TunnelProtocol
            | UpgradeError::TunnelHost
            | UpgradeError::TunnelDial(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}
