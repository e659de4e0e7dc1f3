//! HTTP/1.x request head parsing
//!
//! `read_request` pulls the request line and header block off a buffered
//! connection under byte ceilings, applies the Host/Pragma rewrites and
//! reads a Content-Length body. The pure helpers below it work on byte
//! slices and are usable without a socket.

pub mod method;

pub use method::Method;

use crate::error::{Limit, ParseError, Unsupported};
use crate::header::request::parse_content_length;
use crate::header::{canonical_name, is_valid_name, is_valid_value, HeaderStore};
use crate::io::Conn;
use crate::request::Request;
use crate::url::{is_valid_host, Url};
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite};

/// Size ceilings for request parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Longest accepted request line
    pub headline_max_length: usize,
    /// Longest accepted single header line
    pub header_line_max_length: usize,
    /// Total bytes accepted for the header block
    pub header_max_size: usize,
    /// Largest accepted Content-Length
    pub content_max_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            headline_max_length: 2048,
            header_line_max_length: 8192,
            header_max_size: 1 << 20,
            content_max_size: 5 << 20,
        }
    }
}

/// Split a request line into method, target and version
///
/// The first space ends the method and the last space starts the version.
pub fn split_headline(line: &[u8]) -> std::result::Result<(&[u8], &[u8], &[u8]), ParseError> {
    let first = memchr::memchr(b' ', line).ok_or(ParseError::MalformedHeadline)?;
    let last = memchr::memrchr(b' ', line).ok_or(ParseError::MalformedHeadline)?;

    if first < 3 || last <= first + 1 || line.len() - last <= 5 {
        return Err(ParseError::MalformedHeadline);
    }
    Ok((&line[..first], &line[first + 1..last], &line[last + 1..]))
}

/// Parse `HTTP/x.y` into (major, minor)
pub fn parse_version(version: &[u8]) -> Option<(u8, u8)> {
    if version.eq_ignore_ascii_case(b"HTTP/1.1") {
        return Some((1, 1));
    }
    if version.eq_ignore_ascii_case(b"HTTP/1.0") {
        return Some((1, 0));
    }
    if version.len() != 8 || !version[..5].eq_ignore_ascii_case(b"HTTP/") || version[6] != b'.' {
        return None;
    }
    let (major, minor) = (version[5], version[7]);
    if !major.is_ascii_digit() || !minor.is_ascii_digit() {
        return None;
    }
    Some((major - b'0', minor - b'0'))
}

/// Parsed request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headline {
    pub method: Method,
    pub version: (u8, u8),
    pub target: String,
    pub url: Url,
}

/// Parse and validate a complete request line
pub fn parse_headline(line: &[u8]) -> Result<Headline> {
    let (method, target, version_raw) = split_headline(line)?;

    let method = Method::parse(method)
        .ok_or_else(|| ParseError::InvalidMethod(String::from_utf8_lossy(method).into_owned()))?;

    let version = parse_version(version_raw)
        .ok_or_else(|| ParseError::MalformedVersion(String::from_utf8_lossy(version_raw).into_owned()))?;

    match (method, version) {
        (Method::Pri, (2, 0)) => {}
        (Method::Pri, _) => return Err(ParseError::InvalidMethod("PRI".to_string()).into()),
        (_, (1, _)) => {}
        (_, (0, _)) => {
            let raw = String::from_utf8_lossy(version_raw).into_owned();
            return Err(ParseError::MalformedVersion(raw).into());
        }
        (_, (major, minor)) => {
            return Err(Error::Unsupported(Unsupported::ProtocolVersion { major, minor }));
        }
    }

    let target = std::str::from_utf8(target)
        .map_err(|_| ParseError::MisdirectedTarget(String::from_utf8_lossy(target).into_owned()))?;
    let url = Url::parse(target).map_err(|_| ParseError::MisdirectedTarget(target.to_string()))?;

    Ok(Headline {
        method,
        version,
        target: target.to_string(),
        url,
    })
}

/// Incremental header block parser, fed one line at a time
#[derive(Debug)]
pub struct HeaderBlock {
    store: HeaderStore,
    pending: Option<String>,
    size: usize,
    max_size: usize,
}

impl HeaderBlock {
    pub fn new(max_size: usize) -> Self {
        Self {
            store: HeaderStore::new(),
            pending: None,
            size: 0,
            max_size,
        }
    }

    /// Feed one line without its line terminator
    ///
    /// Header lines with characters that are not valid in a field name or
    /// value are dropped rather than failing the request.
    pub fn push_line(&mut self, line: &[u8]) -> Result<()> {
        self.size += line.len() + 2;
        if self.size > self.max_size {
            return Err(Error::LimitExceeded(Limit::HeaderBlock));
        }

        let Ok(line) = std::str::from_utf8(line) else {
            tracing::debug!("dropping non UTF-8 header line");
            self.pending = None;
            return Ok(());
        };

        // Obsolete line folding: continuation of the previous header
        if line.starts_with(' ') || line.starts_with('\t') {
            let Some(name) = self.pending.as_deref() else {
                return Err(ParseError::MalformedHeader(line.to_string()).into());
            };
            let extra = line.trim();
            if extra.is_empty() {
                return Ok(());
            }
            if is_valid_value(extra) {
                self.store.append_folded(name, extra);
            } else {
                tracing::debug!(header = name, "dropping invalid folded header value");
            }
            return Ok(());
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
        let value = value.trim();
        self.pending = None;

        if !is_valid_name(name) || !is_valid_value(value) {
            tracing::debug!(header = name, "dropping invalid header line");
            return Ok(());
        }

        let name = canonical_name(name);
        if name == crate::header::SET_COOKIE {
            tracing::debug!("dropping Set-Cookie sent by client");
            return Ok(());
        }
        self.store.insert_canonical(name.clone(), value.to_string());
        self.pending = Some(name);
        Ok(())
    }

    pub fn finish(self) -> HeaderStore {
        self.store
    }
}

/// Parse a full header block (lines separated by CRLF, no terminating blank
/// line required)
pub fn parse_headers(block: &[u8], max_size: usize) -> Result<HeaderStore> {
    let mut parser = HeaderBlock::new(max_size);
    for line in block.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }
        parser.push_line(line)?;
    }
    Ok(parser.finish())
}

/// Host / Pragma normalization and transfer-encoding rejection
pub fn apply_rewrites(headers: &mut HeaderStore, url: &Url, version: (u8, u8)) -> Result<()> {
    let authority = (!url.host.is_empty()).then(|| url.authority());

    if !headers.get("Host").is_some_and(is_valid_host) {
        match authority {
            Some(authority) => headers.insert_canonical("Host".to_string(), authority),
            None => headers.remove("Host"),
        }
    }

    let no_cache = headers
        .get("Pragma")
        .is_some_and(|p| p.trim().eq_ignore_ascii_case("no-cache"));
    if no_cache && !headers.has("Cache-Control") {
        headers.insert_canonical("Cache-Control".to_string(), "no-cache".to_string());
    }

    if version >= (1, 1) && headers.has("Transfer-Encoding") {
        return Err(Error::Unsupported(Unsupported::TransferEncoding));
    }
    Ok(())
}

/// Read one request from the connection
///
/// Bodies are read in full, bounded by `content_max_size`. A body declared
/// on a method that does not carry one is skipped so the next request
/// starts at the right byte.
pub async fn read_request<I>(conn: &mut Conn<I>, limits: &Limits) -> Result<Request>
where
    I: AsyncRead + AsyncWrite + Unpin,
{
    let line = conn
        .read_line(limits.headline_max_length)
        .await?
        .ok_or(Error::LimitExceeded(Limit::Headline))?;
    let headline = parse_headline(&line)?;

    let mut block = HeaderBlock::new(limits.header_max_size);
    loop {
        let line = conn
            .read_line(limits.header_line_max_length)
            .await?
            .ok_or(Error::LimitExceeded(Limit::HeaderLine))?;
        if line.is_empty() {
            break;
        }
        block.push_line(&line)?;
    }
    let mut headers = block.finish();
    apply_rewrites(&mut headers, &headline.url, headline.version)?;

    let length = match headers.get("Content-Length") {
        Some(raw) => parse_content_length(raw)
            .ok_or_else(|| ParseError::MalformedHeader(format!("Content-Length: {}", raw)))?,
        None => 0,
    };
    if length > limits.content_max_size {
        return Err(ParseError::ContentTooLarge {
            length,
            limit: limits.content_max_size,
        }
        .into());
    }

    let body = if length == 0 {
        None
    } else if headline.method.may_have_body() {
        Some(conn.read_exact_bytes(length as usize).await?)
    } else {
        conn.read_exact_bytes(length as usize).await?;
        None
    };

    Ok(Request::from_parts(
        headline.method,
        headline.version,
        headline.target,
        headline.url,
        headers,
        body,
    ))
}
