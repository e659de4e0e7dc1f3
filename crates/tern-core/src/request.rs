//! HTTP Request types

use crate::header::{HeaderStore, RequestHeaders};
use crate::parser::Method;
use crate::url::{parse_query, Query, Url};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::OnceLock;
use thiserror::Error;

pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const MULTIPART_FORM: &str = "multipart/form-data";

/// Why a request body could not be read as a form
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("request has no body")]
    NoBody,

    #[error("content type '{0}' is not a urlencoded form")]
    NotUrlEncoded(String),

    #[error("multipart forms must be decoded from the raw body")]
    Multipart,
}

/// Parsed HTTP/1.x request
///
/// Built fresh for every request read from a connection.
#[derive(Debug)]
pub struct Request {
    method: Method,
    major: u8,
    minor: u8,
    target: String,
    url: Url,
    headers: RequestHeaders,
    body: Option<Bytes>,
    form: OnceLock<Query>,
    extensions: http::Extensions,
    remote_addr: Option<SocketAddr>,
}

impl Request {
    pub(crate) fn from_parts(
        method: Method,
        (major, minor): (u8, u8),
        target: String,
        url: Url,
        headers: HeaderStore,
        body: Option<Bytes>,
    ) -> Self {
        Self {
            method,
            major,
            minor,
            target,
            url,
            headers: RequestHeaders::new(headers),
            body,
            form: OnceLock::new(),
            extensions: http::Extensions::new(),
            remote_addr: None,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Protocol version as (major, minor)
    pub fn version(&self) -> (u8, u8) {
        (self.major, self.minor)
    }

    pub fn proto_at_least(&self, major: u8, minor: u8) -> bool {
        self.major > major || (self.major == major && self.minor >= minor)
    }

    pub fn proto_no_higher(&self, major: u8, minor: u8) -> bool {
        self.major < major || (self.major == major && self.minor <= minor)
    }

    /// Request-target exactly as received
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Decoded path
    pub fn path(&self) -> &str {
        &self.url.path
    }

    pub fn headers(&self) -> &RequestHeaders {
        &self.headers
    }

    /// Get a header value (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers.cookie(name)
    }

    /// Query string parameters
    pub fn query_params(&self) -> Query {
        self.url.query_params()
    }

    /// Body bytes, present only for body-carrying methods with a positive
    /// Content-Length
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn take_body(&mut self) -> Option<Bytes> {
        self.body.take()
    }

    /// Decode a urlencoded body; parsed once, then cached
    pub fn form(&self) -> Result<&Query, FormError> {
        if let Some(form) = self.form.get() {
            return Ok(form);
        }
        let body = self.body.as_ref().ok_or(FormError::NoBody)?;
        match self.headers.content_type() {
            Some(FORM_URLENCODED) => {}
            Some(MULTIPART_FORM) => return Err(FormError::Multipart),
            other => return Err(FormError::NotUrlEncoded(other.unwrap_or_default().to_string())),
        }
        let text = String::from_utf8_lossy(body);
        Ok(self.form.get_or_init(|| parse_query(&text)))
    }

    /// Boundary of a multipart body, for an external multipart decoder
    pub fn multipart_boundary(&self) -> Option<&str> {
        match self.headers.content_type() {
            Some(MULTIPART_FORM) => self.headers.media_param("boundary").filter(|b| !b.is_empty()),
            _ => None,
        }
    }

    /// Per-request values shared between handler layers
    pub fn extensions(&self) -> &http::Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.extensions
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub(crate) fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    /// `PRI * HTTP/2.0`, the HTTP/2 connection preface
    pub fn is_h2_preface(&self) -> bool {
        self.method == Method::Pri && self.major == 2 && self.minor == 0
    }
}

/// Builder for requests constructed outside the wire parser
pub struct RequestBuilder {
    method: Method,
    version: (u8, u8),
    target: String,
    headers: HeaderStore,
    body: Option<Bytes>,
    remote_addr: Option<SocketAddr>,
}

impl RequestBuilder {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            version: (1, 1),
            target: target.into(),
            headers: HeaderStore::new(),
            body: None,
            remote_addr: None,
        }
    }

    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.version = (major, minor);
        self
    }

    /// Add a header; invalid names or values are dropped
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        if let Err(e) = self.headers.set(name, value) {
            tracing::debug!(header = name, error = %e, "dropping request header");
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn build(self) -> crate::Result<Request> {
        let url = Url::parse(&self.target)?;
        let mut req = Request::from_parts(
            self.method,
            self.version,
            self.target,
            url,
            self.headers,
            self.body,
        );
        req.set_remote_addr(self.remote_addr);
        Ok(req)
    }
}
