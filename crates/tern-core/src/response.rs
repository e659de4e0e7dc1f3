//! HTTP Response types
//!
//! A handler returns a [`Reply`]: either a plain [`Response`], or a response
//! followed by a transfer of the connection to a [`Hijacker`].

use crate::header::{Cookie, HeaderStore};
use crate::io::Upgraded;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::io::AsyncRead;

/// HTTP Status Code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    // 1xx Informational
    pub const CONTINUE: StatusCode = StatusCode(100);
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const PROCESSING: StatusCode = StatusCode(102);
    pub const EARLY_HINTS: StatusCode = StatusCode(103);

    // 2xx Success
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const ACCEPTED: StatusCode = StatusCode(202);
    pub const NON_AUTHORITATIVE_INFORMATION: StatusCode = StatusCode(203);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const RESET_CONTENT: StatusCode = StatusCode(205);
    pub const PARTIAL_CONTENT: StatusCode = StatusCode(206);
    pub const MULTI_STATUS: StatusCode = StatusCode(207);
    pub const ALREADY_REPORTED: StatusCode = StatusCode(208);
    pub const IM_USED: StatusCode = StatusCode(226);

    // 3xx Redirection
    pub const MULTIPLE_CHOICES: StatusCode = StatusCode(300);
    pub const MOVED_PERMANENTLY: StatusCode = StatusCode(301);
    pub const FOUND: StatusCode = StatusCode(302);
    pub const SEE_OTHER: StatusCode = StatusCode(303);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const USE_PROXY: StatusCode = StatusCode(305);
    pub const TEMPORARY_REDIRECT: StatusCode = StatusCode(307);
    pub const PERMANENT_REDIRECT: StatusCode = StatusCode(308);

    // 4xx Client Errors
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const PAYMENT_REQUIRED: StatusCode = StatusCode(402);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const NOT_ACCEPTABLE: StatusCode = StatusCode(406);
    pub const PROXY_AUTHENTICATION_REQUIRED: StatusCode = StatusCode(407);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const CONFLICT: StatusCode = StatusCode(409);
    pub const GONE: StatusCode = StatusCode(410);
    pub const LENGTH_REQUIRED: StatusCode = StatusCode(411);
    pub const PRECONDITION_FAILED: StatusCode = StatusCode(412);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const URI_TOO_LONG: StatusCode = StatusCode(414);
    pub const UNSUPPORTED_MEDIA_TYPE: StatusCode = StatusCode(415);
    pub const RANGE_NOT_SATISFIABLE: StatusCode = StatusCode(416);
    pub const EXPECTATION_FAILED: StatusCode = StatusCode(417);
    pub const IM_A_TEAPOT: StatusCode = StatusCode(418);
    pub const MISDIRECTED_REQUEST: StatusCode = StatusCode(421);
    pub const UNPROCESSABLE_ENTITY: StatusCode = StatusCode(422);
    pub const LOCKED: StatusCode = StatusCode(423);
    pub const FAILED_DEPENDENCY: StatusCode = StatusCode(424);
    pub const TOO_EARLY: StatusCode = StatusCode(425);
    pub const UPGRADE_REQUIRED: StatusCode = StatusCode(426);
    pub const PRECONDITION_REQUIRED: StatusCode = StatusCode(428);
    pub const TOO_MANY_REQUESTS: StatusCode = StatusCode(429);
    pub const REQUEST_HEADER_FIELDS_TOO_LARGE: StatusCode = StatusCode(431);
    pub const UNAVAILABLE_FOR_LEGAL_REASONS: StatusCode = StatusCode(451);

    // 5xx Server Errors
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const BAD_GATEWAY: StatusCode = StatusCode(502);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
    pub const GATEWAY_TIMEOUT: StatusCode = StatusCode(504);
    pub const HTTP_VERSION_NOT_SUPPORTED: StatusCode = StatusCode(505);
    pub const VARIANT_ALSO_NEGOTIATES: StatusCode = StatusCode(506);
    pub const INSUFFICIENT_STORAGE: StatusCode = StatusCode(507);
    pub const LOOP_DETECTED: StatusCode = StatusCode(508);
    pub const NOT_EXTENDED: StatusCode = StatusCode(510);
    pub const NETWORK_AUTHENTICATION_REQUIRED: StatusCode = StatusCode(511);

    /// Get the numeric code
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Get the reason phrase
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            102 => "Processing",
            103 => "Early Hints",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            207 => "Multi-Status",
            208 => "Already Reported",
            226 => "IM Used",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            305 => "Use Proxy",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Request Entity Too Large",
            414 => "Request URI Too Long",
            415 => "Unsupported Media Type",
            416 => "Requested Range Not Satisfiable",
            417 => "Expectation Failed",
            418 => "I'm a teapot",
            421 => "Misdirected Request",
            422 => "Unprocessable Entity",
            423 => "Locked",
            424 => "Failed Dependency",
            425 => "Too Early",
            426 => "Upgrade Required",
            428 => "Precondition Required",
            429 => "Too Many Requests",
            431 => "Request Header Fields Too Large",
            451 => "Unavailable For Legal Reasons",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            506 => "Variant Also Negotiates",
            507 => "Insufficient Storage",
            508 => "Loop Detected",
            510 => "Not Extended",
            511 => "Network Authentication Required",
            _ => "Unknown",
        }
    }

    /// Whether the code may be written on a status line (100..=599)
    pub fn is_valid(&self) -> bool {
        (100..600).contains(&self.0)
    }

    /// Whether a response with this status carries a body
    ///
    /// 1xx, 204 and the whole 3xx range are bodyless.
    pub fn has_body(&self) -> bool {
        !(self.is_informational() || self.0 == 204 || self.is_redirect())
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    /// Check if this is a success status (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    /// Check if this is a redirect status (3xx)
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.0)
    }

    /// Check if this is a client error status (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.0)
    }

    /// Check if this is a server error status (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.0)
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        StatusCode(code)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// Response body
pub enum Body {
    /// No body writer at all
    None,
    /// In-memory payload, always framed with Content-Length
    Full(Bytes),
    /// Streamed payload; without a known size the connection closes after it
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        size: Option<u64>,
    },
}

impl Body {
    pub fn is_none(&self) -> bool {
        matches!(self, Body::None)
    }

    /// Length advertised in Content-Length, when known
    pub fn size(&self) -> Option<u64> {
        match self {
            Body::None => None,
            Body::Full(b) => Some(b.len() as u64),
            Body::Stream { size, .. } => *size,
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::None => f.write_str("None"),
            Body::Full(b) => f.debug_tuple("Full").field(&b.len()).finish(),
            Body::Stream { size, .. } => f.debug_struct("Stream").field("size", size).finish(),
        }
    }
}

/// HTTP Response
#[derive(Debug)]
pub struct Response {
    /// Explicit status; the session picks 200/204 when unset
    pub status: Option<StatusCode>,
    pub headers: HeaderStore,
    pub body: Body,
}

impl Response {
    /// Header-only response with an explicit status
    pub fn new(status: StatusCode) -> Self {
        Self {
            status: Some(status),
            headers: HeaderStore::new(),
            body: Body::None,
        }
    }

    /// Header-only response; status is chosen by the session
    pub fn empty() -> Self {
        Self {
            status: None,
            headers: HeaderStore::new(),
            body: Body::None,
        }
    }

    /// Create a 200 OK response
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// Create a text response
    pub fn text(body: impl Into<Bytes>) -> Self {
        ResponseBuilder::new(StatusCode::OK)
            .header("content-type", "text/plain; charset=utf-8")
            .body(body)
            .build()
    }

    /// Create an HTML response
    pub fn html(body: impl Into<Bytes>) -> Self {
        ResponseBuilder::new(StatusCode::OK)
            .header("content-type", "text/html; charset=utf-8")
            .body(body)
            .build()
    }

    /// Create a JSON response
    pub fn json(body: impl Into<Bytes>) -> Self {
        ResponseBuilder::new(StatusCode::OK)
            .header("content-type", "application/json")
            .body(body)
            .build()
    }

    /// Streamed body read from `reader`
    ///
    /// With `size == None` the response is not length-delimited and the
    /// connection is closed once the stream is drained.
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static, size: Option<u64>) -> Self {
        Self {
            status: Some(StatusCode::OK),
            headers: HeaderStore::new(),
            body: Body::Stream {
                reader: Box::new(reader),
                size,
            },
        }
    }

    /// Create a redirect response (307, or 308 when permanent)
    pub fn redirect(location: &str, permanent: bool) -> Self {
        let status = if permanent {
            StatusCode::PERMANENT_REDIRECT
        } else {
            StatusCode::TEMPORARY_REDIRECT
        };
        ResponseBuilder::new(status).header("location", location).build()
    }

    /// 101 response that precedes a protocol switch
    pub fn switching_protocols(protocol: &str) -> Self {
        ResponseBuilder::new(StatusCode::SWITCHING_PROTOCOLS)
            .header("Upgrade", protocol)
            .header("Connection", "Upgrade")
            .build()
    }

    /// Create a 404 Not Found response
    pub fn not_found() -> Self {
        ResponseBuilder::new(StatusCode::NOT_FOUND)
            .header("content-type", "text/plain; charset=utf-8")
            .body("Not Found")
            .build()
    }

    /// Plaintext error response with the given status
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        ResponseBuilder::new(status)
            .header("content-type", "text/plain; charset=utf-8")
            .body(message.into())
            .build()
    }

    /// Get a header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Set a header; see [`HeaderStore::set`]
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> crate::Result<()> {
        self.headers.set(name, value)
    }

    pub fn set_cookie(&mut self, cookie: Cookie) -> crate::Result<()> {
        self.headers.set_cookie(cookie)
    }

    /// Fill in framing headers derived from the body
    ///
    /// Runs once, right before the head is written. Headers the handler set
    /// explicitly are left alone.
    pub fn prepare(&mut self) {
        let default_type = match &self.body {
            Body::None => return,
            Body::Full(_) => "text/plain; charset=utf-8",
            Body::Stream { .. } => "application/octet-stream",
        };
        if let Some(size) = self.body.size() {
            self.headers
                .insert_canonical("Content-Length".to_string(), size.to_string());
        }
        if !self.headers.has("Content-Type") {
            self.headers
                .insert_canonical("Content-Type".to_string(), default_type.to_string());
        }
    }

    /// Whether the body is not length-delimited
    pub fn is_unframed(&self) -> bool {
        matches!(self.body, Body::Stream { size: None, .. })
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::empty()
    }
}

/// Builder for constructing responses
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    /// Create a new builder
    pub fn new(status: StatusCode) -> Self {
        Self {
            response: Response::new(status),
        }
    }

    /// Set status code
    pub fn status(mut self, status: StatusCode) -> Self {
        self.response.status = Some(status);
        self
    }

    /// Add a header; invalid names or values are dropped
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        if let Err(e) = self.response.headers.set(name, value) {
            tracing::warn!(header = name, error = %e, "dropping response header");
        }
        self
    }

    pub fn cookie(mut self, cookie: Cookie) -> Self {
        if let Err(e) = self.response.headers.set_cookie(cookie) {
            tracing::warn!(error = %e, "dropping response cookie");
        }
        self
    }

    /// Set body
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.response.body = Body::Full(body.into());
        self
    }

    /// Build the response
    pub fn build(self) -> Response {
        self.response
    }
}

/// Callback that takes over the raw connection once the response head is
/// flushed
pub type Hijacker = Box<dyn FnOnce(Upgraded) -> BoxFuture<'static, ()> + Send>;

/// What a handler hands back to the session
pub enum Reply {
    /// Write the response and keep serving the connection if possible
    Respond(Response),
    /// Write the response head, then give the connection to the hijacker
    Hijack(Response, Hijacker),
}

impl Reply {
    /// Respond, then transfer the connection to `f`
    pub fn hijack<F, Fut>(response: Response, f: F) -> Self
    where
        F: FnOnce(Upgraded) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Reply::Hijack(response, Box::new(move |io| Box::pin(f(io))))
    }

    pub fn response(&self) -> &Response {
        match self {
            Reply::Respond(r) | Reply::Hijack(r, _) => r,
        }
    }

    pub fn is_hijack(&self) -> bool {
        matches!(self, Reply::Hijack(..))
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Respond(response)
    }
}

impl From<crate::Error> for Reply {
    /// Report an error as a plaintext response (500 when it has no status)
    fn from(err: crate::Error) -> Self {
        let status = err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Reply::Respond(Response::error(status, err.response_text()))
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Respond(r) => f.debug_tuple("Respond").field(r).finish(),
            Reply::Hijack(r, _) => f.debug_tuple("Hijack").field(r).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code() {
        assert!(StatusCode::OK.is_success());
        assert!(StatusCode::FOUND.is_redirect());
        assert!(StatusCode::NOT_FOUND.is_client_error());
        assert!(StatusCode::INTERNAL_SERVER_ERROR.is_server_error());
        assert!(StatusCode::SWITCHING_PROTOCOLS.is_informational());
    }

    #[test]
    fn test_status_validity() {
        assert!(StatusCode(100).is_valid());
        assert!(StatusCode(599).is_valid());
        assert!(!StatusCode(99).is_valid());
        assert!(!StatusCode(600).is_valid());
        assert!(!StatusCode(0).is_valid());
    }

    #[test]
    fn test_has_body() {
        assert!(StatusCode::OK.has_body());
        assert!(StatusCode::NOT_FOUND.has_body());
        assert!(!StatusCode::NO_CONTENT.has_body());
        assert!(!StatusCode::CONTINUE.has_body());
        assert!(!StatusCode::NOT_MODIFIED.has_body());
        assert!(!StatusCode::TEMPORARY_REDIRECT.has_body());
    }

    #[test]
    fn test_reason_phrases() {
        assert_eq!(StatusCode::URI_TOO_LONG.reason_phrase(), "Request URI Too Long");
        assert_eq!(
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE.reason_phrase(),
            "Request Header Fields Too Large"
        );
        assert_eq!(StatusCode(299).reason_phrase(), "Unknown");
        assert_eq!(StatusCode::MISDIRECTED_REQUEST.to_string(), "421 Misdirected Request");
    }

    #[test]
    fn test_text_prepare() {
        let mut res = Response::text("Hello");
        res.prepare();
        assert_eq!(res.header("content-length"), Some("5"));
        assert_eq!(res.header("content-type"), Some("text/plain; charset=utf-8"));
    }

    #[test]
    fn test_prepare_keeps_explicit_type() {
        let mut res = Response::json(r#"{"a":1}"#);
        res.prepare();
        assert_eq!(res.header("Content-Type"), Some("application/json"));
        assert_eq!(res.header("Content-Length"), Some("7"));
    }

    #[test]
    fn test_stream_prepare() {
        let mut sized = Response::stream(&b"abc"[..], Some(3));
        sized.prepare();
        assert_eq!(sized.header("Content-Length"), Some("3"));
        assert_eq!(sized.header("Content-Type"), Some("application/octet-stream"));
        assert!(!sized.is_unframed());

        let mut unsized_ = Response::stream(&b"abc"[..], None);
        unsized_.prepare();
        assert!(!unsized_.headers.has("Content-Length"));
        assert!(unsized_.is_unframed());
    }

    #[test]
    fn test_empty_has_no_framing() {
        let mut res = Response::empty();
        res.prepare();
        assert!(res.headers.is_empty());
        assert!(res.status.is_none());
        assert!(res.body.is_none());
    }

    #[test]
    fn test_redirect() {
        let res = Response::redirect("/login", false);
        assert_eq!(res.status, Some(StatusCode::TEMPORARY_REDIRECT));
        assert_eq!(res.header("Location"), Some("/login"));
        let res = Response::redirect("/home", true);
        assert_eq!(res.status, Some(StatusCode::PERMANENT_REDIRECT));
    }

    #[test]
    fn test_builder_drops_invalid_header() {
        let res = ResponseBuilder::new(StatusCode::OK)
            .header("x-ok", "1")
            .header("set-cookie", "a=b")
            .build();
        assert_eq!(res.header("X-Ok"), Some("1"));
        assert!(!res.headers.has("Set-Cookie"));
    }

    #[test]
    fn test_reply_from_error() {
        let err = crate::Error::Upgrade(crate::error::UpgradeError::MissingKey);
        let reply = Reply::from(err);
        assert!(!reply.is_hijack());
        assert_eq!(reply.response().status, Some(StatusCode::BAD_REQUEST));
        assert!(matches!(
            &reply.response().body,
            Body::Full(b) if &b[..] == b"websocket: 'Sec-WebSocket-Key' header is missing or blank\n"
        ));

        let reply = Reply::from(crate::Error::HandlerFault("secret detail".to_string()));
        assert_eq!(reply.response().status, Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(matches!(
            &reply.response().body,
            Body::Full(b) if &b[..] == b"500 Internal Server Error\n"
        ));
    }
}
