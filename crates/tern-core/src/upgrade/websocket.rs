//! WebSocket handshake and message connection
//!
//! [`upgrade`] validates the handshake, answers `101 Switching Protocols`
//! and hijacks the connection into a [`WebSocket`].

use super::frame::{DecodeOptions, Frame, FrameError, Opcode};
use crate::error::UpgradeError;
use crate::io::Upgraded;
use crate::parser::Method;
use crate::request::Request;
use crate::response::{Reply, Response};
use base64ct::{Base64, Encoding};
use bytes::{Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use sha1::{Digest, Sha1};
use std::future::Future;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const DEFLATE_EXTENSION: &str = "permessage-deflate; server_no_context_takeover; client_no_context_takeover";
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// WebSocket settings
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Offer permessage-deflate when the client asks for it
    pub enable_compression: bool,
    pub max_frame_size: usize,
    /// Ceiling for a reassembled (and inflated) message
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enable_compression: false,
            max_frame_size: 1 << 20,
            max_message_size: 4 << 20,
        }
    }
}

/// Compute `Sec-WebSocket-Accept` for a client key
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::default();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID);
    Base64::encode_string(&sha1.finalize())
}

fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Check the upgrade headers; returns the client key
pub fn validate(req: &Request) -> Result<&str, UpgradeError> {
    if req.method() != Method::Get {
        return Err(UpgradeError::WebSocketMethod);
    }
    if !req.header("Connection").is_some_and(|v| has_token(v, "upgrade")) {
        return Err(UpgradeError::MissingConnectionUpgrade);
    }
    if !req
        .header("Upgrade")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
    {
        return Err(UpgradeError::MissingUpgradeToken);
    }
    if req.header("Sec-WebSocket-Version").map(str::trim) != Some("13") {
        return Err(UpgradeError::UnsupportedVersion);
    }
    match req.header("Sec-WebSocket-Key").map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(UpgradeError::MissingKey),
    }
}

/// Build the 101 response; the flag tells whether compression was agreed
pub fn handshake(req: &Request, config: &WebSocketConfig) -> Result<(Response, bool), UpgradeError> {
    let key = validate(req)?;

    let compress = config.enable_compression
        && req
            .header("Sec-WebSocket-Extensions")
            .is_some_and(|ext| ext.contains("permessage-deflate"));

    let mut response = Response::switching_protocols("websocket");
    let headers = &mut response.headers;
    headers.insert_canonical("Sec-Websocket-Accept".to_string(), accept_key(key));
    if compress {
        headers.insert_canonical("Sec-Websocket-Extensions".to_string(), DEFLATE_EXTENSION.to_string());
    }
    Ok((response, compress))
}

/// Answer a WebSocket handshake and run `handler` on the upgraded connection
///
/// A failed validation yields a plaintext 400/405/501 reply instead.
pub fn upgrade<F, Fut>(req: &Request, config: &WebSocketConfig, handler: F) -> Reply
where
    F: FnOnce(WebSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    match handshake(req, config) {
        Ok((response, compress)) => {
            let config = config.clone();
            Reply::hijack(response, move |io| handler(WebSocket::new(io, config, compress)))
        }
        Err(e) => {
            tracing::debug!(error = %e, "websocket handshake rejected");
            Reply::from(crate::Error::Upgrade(e))
        }
    }
}

/// WebSocket close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "Normal closure")
    }

    pub fn going_away() -> Self {
        Self::new(Self::GOING_AWAY, "Going away")
    }

    pub fn protocol_error() -> Self {
        Self::new(Self::PROTOCOL_ERROR, "Protocol error")
    }

    fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        Some(Self { code, reason })
    }
}

/// WebSocket message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

/// Failure on an established WebSocket
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("websocket io: {0}")]
    Io(#[from] io::Error),

    #[error("websocket protocol: {0}")]
    Protocol(#[from] FrameError),

    #[error("websocket: {0}")]
    Violation(&'static str),

    #[error("websocket: text message is not valid UTF-8")]
    InvalidUtf8,

    #[error("websocket: message exceeds {0} bytes")]
    MessageTooLarge(usize),

    #[error("websocket: compression failure: {0}")]
    Compression(String),

    #[error("websocket: connection closed")]
    Closed,
}

impl WebSocketError {
    fn close_code(&self) -> Option<u16> {
        match self {
            WebSocketError::Protocol(FrameError::TooLarge { .. }) | WebSocketError::MessageTooLarge(_) => {
                Some(CloseFrame::MESSAGE_TOO_BIG)
            }
            WebSocketError::Protocol(_) | WebSocketError::Violation(_) => Some(CloseFrame::PROTOCOL_ERROR),
            WebSocketError::InvalidUtf8 | WebSocketError::Compression(_) => Some(CloseFrame::INVALID_PAYLOAD),
            _ => None,
        }
    }
}

struct Partial {
    opcode: Opcode,
    compressed: bool,
    data: BytesMut,
}

/// Established WebSocket connection
///
/// `recv` answers pings and close frames itself; fragmented messages are
/// reassembled before they are returned.
pub struct WebSocket<S = Upgraded> {
    io: S,
    read_buf: BytesMut,
    config: WebSocketConfig,
    compress: bool,
    partial: Option<Partial>,
    close_sent: bool,
    close_received: bool,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, config: WebSocketConfig, compress: bool) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(4096),
            config,
            compress,
            partial: None,
            close_sent: false,
            close_received: false,
        }
    }

    /// Whether permessage-deflate is active
    pub fn is_compressed(&self) -> bool {
        self.compress
    }

    pub fn is_closed(&self) -> bool {
        self.close_received || self.close_sent
    }

    /// Next message; `None` once the peer is gone or the close handshake
    /// finished
    pub async fn recv(&mut self) -> Result<Option<Message>, WebSocketError> {
        loop {
            if self.close_received {
                return Ok(None);
            }
            let Some(frame) = self.read_frame().await? else {
                return Ok(None);
            };
            match self.handle_frame(frame).await {
                Ok(Some(msg)) => return Ok(Some(msg)),
                Ok(None) => continue,
                Err(e) => {
                    if let Some(code) = e.close_code() {
                        let _ = self.send_close(Some(CloseFrame::new(code, ""))).await;
                    }
                    self.close_received = true;
                    return Err(e);
                }
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>, WebSocketError> {
        let opts = DecodeOptions {
            max_frame_size: self.config.max_frame_size,
            allow_rsv1: self.compress,
            require_mask: true,
        };
        loop {
            match Frame::parse(&mut self.read_buf, &opts) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(e) => {
                    let e = WebSocketError::Protocol(e);
                    if let Some(code) = e.close_code() {
                        let _ = self.send_close(Some(CloseFrame::new(code, ""))).await;
                    }
                    self.close_received = true;
                    return Err(e);
                }
            }
            if self.io.read_buf(&mut self.read_buf).await? == 0 {
                return if self.read_buf.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
                };
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Option<Message>, WebSocketError> {
        match frame.opcode {
            Opcode::Ping => {
                self.write_frame(Frame::pong(frame.payload)).await?;
                Ok(None)
            }
            Opcode::Pong => Ok(None),
            Opcode::Close => {
                let close = CloseFrame::parse(&frame.payload);
                self.close_received = true;
                if !self.close_sent {
                    self.send_close(close.clone()).await?;
                }
                Ok(Some(Message::Close(close)))
            }
            Opcode::Text | Opcode::Binary => {
                if self.partial.is_some() {
                    return Err(WebSocketError::Violation("new message inside a fragmented one"));
                }
                let partial = Partial {
                    opcode: frame.opcode,
                    compressed: frame.rsv1,
                    data: BytesMut::from(&frame.payload[..]),
                };
                self.check_size(partial.data.len())?;
                if frame.fin {
                    return self.finish(partial).map(Some);
                }
                self.partial = Some(partial);
                Ok(None)
            }
            Opcode::Continuation => {
                let Some(mut partial) = self.partial.take() else {
                    return Err(WebSocketError::Violation("continuation without a message"));
                };
                self.check_size(partial.data.len() + frame.payload.len())?;
                partial.data.extend_from_slice(&frame.payload);
                if frame.fin {
                    return self.finish(partial).map(Some);
                }
                self.partial = Some(partial);
                Ok(None)
            }
        }
    }

    fn check_size(&self, len: usize) -> Result<(), WebSocketError> {
        if len > self.config.max_message_size {
            return Err(WebSocketError::MessageTooLarge(self.config.max_message_size));
        }
        Ok(())
    }

    fn finish(&self, partial: Partial) -> Result<Message, WebSocketError> {
        let data = if partial.compressed {
            Bytes::from(inflate(&partial.data, self.config.max_message_size)?)
        } else {
            partial.data.freeze()
        };
        match partial.opcode {
            Opcode::Text => String::from_utf8(data.to_vec())
                .map(Message::Text)
                .map_err(|_| WebSocketError::InvalidUtf8),
            _ => Ok(Message::Binary(data)),
        }
    }

    /// Send a message as a single frame
    pub async fn send(&mut self, msg: Message) -> Result<(), WebSocketError> {
        if self.close_sent {
            return Err(WebSocketError::Closed);
        }
        let frame = match msg {
            Message::Text(text) => self.data_frame(Opcode::Text, Bytes::from(text))?,
            Message::Binary(data) => self.data_frame(Opcode::Binary, data)?,
            Message::Ping(data) => Frame::ping(data),
            Message::Pong(data) => Frame::pong(data),
            Message::Close(close) => return self.send_close(close).await,
        };
        self.write_frame(frame).await
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), WebSocketError> {
        self.send(Message::Text(text.into())).await
    }

    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<(), WebSocketError> {
        self.send(Message::Binary(data.into())).await
    }

    /// Start (or answer) the close handshake
    pub async fn close(&mut self, frame: Option<CloseFrame>) -> Result<(), WebSocketError> {
        self.send_close(frame).await
    }

    fn data_frame(&self, opcode: Opcode, payload: Bytes) -> Result<Frame, WebSocketError> {
        if !self.compress {
            return Ok(Frame::new(opcode, payload));
        }
        let mut frame = Frame::new(opcode, deflate(&payload)?);
        frame.rsv1 = true;
        Ok(frame)
    }

    async fn send_close(&mut self, close: Option<CloseFrame>) -> Result<(), WebSocketError> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        let frame = match close {
            Some(close) => Frame::close(close.code, &close.reason),
            None => Frame::new(Opcode::Close, Bytes::new()),
        };
        self.write_frame(frame).await
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), WebSocketError> {
        self.io.write_all(&frame.to_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.io
    }
}

fn inflate(data: &[u8], limit: usize) -> Result<Vec<u8>, WebSocketError> {
    let mut input = Vec::with_capacity(data.len() + DEFLATE_TAIL.len());
    input.extend_from_slice(data);
    input.extend_from_slice(&DEFLATE_TAIL);

    let mut inflater = Decompress::new(false);
    let mut out = Vec::with_capacity((data.len() * 2).max(64));
    loop {
        let consumed = inflater.total_in() as usize;
        let status = inflater
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|e| WebSocketError::Compression(e.to_string()))?;
        if out.len() > limit {
            return Err(WebSocketError::MessageTooLarge(limit));
        }
        let done = inflater.total_in() as usize >= input.len() && out.len() < out.capacity();
        if done || status == Status::StreamEnd {
            return Ok(out);
        }
        out.reserve(out.capacity());
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, WebSocketError> {
    let mut deflater = Compress::new(Compression::fast(), false);
    let mut out = Vec::with_capacity(data.len() + 64);
    loop {
        let consumed = deflater.total_in() as usize;
        deflater
            .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
            .map_err(|e| WebSocketError::Compression(e.to_string()))?;
        if deflater.total_in() as usize >= data.len() && out.len() < out.capacity() {
            break;
        }
        out.reserve(out.capacity());
    }
    if out.ends_with(&DEFLATE_TAIL) {
        out.truncate(out.len() - DEFLATE_TAIL.len());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestBuilder;
    use crate::response::StatusCode;
    use tokio::io::duplex;

    fn handshake_request() -> RequestBuilder {
        RequestBuilder::new(Method::Get, "/chat")
            .header("Host", "server.example.com")
            .header("Upgrade", "websocket")
            .header("Connection", "keep-alive, Upgrade")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
    }

    fn client_frame(frame: Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Frame {
            mask: Some([1, 2, 3, 4]),
            ..frame
        }
        .encode(&mut buf);
        buf.to_vec()
    }

    async fn read_server_frame(client: &mut tokio::io::DuplexStream) -> Frame {
        let mut buf = BytesMut::new();
        let opts = DecodeOptions {
            max_frame_size: 1 << 20,
            allow_rsv1: true,
            require_mask: false,
        };
        loop {
            if let Some(frame) = Frame::parse(&mut buf, &opts).unwrap() {
                return frame;
            }
            assert!(client.read_buf(&mut buf).await.unwrap() > 0);
        }
    }

    #[test]
    fn test_accept_key() {
        // Test vector from RFC 6455
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_handshake_response() {
        let req = handshake_request().build().unwrap();
        let (res, compress) = handshake(&req, &WebSocketConfig::default()).unwrap();
        assert!(!compress);
        assert_eq!(res.status, Some(StatusCode::SWITCHING_PROTOCOLS));
        assert_eq!(res.header("Upgrade"), Some("websocket"));
        assert_eq!(res.header("Connection"), Some("Upgrade"));
        assert_eq!(res.header("Sec-WebSocket-Accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(!res.headers.has("Sec-WebSocket-Extensions"));
    }

    #[test]
    fn test_compression_needs_both_sides() {
        let config = WebSocketConfig {
            enable_compression: true,
            ..Default::default()
        };
        let req = handshake_request().build().unwrap();
        assert!(!handshake(&req, &config).unwrap().1);

        let req = handshake_request()
            .header("Sec-WebSocket-Extensions", "permessage-deflate; client_max_window_bits")
            .build()
            .unwrap();
        let (res, compress) = handshake(&req, &config).unwrap();
        assert!(compress);
        assert_eq!(res.header("Sec-WebSocket-Extensions"), Some(DEFLATE_EXTENSION));

        assert!(!handshake(&req, &WebSocketConfig::default()).unwrap().1);
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            (
                RequestBuilder::new(Method::Post, "/chat")
                    .header("Upgrade", "websocket")
                    .header("Connection", "Upgrade"),
                UpgradeError::WebSocketMethod,
            ),
            (
                handshake_request().header("Connection", "keep-alive"),
                UpgradeError::MissingConnectionUpgrade,
            ),
            (
                handshake_request().header("Upgrade", "h2c"),
                UpgradeError::MissingUpgradeToken,
            ),
            (
                handshake_request().header("Sec-WebSocket-Version", "8"),
                UpgradeError::UnsupportedVersion,
            ),
            (
                handshake_request().header("Sec-WebSocket-Key", ""),
                UpgradeError::MissingKey,
            ),
        ];
        for (builder, expected) in cases {
            let req = builder.build().unwrap();
            assert_eq!(validate(&req).unwrap_err(), expected);
        }
    }

    #[test]
    fn test_upgrade_reply_kinds() {
        let req = handshake_request().build().unwrap();
        let reply = upgrade(&req, &WebSocketConfig::default(), |_ws| async {});
        assert!(reply.is_hijack());

        let req = handshake_request().header("Sec-WebSocket-Version", "12").build().unwrap();
        let reply = upgrade(&req, &WebSocketConfig::default(), |_ws| async {});
        assert!(!reply.is_hijack());
        assert_eq!(reply.response().status, Some(StatusCode::NOT_IMPLEMENTED));
    }

    #[test]
    fn test_deflate_rfc_vector() {
        // RFC 7692 §7.2.3.1: "Hello" compressed without context takeover
        let out = inflate(&[0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00], 1024).unwrap();
        assert_eq!(out, b"Hello");
    }

    #[test]
    fn test_deflate_inflate() {
        let text = "tern tern tern tern tern tern tern tern".repeat(20);
        let packed = deflate(text.as_bytes()).unwrap();
        assert!(packed.len() < text.len());
        assert_eq!(inflate(&packed, 1 << 20).unwrap(), text.as_bytes());
        assert!(matches!(inflate(&packed, 16), Err(WebSocketError::MessageTooLarge(16))));
    }

    #[tokio::test]
    async fn test_recv_fragmented_text_and_ping() {
        let (mut client, server) = duplex(4096);
        let mut ws = WebSocket::new(server, WebSocketConfig::default(), false);

        let mut input = Vec::new();
        input.extend(client_frame(Frame {
            fin: false,
            ..Frame::text("Hel")
        }));
        input.extend(client_frame(Frame::ping("p")));
        input.extend(client_frame(Frame::new(Opcode::Continuation, "lo")));
        client.write_all(&input).await.unwrap();

        assert_eq!(ws.recv().await.unwrap(), Some(Message::Text("Hello".into())));
        let pong = read_server_frame(&mut client).await;
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(&pong.payload[..], b"p");
    }

    #[tokio::test]
    async fn test_close_is_echoed() {
        let (mut client, server) = duplex(4096);
        let mut ws = WebSocket::new(server, WebSocketConfig::default(), false);
        client.write_all(&client_frame(Frame::close(1000, "bye"))).await.unwrap();

        let msg = ws.recv().await.unwrap();
        assert_eq!(msg, Some(Message::Close(Some(CloseFrame::new(1000, "bye")))));
        assert!(ws.recv().await.unwrap().is_none());

        let echo = read_server_frame(&mut client).await;
        assert_eq!(echo.opcode, Opcode::Close);
        assert_eq!(&echo.payload[..2], &1000u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes_1007() {
        let (mut client, server) = duplex(4096);
        let mut ws = WebSocket::new(server, WebSocketConfig::default(), false);
        client
            .write_all(&client_frame(Frame::new(Opcode::Text, vec![0xffu8, 0xfe])))
            .await
            .unwrap();

        assert!(matches!(ws.recv().await, Err(WebSocketError::InvalidUtf8)));
        let close = read_server_frame(&mut client).await;
        assert_eq!(&close.payload[..2], &CloseFrame::INVALID_PAYLOAD.to_be_bytes());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_1009() {
        let (mut client, server) = duplex(4096);
        let config = WebSocketConfig {
            max_frame_size: 8,
            ..Default::default()
        };
        let mut ws = WebSocket::new(server, config, false);
        client
            .write_all(&client_frame(Frame::binary(vec![0u8; 64])))
            .await
            .unwrap();

        assert!(matches!(
            ws.recv().await,
            Err(WebSocketError::Protocol(FrameError::TooLarge { .. }))
        ));
        let close = read_server_frame(&mut client).await;
        assert_eq!(&close.payload[..2], &CloseFrame::MESSAGE_TOO_BIG.to_be_bytes());
    }

    #[tokio::test]
    async fn test_compressed_roundtrip() {
        let (mut client, server) = duplex(8192);
        let mut ws = WebSocket::new(server, WebSocketConfig::default(), true);

        let mut frame = Frame::text("");
        frame.payload = Bytes::from(deflate(b"compressed hello").unwrap());
        frame.rsv1 = true;
        client.write_all(&client_frame(frame)).await.unwrap();
        assert_eq!(ws.recv().await.unwrap(), Some(Message::Text("compressed hello".into())));

        ws.send_text("reply").await.unwrap();
        let out = read_server_frame(&mut client).await;
        assert!(out.rsv1);
        assert_eq!(inflate(&out.payload, 1024).unwrap(), b"reply");
    }

    #[tokio::test]
    async fn test_eof_ends_stream() {
        let (client, server) = duplex(64);
        drop(client);
        let mut ws = WebSocket::new(server, WebSocketConfig::default(), false);
        assert!(ws.recv().await.unwrap().is_none());
    }
}
