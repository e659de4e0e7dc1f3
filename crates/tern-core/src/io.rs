//! Connection I/O: bounded line reads over a pooled buffer, and the raw
//! stream handed to hijackers.

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Anything a session can run over (TCP, TLS, in-memory duplex)
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Io for T {}

const MIN_READ: usize = 1024;

/// Buffered connection
///
/// Bytes read past the current request stay in `buf` and are seen by the
/// next read, so pipelined input is never lost.
pub struct Conn<I> {
    io: I,
    buf: BytesMut,
    read_size: usize,
}

impl<I> Conn<I>
where
    I: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: I, buf: BytesMut) -> Self {
        Self {
            io,
            buf,
            read_size: 4096,
        }
    }

    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size.max(MIN_READ);
        self
    }

    pub fn get_mut(&mut self) -> &mut I {
        &mut self.io
    }

    /// Bytes read from the socket but not consumed yet
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(self.read_size);
        self.io.read_buf(&mut self.buf).await
    }

    /// Read one line, stripping the trailing CRLF (or bare LF)
    ///
    /// Returns `Ok(None)` when the line content grows past `limit` bytes.
    /// EOF before a full line is an `UnexpectedEof` error.
    pub async fn read_line(&mut self, limit: usize) -> io::Result<Option<Bytes>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = memchr::memchr(b'\n', &self.buf[scanned..]) {
                let end = scanned + pos;
                let mut line = self.buf.split_to(end + 1);
                line.truncate(end);
                if line.last() == Some(&b'\r') {
                    line.truncate(end - 1);
                }
                if line.len() > limit {
                    return Ok(None);
                }
                return Ok(Some(line.freeze()));
            }

            // A trailing CR may still belong to the terminator
            if self.buf.len() > limit.saturating_add(1) {
                return Ok(None);
            }
            scanned = self.buf.len();

            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    /// Read exactly `n` bytes
    pub async fn read_exact_bytes(&mut self, n: usize) -> io::Result<Bytes> {
        while self.buf.len() < n {
            self.buf.reserve(n - self.buf.len());
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Wait until at least one byte is available; `false` on clean EOF
    pub async fn wait_readable(&mut self) -> io::Result<bool> {
        if !self.buf.is_empty() {
            return Ok(true);
        }
        Ok(self.fill().await? > 0)
    }

    pub fn into_parts(self) -> (I, BytesMut) {
        (self.io, self.buf)
    }
}

impl<I: Io> Conn<I> {
    /// Hand the raw stream over, along with whatever is still buffered
    pub fn into_upgraded(self) -> (Upgraded, BytesMut) {
        let (io, mut buf) = self.into_parts();
        let pending = buf.split().freeze();
        (Upgraded::new(Box::new(io), pending), buf)
    }
}

/// Raw connection owned by a hijacker
///
/// Reads drain bytes the session had already buffered before touching the
/// socket.
pub struct Upgraded {
    io: Box<dyn Io>,
    read_buf: Bytes,
}

impl Upgraded {
    pub fn new(io: Box<dyn Io>, read_buf: Bytes) -> Self {
        Self { io, read_buf }
    }
}

impl std::fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgraded")
            .field("buffered", &self.read_buf.len())
            .finish()
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.read_buf.is_empty() {
            let n = this.read_buf.len().min(buf.remaining());
            buf.put_slice(&this.read_buf[..n]);
            this.read_buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Pool of read buffers shared by all sessions of a server
///
/// Buffers are cleared before they go back in; a live buffer is never
/// shared between sessions.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            buffer_size,
            max_pooled,
        }
    }

    pub fn get(&self) -> BytesMut {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        // Oversized buffers (a large body went through) are not kept
        if buf.capacity() > self.buffer_size * 16 {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    pub fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(4096, 1024)
    }
}
