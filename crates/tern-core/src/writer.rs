//! Response head serialization
//!
//! Wire layout: status line, one `Name: value` line per header, one
//! `Set-Cookie` line per cookie, then the blank line.

use crate::header::HeaderStore;
use crate::response::StatusCode;
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Raw reply for a plaintext request that reached a TLS listener
pub const DOWNGRADE_HTTPS: &[u8] =
    b"HTTP/1.0 400 Bad Request\r\n\r\nClient sent an HTTP request to an HTTPS server.\n";

/// Serialize a response head into `buf`
///
/// Invalid status codes are written as 200 OK.
pub fn encode_head(buf: &mut BytesMut, is_http11: bool, status: StatusCode, headers: &HeaderStore) {
    let status = if status.is_valid() { status } else { StatusCode::OK };

    buf.put_slice(if is_http11 { b"HTTP/1.1 " } else { b"HTTP/1.0 " });
    buf.put_slice(status.as_u16().to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.reason_phrase().as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in headers.iter() {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    for cookie in headers.cookies() {
        buf.put_slice(b"Set-Cookie: ");
        buf.put_slice(cookie.to_header_value().as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
}

/// Write a response head and flush it; returns the number of bytes written
pub async fn write_head<W>(
    writer: &mut W,
    is_http11: bool,
    status: StatusCode,
    headers: &HeaderStore,
) -> Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(256);
    encode_head(&mut buf, is_http11, status, headers);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(buf.len())
}

/// Self-contained error response that ends the connection
pub(crate) fn canned(status: StatusCode, text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + text.len());
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_u16().to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.reason_phrase().as_bytes());
    buf.put_slice(b"\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: ");
    buf.put_slice(text.len().to_string().as_bytes());
    buf.put_slice(b"\r\nConnection: close\r\n\r\n");
    buf.put_slice(text.as_bytes());
    buf.freeze()
}
