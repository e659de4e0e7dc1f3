//! One connection: optional TLS handshake, then the HTTP/1.x keep-alive loop

use super::Shared;
use crate::error::Unsupported;
use crate::io::{Conn, Io};
use crate::parser::{self, Method};
use crate::response::{Body, Reply, Response, StatusCode};
use crate::{writer, Error, Result};
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

pub(crate) async fn serve_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    #[cfg(feature = "tls")]
    if let Some(acceptor) = shared.tls.clone() {
        return serve_tls(&shared, acceptor, stream, peer).await;
    }
    serve_http(&shared, stream, Some(peer)).await;
}

#[cfg(feature = "tls")]
async fn serve_tls(
    shared: &Shared,
    acceptor: tokio_rustls::TlsAcceptor,
    mut stream: TcpStream,
    peer: SocketAddr,
) {
    const HANDSHAKE_RECORD: u8 = 0x16;

    let limit = shared.config.handshake_timeout();
    let mut first = [0u8; 1];
    match with_deadline(limit, stream.peek(&mut first)).await {
        Ok(n) if n > 0 => {}
        _ => return,
    }

    // Plain HTTP on the TLS port: answer in plain text instead of failing
    // the handshake
    if first[0] != HANDSHAKE_RECORD && first[0].is_ascii_alphabetic() {
        tracing::debug!(%peer, "plaintext request on TLS listener");
        let _ = with_deadline(limit, stream.write_all(writer::DOWNGRADE_HTTPS)).await;
        let _ = stream.shutdown().await;
        return;
    }

    let tls = match with_deadline(limit, acceptor.accept(stream)).await {
        Ok(tls) => tls,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    let negotiated = tls
        .get_ref()
        .1
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).into_owned());
    if let Some(handler) = negotiated.as_ref().and_then(|p| shared.protocols.get(p)) {
        tracing::debug!(%peer, protocol = negotiated.as_deref(), "dispatching negotiated protocol");
        handler(crate::io::Upgraded::new(Box::new(tls), bytes::Bytes::new())).await;
        return;
    }

    serve_http(shared, tls, Some(peer)).await;
}

/// Run the keep-alive loop over an established stream
pub(crate) async fn serve_http<I: Io>(shared: &Shared, io: I, peer: Option<SocketAddr>) {
    let config = &shared.config;
    let mut conn = Conn::new(io, shared.pool.get()).with_read_size(config.read_buffer_size);
    let mut shutdown = shared.tracker.subscribe();
    let mut served = 0u64;
    // The first request's wait and read share one read deadline
    let first_deadline = deadline_in(config.read_timeout);

    loop {
        if shared.tracker.is_shutting_down() {
            break;
        }

        // Idle wait; shutdown may interrupt it since nothing is in flight
        let wait_deadline = if served == 0 {
            first_deadline
        } else {
            deadline_in(config.keep_alive_timeout())
        };
        let readable = tokio::select! {
            r = with_deadline_at(wait_deadline, conn.wait_readable()) => r,
            _ = shutdown.changed() => break,
        };
        match readable {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::trace!(?peer, error = %e, "connection idle wait ended");
                break;
            }
        }

        let read_deadline = if served == 0 {
            first_deadline
        } else {
            deadline_in(config.read_timeout)
        };
        let mut req = match with_deadline_at(read_deadline, parser::read_request(&mut conn, &config.limits)).await {
            Ok(req) => req,
            Err(e) => {
                reject(&mut conn, config.write_timeout, &e, peer).await;
                break;
            }
        };
        if req.is_h2_preface() {
            let e = Error::Unsupported(Unsupported::ProtocolVersion { major: 2, minor: 0 });
            reject(&mut conn, config.write_timeout, &e, peer).await;
            break;
        }
        req.set_remote_addr(peer);

        let method = req.method();
        let is_http11 = req.proto_at_least(1, 1);
        let client_close = req
            .header("Connection")
            .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")));

        let handler = &shared.handler;
        let outcome = AssertUnwindSafe(async move { handler.call(req).await })
            .catch_unwind()
            .await;
        let reply = match outcome {
            Ok(reply) => reply,
            Err(panic) => {
                let fault = Error::HandlerFault(panic_message(&*panic));
                tracing::error!(?peer, %method, error = %fault, "handler panicked, closing connection");
                break;
            }
        };
        served += 1;

        let (mut response, hijacker) = match reply {
            Reply::Respond(response) => (response, None),
            Reply::Hijack(response, hijacker) => (response, Some(hijacker)),
        };

        let has_body = !response.body.is_none();
        let status = finish_head(&mut response, config.server_name.as_deref(), method, has_body);
        let unframed = response.is_unframed();
        if hijacker.is_none() && (unframed || client_close) {
            response.headers.insert_canonical("Connection".to_string(), "close".to_string());
        }

        let send_body = method.can_have_response_body() && has_body;
        let written = with_deadline(
            config.write_timeout,
            write_response(conn.get_mut(), is_http11, status, response, send_body),
        )
        .await;
        if let Err(e) = written {
            tracing::debug!(?peer, error = %e, "failed to write response");
            break;
        }

        if let Some(hijack) = hijacker {
            let (io, buf) = conn.into_upgraded();
            shared.pool.put(buf);
            hijack(io).await;
            return;
        }

        if unframed || client_close {
            break;
        }
        // No body writer for a status that promises one: the peer cannot
        // tell where this response ends
        if method != Method::Head && !has_body && status.has_body() {
            break;
        }
    }

    let (mut io, buf) = conn.into_parts();
    shared.pool.put(buf);
    let _ = io.shutdown().await;
}

/// Apply default headers and status; returns the status to write
fn finish_head(response: &mut Response, server_name: Option<&str>, method: Method, has_body: bool) -> StatusCode {
    let headers = &mut response.headers;
    if let Some(name) = server_name {
        if !headers.has("Server") {
            headers.insert_canonical("Server".to_string(), name.to_string());
        }
    }
    headers.insert_canonical("Date".to_string(), httpdate::fmt_http_date(SystemTime::now()));

    let status = response.status.unwrap_or(if !method.can_have_response_body() || !has_body {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::OK
    });
    response.prepare();
    status
}

async fn write_response<I: Io>(
    out: &mut I,
    is_http11: bool,
    status: StatusCode,
    response: Response,
    send_body: bool,
) -> Result<()> {
    writer::write_head(out, is_http11, status, &response.headers).await?;
    if !send_body {
        return Ok(());
    }

    match response.body {
        Body::None => {}
        Body::Full(bytes) => out.write_all(&bytes).await?,
        Body::Stream { reader, size: Some(size) } => {
            let copied = tokio::io::copy(&mut reader.take(size), out).await?;
            if copied < size {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body stream ended after {} of {} bytes", copied, size),
                )
                .into());
            }
        }
        Body::Stream { mut reader, size: None } => {
            tokio::io::copy(&mut reader, out).await?;
        }
    }
    out.flush().await?;
    Ok(())
}

/// Answer a failed read with its canned response, if it has one
async fn reject<I: Io>(conn: &mut Conn<I>, write_timeout: Option<Duration>, error: &Error, peer: Option<SocketAddr>) {
    match error.canned_response() {
        Some(canned) => {
            tracing::debug!(?peer, error = %error, "rejecting request");
            let io = conn.get_mut();
            let _ = with_deadline(write_timeout, async {
                io.write_all(&canned).await?;
                io.flush().await
            })
            .await;
        }
        None if error.is_common_network_error() => {}
        None => tracing::debug!(?peer, error = %error, "failed to read request"),
    }
}

fn deadline_in(limit: Option<Duration>) -> Option<Instant> {
    limit.map(|limit| Instant::now() + limit)
}

/// Run `fut` under an optional timeout; expiry is a `TimedOut` I/O error
async fn with_deadline<F, T, E>(limit: Option<Duration>, fut: F) -> std::result::Result<T, E>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: From<io::Error>,
{
    with_deadline_at(deadline_in(limit), fut).await
}

async fn with_deadline_at<F, T, E>(deadline: Option<Instant>, fut: F) -> std::result::Result<T, E>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: From<io::Error>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
        },
        None => fut.await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
