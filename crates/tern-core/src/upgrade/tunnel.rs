//! CONNECT tunneling

use crate::error::UpgradeError;
use crate::parser::Method;
use crate::request::Request;
use crate::response::{Reply, Response, StatusCode};
use crate::url::Url;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound for reaching the tunnel destination
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Destination (`host:port`) of a CONNECT request
pub fn destination(req: &Request) -> Result<String, UpgradeError> {
    if !req.proto_no_higher(1, 1) {
        return Err(UpgradeError::TunnelProtocol);
    }
    if req.method() != Method::Connect {
        return Err(UpgradeError::TunnelMethod);
    }

    let host = match req.header("Host").map(str::trim) {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => req.url().authority(),
    };
    match Url::parse(&host) {
        Ok(url) if !url.host.is_empty() && url.port > 0 && url.path.is_empty() => Ok(host),
        _ => Err(UpgradeError::TunnelHost),
    }
}

/// Dial the CONNECT destination and hijack the connection into a tunnel
///
/// Answers 502 when the destination cannot be reached within
/// [`DIAL_TIMEOUT`].
pub async fn connect(req: &Request) -> Reply {
    connect_with_timeout(req, DIAL_TIMEOUT).await
}

pub async fn connect_with_timeout(req: &Request, timeout: Duration) -> Reply {
    let upstream = match destination(req) {
        Ok(addr) => dial(&addr, timeout).await,
        Err(e) => Err(e),
    };
    match upstream {
        Ok(upstream) => Reply::hijack(Response::new(StatusCode::OK), move |client| async move {
            pump(client, upstream).await;
        }),
        Err(e) => {
            tracing::debug!(error = %e, "tunnel refused");
            Reply::from(crate::Error::Upgrade(e))
        }
    }
}

async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream, UpgradeError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => {
            tracing::debug!(%addr, error = %e, "tunnel dial failed");
            Err(UpgradeError::TunnelDial(addr.to_string()))
        }
        Err(_) => {
            tracing::debug!(%addr, "tunnel dial timed out");
            Err(UpgradeError::TunnelDial(addr.to_string()))
        }
    }
}

/// Copy bytes both ways until either side finishes, then close both
pub async fn pump<A, B>(client: A, upstream: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    tokio::select! {
        r = tokio::io::copy(&mut client_read, &mut upstream_write) => {
            if let Err(e) = r {
                tracing::debug!(error = %e, "tunnel client side ended");
            }
        }
        r = tokio::io::copy(&mut upstream_read, &mut client_write) => {
            if let Err(e) = r {
                tracing::debug!(error = %e, "tunnel upstream side ended");
            }
        }
    }

    let _ = upstream_write.shutdown().await;
    let _ = client_write.shutdown().await;
}
