//! TLS termination: HTTPS requests, plaintext downgrade, ALPN dispatch and
//! handshake failures.

#![cfg(feature = "tls")]

use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tern_core::{writer, Request, Response, Server, ServerBuilder, ServerConfig, TlsConfig, Upgraded};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

mod common;

fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

fn tls_config() -> TlsConfig {
    TlsConfig::new(fixture("cert.pem"), fixture("key.pem"))
}

fn connector(alpn: &[&[u8]]) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for cert in tern_core::load_certs(fixture("ca.pem")).unwrap() {
        roots.add(cert).unwrap();
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    TlsConnector::from(Arc::new(config))
}

async fn connect_tls(running: &common::Running, alpn: &[&[u8]]) -> TlsStream<TcpStream> {
    let stream = common::connect(running.addr).await;
    let name = ServerName::try_from("localhost").unwrap();
    connector(alpn).connect(name, stream).await.unwrap()
}

async fn secure(req: Request) -> Response {
    Response::text(format!("secure {}", req.path()))
}

fn https(handler_calls: Arc<AtomicU32>) -> ServerBuilder {
    Server::builder(move |req: Request| {
        handler_calls.fetch_add(1, Ordering::SeqCst);
        secure(req)
    })
    .tls(tls_config())
}

#[tokio::test]
async fn test_https_request() {
    let running = common::start(Server::builder(secure).tls(tls_config())).await;
    let mut stream = connect_tls(&running, &[b"http/1.1"]).await;
    assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

    for path in ["/a", "/b"] {
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let res = common::read_response(&mut stream).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.text(), format!("secure {}", path));
    }
}

#[tokio::test]
async fn test_https_without_alpn() {
    let running = common::start(Server::builder(secure).tls(tls_config())).await;
    let mut stream = connect_tls(&running, &[]).await;

    stream
        .write_all(b"GET /plain HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let res = common::read_response(&mut stream).await;
    assert_eq!(res.text(), "secure /plain");
}

#[tokio::test]
async fn test_plaintext_request_gets_downgrade_response() {
    let calls = Arc::new(AtomicU32::new(0));
    let running = common::start(https(Arc::clone(&calls))).await;
    let mut stream = common::connect(running.addr).await;

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let out = common::read_until_close(&mut stream).await;

    assert_eq!(out, writer::DOWNGRADE_HTTPS);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_alpn_dispatches_to_protocol_handler() {
    let builder = Server::builder(secure)
        .tls(tls_config())
        .next_protocol("tern-echo", |mut io: Upgraded| async move {
            let mut buf = [0u8; 4];
            if io.read_exact(&mut buf).await.is_ok() {
                let _ = io.write_all(b"echo:").await;
                let _ = io.write_all(&buf).await;
                let _ = io.shutdown().await;
            }
        });
    let running = common::start(builder).await;

    let mut stream = connect_tls(&running, &[b"tern-echo"]).await;
    assert_eq!(stream.get_ref().1.alpn_protocol(), Some(&b"tern-echo"[..]));
    stream.write_all(b"ping").await.unwrap();
    let out = common::read_until_close(&mut stream).await;
    assert_eq!(out, b"echo:ping");

    // The same listener still speaks HTTP/1.1 to other clients
    let mut stream = connect_tls(&running, &[b"http/1.1"]).await;
    stream
        .write_all(b"GET /h1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let res = common::read_response(&mut stream).await;
    assert_eq!(res.text(), "secure /h1");
}

#[tokio::test]
async fn test_failed_handshake_closes_quietly() {
    let calls = Arc::new(AtomicU32::new(0));
    let running = common::start(https(Arc::clone(&calls))).await;

    // A TLS record header followed by a body that is not a ClientHello,
    // then bytes that are neither TLS nor an HTTP method
    let garbage: [&[u8]; 2] = [
        &[0x16, 0x03, 0x01, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef],
        &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07],
    ];
    for bytes in garbage {
        let mut stream = common::connect(running.addr).await;
        stream.write_all(bytes).await.unwrap();
        let out = tokio::time::timeout(Duration::from_secs(5), common::read_until_close(&mut stream))
            .await
            .unwrap();
        assert!(!out.windows(5).any(|w| w == b"HTTP/"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The listener is unaffected
    let mut stream = connect_tls(&running, &[b"http/1.1"]).await;
    stream
        .write_all(b"GET /after HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let res = common::read_response(&mut stream).await;
    assert_eq!(res.text(), "secure /after");
}

#[tokio::test]
async fn test_silent_client_hits_handshake_deadline() {
    let config = ServerConfig::default().with_read_timeout(Duration::from_millis(200));
    let running = common::start(Server::builder(secure).config(config).tls(tls_config())).await;
    let mut stream = common::connect(running.addr).await;

    let out = tokio::time::timeout(Duration::from_secs(5), common::read_until_close(&mut stream))
        .await
        .unwrap();
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_bad_certificate_path_fails_build() {
    let result = Server::builder(secure)
        .tls(TlsConfig::new(fixture("missing.pem"), fixture("key.pem")))
        .build();
    assert!(matches!(result, Err(tern_core::Error::Tls(_))));
}
