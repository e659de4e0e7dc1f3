//! End-to-end tests for the HTTP/1.x session over real sockets.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tern_core::{Error, Request, Response, Server, ServerConfig};
use tokio::io::AsyncWriteExt;

mod common;

async fn describe(req: Request) -> Response {
    Response::text(format!(
        "{} {} host={} q={}",
        req.method(),
        req.path(),
        req.header("Host").unwrap_or("-"),
        req.query_params().get("q").unwrap_or("-"),
    ))
}

#[tokio::test]
async fn test_get_request_scenario() {
    let running = common::start(Server::builder(describe)).await;
    let mut stream = common::connect(running.addr).await;

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let res = common::read_response(&mut stream).await;

    assert_eq!(res.status(), 200);
    assert_eq!(res.text(), "GET /index.html host=example.com q=-");
    assert_eq!(res.header("Server"), Some("tern"));
    assert!(res.header("Date").is_some());
}

#[tokio::test]
async fn test_keep_alive_reuses_connection() {
    let running = common::start(Server::builder(describe)).await;
    let mut stream = common::connect(running.addr).await;

    for i in 0..3 {
        let request = format!("GET /item?q={} HTTP/1.1\r\nHost: local\r\n\r\n", i);
        stream.write_all(request.as_bytes()).await.unwrap();
        let res = common::read_response(&mut stream).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.text(), format!("GET /item host=local q={}", i));
    }
}

#[tokio::test]
async fn test_host_rewritten_from_absolute_target() {
    let running = common::start(Server::builder(describe)).await;
    let mut stream = common::connect(running.addr).await;

    stream
        .write_all(b"GET http://origin.test:8080/p HTTP/1.1\r\nHost: bad host!\r\n\r\n")
        .await
        .unwrap();
    let res = common::read_response(&mut stream).await;
    assert_eq!(res.text(), "GET /p host=origin.test:8080 q=-");
}

#[tokio::test]
async fn test_transfer_encoding_is_501() {
    let running = common::start(Server::builder(describe)).await;
    let mut stream = common::connect(running.addr).await;

    stream
        .write_all(b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await
        .unwrap();
    let res = common::read_response(&mut stream).await;

    assert_eq!(res.status(), 501);
    assert_eq!(res.header("Connection"), Some("close"));
    assert_eq!(res.text(), "501 Unsupported transfer encoding\n");
    assert!(common::read_until_close(&mut stream).await.is_empty());
}

#[tokio::test]
async fn test_oversized_headline_is_431() {
    let running = common::start(Server::builder(describe)).await;
    let mut stream = common::connect(running.addr).await;

    let request = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(2100));
    stream.write_all(request.as_bytes()).await.unwrap();

    let out = String::from_utf8(common::read_until_close(&mut stream).await).unwrap();
    assert!(out.starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"));
    assert!(out.ends_with("431 Request Header Fields Too Large\n"));
}

#[tokio::test]
async fn test_unknown_method_is_501() {
    let running = common::start(Server::builder(describe)).await;
    let mut stream = common::connect(running.addr).await;

    stream.write_all(b"BREW /pot HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let res = common::read_response(&mut stream).await;
    assert_eq!(res.status(), 501);
}

#[tokio::test]
async fn test_post_body_and_cookies() {
    let running = common::start(Server::builder(|req: Request| async move {
        let form = req.form().map(|f| f.get("name").unwrap_or("").to_string());
        let session = req.cookie("session").unwrap_or("-").to_string();
        let mut res = Response::text(format!("{}|{}", form.unwrap_or_default(), session));
        res.set_cookie(tern_core::Cookie::new("seen", "1").path("/").http_only())
            .unwrap();
        res
    }))
    .await;
    let mut stream = common::connect(running.addr).await;

    stream
        .write_all(
            b"POST /form HTTP/1.1\r\nHost: x\r\nCookie: session=abc; theme=dark\r\n\
              Content-Type: application/x-www-form-urlencoded\r\nContent-Length: 14\r\n\r\nname=tern+core",
        )
        .await
        .unwrap();
    let res = common::read_response(&mut stream).await;

    assert_eq!(res.text(), "tern core|abc");
    assert_eq!(res.header("Set-Cookie"), Some("seen=1; Path=/; HttpOnly"));
}

#[tokio::test]
async fn test_handler_panic_closes_connection_only() {
    let running = common::start(Server::builder(|req: Request| async move {
        if req.path() == "/panic" {
            panic!("handler failure");
        }
        Response::text("alive")
    }))
    .await;

    let mut stream = common::connect(running.addr).await;
    stream.write_all(b"GET /panic HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    assert!(common::read_until_close(&mut stream).await.is_empty());

    // The server keeps serving other connections
    let mut stream = common::connect(running.addr).await;
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let res = common::read_response(&mut stream).await;
    assert_eq!(res.text(), "alive");
}

#[tokio::test]
async fn test_addr_filter_rejects_before_reading() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&calls);
    let builder = Server::builder(move |_req: Request| {
        seen.fetch_add(1, Ordering::SeqCst);
        async { Response::text("served") }
    })
    .addr_filter(|peer| !peer.ip().is_loopback());
    let running = common::start(builder).await;

    let mut stream = common::connect(running.addr).await;
    let _ = stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(common::read_until_close(&mut stream).await.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_graceful_shutdown_closes_idle_connections() {
    let running = common::start(Server::builder(describe)).await;

    let mut idle = common::connect(running.addr).await;
    idle.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    let res = common::read_response(&mut idle).await;
    assert_eq!(res.status(), 200);

    let drained = running
        .server
        .graceful_shutdown(Some(Duration::from_secs(5)))
        .await;
    assert!(drained);
    assert_eq!(running.server.tracker().count(), 0);

    let result = running.task.await.unwrap();
    assert!(matches!(result, Err(Error::ServerClosed)));
    assert!(common::read_until_close(&mut idle).await.is_empty());
}

#[tokio::test]
async fn test_read_timeout_closes_stalled_client() {
    let config = ServerConfig::default().with_read_timeout(Duration::from_millis(100));
    let running = common::start(Server::builder(describe).config(config)).await;

    let mut stream = common::connect(running.addr).await;
    stream.write_all(b"GET / HTTP/1.1\r\nHost:").await.unwrap();

    let out = tokio::time::timeout(Duration::from_secs(5), common::read_until_close(&mut stream))
        .await
        .unwrap();
    assert!(out.is_empty());
}
