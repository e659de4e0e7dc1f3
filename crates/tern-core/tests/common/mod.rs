//! Shared helpers: start a server on an ephemeral port and speak raw HTTP.

#![allow(dead_code)]

use std::net::SocketAddr;
use tern_core::{Server, ServerBuilder};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub struct Running {
    pub server: Server,
    pub addr: SocketAddr,
    pub task: JoinHandle<tern_core::Result<()>>,
}

pub async fn start(builder: ServerBuilder) -> Running {
    let server = builder.build().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };
    Running { server, addr, task }
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

/// One parsed response: head text and body bytes
#[derive(Debug)]
pub struct RawResponse {
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn status(&self) -> u16 {
        self.head
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read the head byte by byte so nothing past it is consumed
pub async fn read_head<R: AsyncRead + Unpin>(stream: &mut R) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed inside response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Read one Content-Length framed response
pub async fn read_response<R: AsyncRead + Unpin>(stream: &mut R) -> RawResponse {
    let head = read_head(stream).await;
    let mut response = RawResponse { head, body: Vec::new() };
    if let Some(len) = response.header("Content-Length").and_then(|v| v.parse::<usize>().ok()) {
        response.body = vec![0u8; len];
        stream.read_exact(&mut response.body).await.unwrap();
    }
    response
}

/// Read until the server closes; a reset after the data counts as closed
pub async fn read_until_close<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return out,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
}
