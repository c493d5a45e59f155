//! Shared helpers for integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use wireforge::config::Config;
use wireforge::server::Server;

/// Start a server on an ephemeral port and return its address
pub async fn start(config: Config) -> (SocketAddr, Arc<Server>) {
    let server = Server::new(config).expect("server construction failed");
    let listener = server.bind().await.expect("bind failed");
    let addr = listener.local_addr().expect("no local address");
    tokio::spawn(Arc::clone(&server).serve(listener));
    (addr, server)
}

/// Send raw bytes, half-close, and read everything the server writes back
/// until it closes the connection.
pub async fn send_raw(addr: SocketAddr, data: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("connect failed");
    stream.write_all(data).await.expect("write failed");
    stream.shutdown().await.expect("shutdown failed");
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("read timed out")
        .expect("read failed");
    out
}

pub async fn send_raw_string(addr: SocketAddr, data: &[u8]) -> String {
    String::from_utf8_lossy(&send_raw(addr, data).await).into_owned()
}

/// Poll until the condition holds; panics after ~2 seconds
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 2s: {what}");
}
