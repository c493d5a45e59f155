//! End-to-end tests over real TCP connections: routing, policy, logging,
//! and connection lifecycle.

mod common;

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use wireforge::config::Config;
use wireforge::log::TransactionKind;

// ---------------------------------------------------------------------------
// Crafting path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crafts_response_from_path_spec() {
    let (addr, server) = common::start(Config::default()).await;

    let response = common::send_raw_string(
        addr,
        b"GET /p/200:b\"hello\" HTTP/1.1\r\nHost: test\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Length: 5\r\n"));
    assert!(response.ends_with("\r\n\r\nhello"));

    let log = server.get_log();
    assert_eq!(log.len(), 1);
    let tx = &log[0].transaction;
    assert_eq!(tx.kind, TransactionKind::Crafted);
    let request = tx.request.as_ref().unwrap();
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "/p/200:b\"hello\"");
    assert_eq!(request.sni, None);
    let summary = tx.response.as_ref().unwrap();
    assert_eq!(summary.code, 200);
    assert!(!summary.disconnect);
}

#[tokio::test]
async fn url_encoded_specs_are_decoded() {
    let (addr, _server) = common::start(Config::default()).await;
    let response =
        common::send_raw_string(addr, b"GET /p/200:b%22hi%22 HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("hi"));
}

#[tokio::test]
async fn syntax_errors_become_error_responses() {
    let (addr, server) = common::start(Config::default()).await;
    let response = common::send_raw_string(addr, b"GET /p/200:zzz HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 800 Parse Error\r\n"), "{response}");
    assert!(response.contains("Error parsing response spec"));

    // the substitution is itself recorded as a crafted transaction
    let log = server.get_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].transaction.kind, TransactionKind::Crafted);
    assert_eq!(log[0].transaction.response.as_ref().unwrap().code, 800);
}

#[tokio::test]
async fn file_specs_without_staticdir_are_denied() {
    let (addr, _server) = common::start(Config::default()).await;
    let response =
        common::send_raw_string(addr, b"GET /p/200:b<\"secret\" HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 800 Access Denied\r\n"), "{response}");
}

#[tokio::test]
async fn request_body_is_consumed_before_crafting() {
    let (addr, _server) = common::start(Config::default()).await;
    let response = common::send_raw_string(
        addr,
        b"POST /p/200:b\"ok\" HTTP/1.1\r\nContent-Length: 5\r\n\r\n12345",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("ok"));
}

// ---------------------------------------------------------------------------
// Anchors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn anchors_match_before_crafting_and_first_wins() {
    let config = Config {
        anchors: vec![
            ("^/spot".to_string(), "200:b\"first\"".to_string()),
            ("^/spot".to_string(), "200:b\"second\"".to_string()),
        ],
        ..Config::default()
    };
    let (addr, server) = common::start(config).await;

    let response = common::send_raw_string(addr, b"GET /spot HTTP/1.1\r\n\r\n").await;
    assert!(response.ends_with("first"), "{response}");
    assert_eq!(server.get_log().len(), 1);
}

// ---------------------------------------------------------------------------
// Policy gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn size_limit_substitutes_an_error_response() {
    let config = Config {
        sizelimit: Some(10),
        ..Config::default()
    };
    let (addr, server) = common::start(config).await;

    let response = common::send_raw_string(addr, b"GET /p/200:b@1000 HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 800 Response too large.\r\n"), "{response}");
    assert!(response.ends_with("Response too large."));

    let log = server.get_log();
    assert_eq!(log.len(), 1);
    let tx = &log[0].transaction;
    assert_eq!(tx.kind, TransactionKind::Error);
    assert_eq!(tx.message.as_deref(), Some("Response too large."));
    assert!(tx.request.is_some());
}

#[tokio::test]
async fn nohang_substitutes_an_error_response() {
    let config = Config {
        nohang: true,
        ..Config::default()
    };
    let (addr, _server) = common::start(config).await;

    let response =
        common::send_raw_string(addr, b"GET /p/200:b\"x\":p0,60 HTTP/1.1\r\n\r\n").await;
    assert!(response.contains("Pauses have been disabled."), "{response}");
}

// ---------------------------------------------------------------------------
// Feature toggles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn nocraft_routes_to_the_app() {
    let config = Config {
        nocraft: true,
        ..Config::default()
    };
    let (addr, server) = common::start(config).await;

    let response =
        common::send_raw_string(addr, b"GET /p/200:b\"hello\" HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
    // application-served requests are not transaction-logged
    assert!(server.get_log().is_empty());
}

#[tokio::test]
async fn noweb_serves_access_denied_and_closes() {
    let config = Config {
        noweb: true,
        ..Config::default()
    };
    let (addr, server) = common::start(config).await;

    let response = common::send_raw_string(addr, b"GET /elsewhere HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 800 Access Denied\r\n"), "{response}");

    let log = server.get_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].transaction.kind, TransactionKind::Error);
    assert_eq!(
        log[0].transaction.message.as_deref(),
        Some("Access denied: web interface disabled")
    );
}

#[tokio::test]
async fn noapi_disables_transaction_logging() {
    let config = Config {
        noapi: true,
        ..Config::default()
    };
    let (addr, server) = common::start(config).await;

    let response = common::send_raw_string(addr, b"GET /p/200:b\"x\" HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(server.get_log().is_empty());
}

// ---------------------------------------------------------------------------
// Malformed input
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_request_line_affects_only_its_connection() {
    let (addr, server) = common::start(Config::default()).await;

    // open a second connection first; it must stay usable afterwards
    let bystander = TcpStream::connect(addr).await.unwrap();

    let response = common::send_raw(addr, b"JUNK\r\n").await;
    assert!(response.is_empty(), "no response for an unparsable first line");

    common::wait_until("error record appended", || {
        server
            .get_log()
            .iter()
            .any(|r| r.transaction.kind == TransactionKind::Error)
    })
    .await;
    let log = server.get_log();
    assert_eq!(log.len(), 1);
    let message = log[0].transaction.message.as_deref().unwrap();
    assert!(message.starts_with("Invalid first line:"), "{message}");
    assert!(message.contains("JUNK"));

    // the bystander connection still works
    let mut bystander = bystander;
    bystander
        .write_all(b"GET /p/200:b\"ok\" HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    bystander.shutdown().await.unwrap();
    let mut out = Vec::new();
    bystander.read_to_end(&mut out).await.unwrap();
    assert!(String::from_utf8_lossy(&out).ends_with("ok"));
}

#[tokio::test]
async fn invalid_headers_are_recorded() {
    let (addr, server) = common::start(Config::default()).await;

    let response =
        common::send_raw(addr, b"GET / HTTP/1.1\r\nthis line has no colon\r\n\r\n").await;
    assert!(response.is_empty());

    let log = server.get_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].transaction.message.as_deref(), Some("Invalid headers"));
}

#[tokio::test]
async fn invalid_content_length_is_recorded_with_the_request() {
    let (addr, server) = common::start(Config::default()).await;

    common::send_raw(addr, b"GET / HTTP/1.1\r\nContent-Length: five\r\n\r\n").await;

    let log = server.get_log();
    assert_eq!(log.len(), 1);
    let tx = &log[0].transaction;
    assert_eq!(tx.kind, TransactionKind::Error);
    assert!(tx.message.as_deref().unwrap().contains("content-length"));
    // the request summary is built before the body read, so it is attached
    assert_eq!(tx.request.as_ref().unwrap().path, "/");
}

#[tokio::test]
async fn stray_blank_line_is_tolerated() {
    let (addr, _server) = common::start(Config::default()).await;
    let response =
        common::send_raw_string(addr, b"\r\nGET /p/200:b\"x\" HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_action_closes_mid_response() {
    let (addr, server) = common::start(Config::default()).await;

    let response = common::send_raw(addr, b"GET /p/200:b\"hello\":d10 HTTP/1.1\r\n\r\n").await;
    assert_eq!(response.len(), 10);

    let log = server.get_log();
    assert_eq!(log.len(), 1);
    let summary = log[0].transaction.response.as_ref().unwrap();
    assert!(summary.disconnect);
    assert_eq!(summary.bytes_written, 10);
}

#[tokio::test]
async fn keep_alive_serves_multiple_requests() {
    let (addr, server) = common::start(Config::default()).await;

    let response = common::send_raw_string(
        addr,
        b"GET /p/200:b\"one\" HTTP/1.1\r\n\r\nGET /p/200:b\"two\" HTTP/1.1\r\n\r\n",
    )
    .await;
    assert!(response.contains("one"));
    assert!(response.contains("two"));
    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);

    let log = server.get_log();
    assert_eq!(log.len(), 2);
    // within one connection, transactions are strictly ordered
    assert!(log[0].id > log[1].id);
}

#[tokio::test]
async fn idle_connection_times_out_and_is_recorded() {
    let config = Config {
        timeout: Some(Duration::from_millis(300)),
        ..Config::default()
    };
    let (addr, server) = common::start(config).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // an incomplete request line; the server blocks reading the rest
    stream.write_all(b"GET ").await.unwrap();

    let mut buf = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("server did not close the connection")
        .unwrap();
    assert_eq!(n, 0, "expected EOF after the idle timeout");

    let log = server.get_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].transaction.kind, TransactionKind::Timeout);
}

// ---------------------------------------------------------------------------
// Admin surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn log_api_exposes_and_clears_transactions() {
    let (addr, server) = common::start(Config::default()).await;

    common::send_raw(addr, b"GET /p/201:b\"made\" HTTP/1.1\r\n\r\n").await;
    assert_eq!(server.get_log().len(), 1);

    let response = common::send_raw_string(addr, b"GET /api/log HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("\"crafted\""), "{response}");
    assert!(response.contains("/p/201"));

    let response = common::send_raw_string(addr, b"POST /api/log/clear HTTP/1.1\r\n\r\n").await;
    assert!(response.contains("ok"));
    assert!(server.get_log().is_empty());
}

#[tokio::test]
async fn byte_capture_lands_in_the_record() {
    let config = Config {
        logreq: true,
        logresp: true,
        ..Config::default()
    };
    let (addr, server) = common::start(config).await;

    common::send_raw(addr, b"GET /p/200:b\"hey\" HTTP/1.1\r\n\r\n").await;

    let log = server.get_log();
    assert_eq!(log.len(), 1);
    let tx = &log[0].transaction;
    let request_bytes = tx.request_bytes.as_deref().unwrap();
    assert!(request_bytes.contains("GET /p/200"), "{request_bytes}");
    assert!(request_bytes.contains("\\r\\n"));
    let response_bytes = tx.response_bytes.as_deref().unwrap();
    assert!(response_bytes.contains("HTTP/1.1 200 OK"), "{response_bytes}");
    assert!(response_bytes.ends_with("hey"));
}
