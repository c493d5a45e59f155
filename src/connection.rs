//! Per-connection request loop: read, classify, route, serve, log.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, info, warn};

use crate::capture::{self, Capture};
use crate::http::{self, BodyOutcome, FirstLine};
use crate::language::{self, ParseError};
use crate::log::{RequestSummary, Transaction};
use crate::server::Server;

/// Transport-level failure; terminates the loop, never retried
enum Transport {
    Disconnect(io::Error),
    Timeout,
}

/// `(keep_reading, record)` for one request attempt
type LoopResult = Result<(bool, Option<Transaction>), Transport>;

/// Handles exactly one accepted connection, end-to-end
pub struct ConnectionHandler {
    server: Arc<Server>,
    peer: SocketAddr,
    sni: Option<String>,
}

impl ConnectionHandler {
    pub fn new(server: Arc<Server>, peer: SocketAddr, sni: Option<String>) -> Self {
        ConnectionHandler { server, peer, sni }
    }

    /// Run the request loop until the connection ends. All failure modes
    /// are absorbed here; the accept loop never sees them.
    pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: S) {
        let config = &self.server.config;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(Capture::new(read_half));
        let mut writer = Capture::new(write_half);

        loop {
            if config.logreq {
                reader.get_mut().start_log();
            }
            if config.logresp {
                writer.start_log();
            }

            let (again, transaction) = match self.handle_request(&mut reader, &mut writer).await {
                Ok(outcome) => outcome,
                Err(Transport::Timeout) => {
                    info!("read timed out");
                    self.server.add_log(Transaction::timeout());
                    return;
                }
                Err(Transport::Disconnect(err)) => {
                    info!(%err, "disconnect");
                    self.server.add_log(Transaction::error("Disconnect"));
                    return;
                }
            };

            if let Some(mut transaction) = transaction {
                if config.logreq {
                    let bytes = reader.get_mut().take_log().unwrap_or_default();
                    self.log_bytes("request", &bytes);
                    transaction.request_bytes = Some(capture::escape(&bytes));
                }
                if config.logresp {
                    let bytes = writer.take_log().unwrap_or_default();
                    self.log_bytes("response", &bytes);
                    transaction.response_bytes = Some(capture::escape(&bytes));
                }
                self.server.add_log(transaction);
            }
            if !again {
                return;
            }
        }
    }

    /// One pass of the loop: one HTTP-style exchange on a persistent
    /// connection.
    async fn handle_request<R, W>(&self, reader: &mut R, writer: &mut W) -> LoopResult
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let config = &self.server.config;

        let first = self.timed(http::read_request_line(reader)).await?;
        let (method, path, version) = match first {
            FirstLine::End => return Ok((false, None)),
            FirstLine::Malformed(line) => {
                let msg = format!("Invalid first line: {line}");
                info!("{msg}");
                return Ok((false, Some(Transaction::error(msg))));
            }
            FirstLine::Parsed {
                method,
                path,
                version,
            } => (method, path, version),
        };

        let headers = match self.timed(http::read_headers(reader)).await? {
            Some(headers) => headers,
            None => {
                info!("invalid headers");
                return Ok((false, Some(Transaction::error("Invalid headers"))));
            }
        };

        let request = RequestSummary {
            method,
            path,
            headers,
            http_version: version,
            sni: self.sni.clone(),
            remote_addr: self.peer,
        };

        match self
            .timed(http::read_body(reader, &request.headers, version))
            .await?
        {
            BodyOutcome::Read(_content) => {}
            BodyOutcome::Malformed(msg) => {
                info!("{msg}");
                return Ok((false, Some(Transaction::error(msg).with_request(request))));
            }
        }

        if let Some(spec) = self.server.anchors.matching(&request.path) {
            debug!(path = %request.path, "crafting anchor");
            let crafted = match language::parse_response(&self.server.request_settings(), spec) {
                Ok(crafted) => crafted,
                Err(err) => {
                    // anchors are validated at construction; failing here
                    // means the static directory changed underneath us
                    warn!(%err, "anchor spec failed at request time");
                    language::error_response("Error", &err.to_string())
                }
            };
            return self.serve_crafted(crafted, request, writer).await;
        }

        if !config.nocraft && request.path.starts_with(&config.craft_anchor) {
            let decoded = match urlencoding::decode(&request.path) {
                Ok(decoded) => decoded.into_owned(),
                Err(_) => request.path.clone(),
            };
            let spec = decoded
                .strip_prefix(&config.craft_anchor)
                .unwrap_or(&decoded)
                .to_string();
            debug!(%spec, "crafting spec");
            let crafted = match language::parse_response(&self.server.request_settings(), &spec) {
                Ok(crafted) => crafted,
                Err(err @ ParseError::Syntax { .. }) => {
                    info!(%err, "spec parse error");
                    language::error_response(
                        "Parse Error",
                        &format!("Error parsing response spec: {err}\n{}", err.marked()),
                    )
                }
                Err(ParseError::FileAccessDenied) => {
                    info!("file access denied");
                    language::error_response("Access Denied", "Access Denied")
                }
            };
            return self.serve_crafted(crafted, request, writer).await;
        }

        if config.noweb {
            let denied = language::error_response("Access Denied", "Access Denied");
            denied.serve(writer).await.map_err(Transport::Disconnect)?;
            return Ok((
                false,
                Some(
                    Transaction::error("Access denied: web interface disabled")
                        .with_request(request),
                ),
            ));
        }

        debug!(method = %request.method, path = %request.path, "app");
        self.server
            .app
            .handle(&request, writer)
            .await
            .map_err(Transport::Disconnect)?;
        // application-served requests are not transaction-logged
        Ok((true, None))
    }

    /// Vet a crafted response against policy, then serve it (or the
    /// substituted error page). At most one serving attempt per request.
    async fn serve_crafted<W: AsyncWrite + Unpin>(
        &self,
        crafted: language::Response,
        request: RequestSummary,
        writer: &mut W,
    ) -> LoopResult {
        if let Some(reason) = self.server.check_policy(&crafted) {
            info!(%reason, "policy rejected crafted response");
            let substitute = language::error_response(reason, reason);
            substitute
                .serve(writer)
                .await
                .map_err(Transport::Disconnect)?;
            return Ok((false, Some(Transaction::error(reason).with_request(request))));
        }

        let summary = crafted.serve(writer).await.map_err(Transport::Disconnect)?;
        let disconnect = summary.disconnect;
        Ok((!disconnect, Some(Transaction::crafted(request, summary))))
    }

    async fn timed<F, T>(&self, fut: F) -> Result<T, Transport>
    where
        F: Future<Output = io::Result<T>>,
    {
        match self.server.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(Transport::Disconnect(err)),
                Err(_) => Err(Transport::Timeout),
            },
            None => fut.await.map_err(Transport::Disconnect),
        }
    }

    fn log_bytes(&self, label: &str, data: &[u8]) {
        if self.server.config.hexdump {
            debug!("{label} bytes:\n{}", capture::hexdump(data).join("\n"));
        } else {
            debug!("{label} bytes: {}", capture::escape(data));
        }
    }
}
