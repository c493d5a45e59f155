//! Fallback web application: a small index page, static resources, and the
//! JSON admin API over the transaction log.
//!
//! Handles any request that neither matches an anchor nor the crafting
//! path. The app holds a narrow read-only view of the server (log handle
//! plus configuration snapshot), not the server itself.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::Config;
use crate::log::{EventLog, RequestSummary};

const INDEX_PAGE: &str = "<html><body>\
<h1>wireforge</h1>\
<p>Craft a response by encoding its specification in the path, \
for example <code>/p/200:b\"hello\"</code>.</p>\
</body></html>";

/// Read-only view handed to the application layer
#[derive(Clone)]
pub struct AppState {
    pub log: Arc<EventLog>,
    pub config: Arc<Config>,
}

pub struct App {
    state: AppState,
}

impl App {
    pub fn new(state: AppState) -> Self {
        App { state }
    }

    /// Write a complete HTTP response for `request` to `w`
    pub async fn handle<W: AsyncWrite + Unpin>(
        &self,
        request: &RequestSummary,
        w: &mut W,
    ) -> io::Result<()> {
        let path = request.path.split('?').next().unwrap_or("");
        let api = !self.state.config.noapi;
        match (request.method.as_str(), path) {
            ("GET", "/") => respond(w, 200, "OK", "text/html", INDEX_PAGE.as_bytes()).await,
            ("GET", "/api/info") if api => {
                respond_json(w, 200, &json!({ "version": env!("CARGO_PKG_VERSION") })).await
            }
            ("GET", "/api/log") if api => {
                respond_json(w, 200, &json!({ "log": self.state.log.all() })).await
            }
            ("POST", "/api/log/clear") if api => {
                self.state.log.clear();
                respond_json(w, 200, &json!({ "status": "ok" })).await
            }
            ("GET", rest) if api && rest.starts_with("/api/log/") => {
                self.log_by_id(&rest["/api/log/".len()..], w).await
            }
            ("GET", rest) if rest.starts_with("/static/") => {
                self.static_file(&rest["/static/".len()..], w).await
            }
            _ => not_found(w).await,
        }
    }

    async fn log_by_id<W: AsyncWrite + Unpin>(&self, id: &str, w: &mut W) -> io::Result<()> {
        let Ok(id) = id.parse::<u64>() else {
            return not_found(w).await;
        };
        match self.state.log.by_id(id) {
            Some(record) => respond_json(w, 200, &json!({ "log": record })).await,
            None => not_found(w).await,
        }
    }

    async fn static_file<W: AsyncWrite + Unpin>(&self, rel: &str, w: &mut W) -> io::Result<()> {
        let Some(base) = &self.state.config.staticdir else {
            return not_found(w).await;
        };
        let Some(path) = map_path(base, rel) else {
            return not_found(w).await;
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => respond(w, 200, "OK", content_type(&path), &bytes).await,
            Err(_) => not_found(w).await,
        }
    }
}

/// Join a URL path onto the static directory, refusing anything that would
/// escape it
fn map_path(base: &Path, rel: &str) -> Option<PathBuf> {
    let mut path = base.to_path_buf();
    for comp in Path::new(rel).components() {
        match comp {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
        .as_str()
    {
        "html" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

async fn not_found<W: AsyncWrite + Unpin>(w: &mut W) -> io::Result<()> {
    respond_json(w, 404, &json!({ "error": "not found" })).await
}

async fn respond_json<W: AsyncWrite + Unpin>(
    w: &mut W,
    code: u16,
    value: &serde_json::Value,
) -> io::Result<()> {
    let body = serde_json::to_vec(value).map_err(io::Error::other)?;
    let reason = if code == 200 { "OK" } else { "Not Found" };
    respond(w, code, reason, "application/json", &body).await
}

async fn respond<W: AsyncWrite + Unpin>(
    w: &mut W,
    code: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    w.write_all(head.as_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await
}
