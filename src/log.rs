//! Bounded transaction log shared by all connections

use std::collections::VecDeque;
use std::net::SocketAddr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Maximum number of records retained; older records are evicted first
pub const LOGBUF: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Crafted,
    Error,
    Timeout,
}

/// Structured view of one parsed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
    pub method: String,
    pub path: String,
    /// Header order and duplicates preserved as received
    pub headers: Vec<(String, String)>,
    pub http_version: (u8, u8),
    /// Server name negotiated during the TLS handshake, if any
    pub sni: Option<String>,
    pub remote_addr: SocketAddr,
}

/// Structured view of one served crafted response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSummary {
    pub code: u16,
    pub reason: String,
    pub header_count: usize,
    pub bytes_written: u64,
    /// The connection must close after this response
    pub disconnect: bool,
}

/// One request/response exchange or connection-level event, before insertion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TransactionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_bytes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_bytes: Option<String>,
}

impl Transaction {
    pub fn crafted(request: RequestSummary, response: ResponseSummary) -> Self {
        Transaction {
            kind: TransactionKind::Crafted,
            request: Some(request),
            response: Some(response),
            message: None,
            request_bytes: None,
            response_bytes: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Transaction {
            kind: TransactionKind::Error,
            request: None,
            response: None,
            message: Some(message.into()),
            request_bytes: None,
            response_bytes: None,
        }
    }

    pub fn timeout() -> Self {
        Transaction {
            kind: TransactionKind::Timeout,
            request: None,
            response: None,
            message: None,
            request_bytes: None,
            response_bytes: None,
        }
    }

    pub fn with_request(mut self, request: RequestSummary) -> Self {
        self.request = Some(request);
        self
    }
}

/// A transaction as stored, with its insertion id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: u64,
    pub timestamp: String,
    #[serde(flatten)]
    pub transaction: Transaction,
}

struct Inner {
    next_id: u64,
    records: VecDeque<TransactionRecord>,
}

/// Append-only ring of transaction records with monotonic ids.
///
/// Id assignment, insertion and eviction happen under a single critical
/// section, so concurrent appenders never observe duplicate ids or a log
/// larger than [`LOGBUF`]. `clear` does not reset the id counter; ids stay
/// monotonic for the server's lifetime.
pub struct EventLog {
    enabled: bool,
    inner: Mutex<Inner>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog {
            enabled: true,
            inner: Mutex::new(Inner {
                next_id: 0,
                records: VecDeque::with_capacity(LOGBUF),
            }),
        }
    }

    /// A log that records nothing. `append` returns `None`; callers must not
    /// expect an id in this mode.
    pub fn disabled() -> Self {
        EventLog {
            enabled: false,
            inner: Mutex::new(Inner {
                next_id: 0,
                records: VecDeque::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn append(&self, transaction: Transaction) -> Option<u64> {
        if !self.enabled {
            return None;
        }
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.records.push_front(TransactionRecord {
            id,
            timestamp: now_rfc3339(),
            transaction,
        });
        inner.records.truncate(LOGBUF);
        Some(id)
    }

    pub fn clear(&self) {
        self.inner.lock().records.clear();
    }

    pub fn by_id(&self, id: u64) -> Option<TransactionRecord> {
        // linear scan; the log is small and bounded
        self.inner.lock().records.iter().find(|r| r.id == id).cloned()
    }

    /// All retained records, newest first
    pub fn all(&self) -> Vec<TransactionRecord> {
        self.inner.lock().records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}
