//! Wire-level byte capture for request/response logging.
//!
//! Capture is a side channel only: bytes are forwarded to the underlying
//! stream half untouched, and a copy lands in the capture buffer while a
//! log is active.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pin_project! {
    pub struct Capture<T> {
        #[pin]
        inner: T,
        log: Option<Vec<u8>>,
    }
}

impl<T> Capture<T> {
    pub fn new(inner: T) -> Self {
        Capture { inner, log: None }
    }

    /// Begin capturing, discarding any previous capture
    pub fn start_log(&mut self) {
        self.log = Some(Vec::new());
    }

    /// Stop capturing and return what was collected
    pub fn take_log(&mut self) -> Option<Vec<u8>> {
        self.log.take()
    }
}

impl<T: AsyncRead> AsyncRead for Capture<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if let Some(log) = this.log {
                    log.extend_from_slice(&buf.filled()[before..]);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<T: AsyncWrite> AsyncWrite for Capture<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if let Some(log) = this.log {
                    log.extend_from_slice(&buf[..n]);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Escape unprintable bytes for textual storage in the transaction log
pub fn escape(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + data.len() / 4);
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

/// Render data as hex dump lines, 16 bytes per line
pub fn hexdump(data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| if (0x20..=0x7e).contains(&b) { b as char } else { '.' })
                .collect();
            format!("{:08x}  {:<47}  {}", i * 16, hex.join(" "), ascii)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn write_capture_tees_bytes() {
        let mut capture = Capture::new(std::io::Cursor::new(Vec::new()));
        capture.write_all(b"before").await.unwrap();
        capture.start_log();
        capture.write_all(b"during").await.unwrap();
        assert_eq!(capture.take_log().unwrap(), b"during");
        capture.write_all(b"after").await.unwrap();
        assert_eq!(capture.take_log(), None);
        assert_eq!(capture.inner.into_inner(), b"beforeduringafter");
    }

    #[tokio::test]
    async fn read_capture_tees_bytes() {
        let mut capture = Capture::new(std::io::Cursor::new(b"hello world".to_vec()));
        let mut buf = [0u8; 5];
        capture.read_exact(&mut buf).await.unwrap();
        capture.start_log();
        let mut rest = Vec::new();
        capture.read_to_end(&mut rest).await.unwrap();
        assert_eq!(capture.take_log().unwrap(), b" world");
    }

    #[test]
    fn escape_keeps_printables() {
        assert_eq!(escape(b"GET / HTTP/1.1\r\n\x00\xff"), "GET / HTTP/1.1\\r\\n\\x00\\xff");
    }

    #[test]
    fn hexdump_formats_offsets_and_ascii() {
        let lines = hexdump(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000  47 45 54"));
        assert!(lines[0].ends_with("GET / HTTP/1.1.."));
        assert!(lines[1].starts_with("00000010"));
    }
}
