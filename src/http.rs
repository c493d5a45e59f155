//! Lenient HTTP request reading.
//!
//! Deliberately tolerant: any method token is accepted, header names are not
//! validated beyond the bare minimum, and malformed input is classified
//! rather than treated as fatal. The point of this server is to talk to
//! clients that are themselves being fed garbage.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound on a single line; beyond this the input is malformed
const MAX_LINE: usize = 65536;
/// Upper bound on the number of headers in one request
const MAX_HEADERS: usize = 256;

/// Outcome of reading a request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstLine {
    /// Peer closed before sending anything
    End,
    Parsed {
        method: String,
        path: String,
        version: (u8, u8),
    },
    /// The line could not be parsed; carries the offending line, quoted
    Malformed(String),
}

/// Outcome of reading a request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyOutcome {
    Read(Vec<u8>),
    Malformed(String),
}

enum Line {
    Eof,
    TooLong,
    Data(Vec<u8>),
}

async fn read_line_bounded<R: AsyncBufRead + Unpin>(r: &mut R, max: usize) -> io::Result<Line> {
    let mut line = Vec::new();
    loop {
        let (done, used) = {
            let available = r.fill_buf().await?;
            if available.is_empty() {
                // EOF; a partial line is handed back and parsing decides
                return Ok(if line.is_empty() {
                    Line::Eof
                } else {
                    Line::Data(line)
                });
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    line.extend_from_slice(&available[..=idx]);
                    (true, idx + 1)
                }
                None => {
                    line.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        r.consume(used);
        if done {
            return Ok(Line::Data(line));
        }
        if line.len() > max {
            return Ok(Line::TooLong);
        }
    }
}

/// Read one request line, skipping at most one stray blank line left over
/// from a previous exchange's terminator.
pub async fn read_request_line<R: AsyncBufRead + Unpin>(r: &mut R) -> io::Result<FirstLine> {
    let mut line = match read_line_bounded(r, MAX_LINE).await? {
        Line::Eof => return Ok(FirstLine::End),
        Line::TooLong => return Ok(FirstLine::Malformed("<line too long>".to_string())),
        Line::Data(line) => line,
    };
    if line == b"\r\n" || line == b"\n" {
        line = match read_line_bounded(r, MAX_LINE).await? {
            Line::Eof => return Ok(FirstLine::End),
            Line::TooLong => return Ok(FirstLine::Malformed("<line too long>".to_string())),
            Line::Data(line) => line,
        };
    }
    Ok(parse_request_line(&line))
}

fn parse_request_line(line: &[u8]) -> FirstLine {
    let text = String::from_utf8_lossy(line);
    let quoted = format!("{:?}", text.as_ref());
    let trimmed = text.trim_end_matches(['\r', '\n']);
    let mut parts = trimmed.split_ascii_whitespace();
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return FirstLine::Malformed(quoted);
    };
    if parts.next().is_some() {
        return FirstLine::Malformed(quoted);
    }
    let Some(version) = parse_version(version) else {
        return FirstLine::Malformed(quoted);
    };
    FirstLine::Parsed {
        method: method.to_string(),
        path: path.to_string(),
        version,
    }
}

fn parse_version(token: &str) -> Option<(u8, u8)> {
    let rest = token.strip_prefix("HTTP/")?;
    let (major, minor) = rest.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Read a header block up to and including the blank-line terminator.
/// Returns `None` if the block is malformed.
pub async fn read_headers<R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> io::Result<Option<Vec<(String, String)>>> {
    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let line = match read_line_bounded(r, MAX_LINE).await? {
            Line::Eof | Line::TooLong => return Ok(None),
            Line::Data(line) => line,
        };
        if line == b"\r\n" || line == b"\n" {
            return Ok(Some(headers));
        }
        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim_end_matches(['\r', '\n']);
        if trimmed.starts_with([' ', '\t']) {
            // obs-fold continuation of the previous header value
            let Some((_, value)) = headers.last_mut() else {
                return Ok(None);
            };
            value.push(' ');
            value.push_str(trimmed.trim());
            continue;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            return Ok(None);
        };
        if name.is_empty() {
            return Ok(None);
        }
        headers.push((name.trim().to_string(), value.trim().to_string()));
        if headers.len() > MAX_HEADERS {
            return Ok(None);
        }
    }
}

/// First header with the given name, case-insensitive
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Read a request body, with framing resolved from the headers: chunked
/// transfer-encoding first, then content-length, else no body.
pub async fn read_body<R: AsyncBufRead + Unpin>(
    r: &mut R,
    headers: &[(String, String)],
    _version: (u8, u8),
) -> io::Result<BodyOutcome> {
    if let Some(te) = header(headers, "transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return read_chunked(r).await;
        }
    }
    let Some(cl) = header(headers, "content-length") else {
        return Ok(BodyOutcome::Read(Vec::new()));
    };
    let Ok(total) = cl.trim().parse::<u64>() else {
        return Ok(BodyOutcome::Malformed(format!(
            "Invalid content-length specification: {cl:?}"
        )));
    };
    let mut body = Vec::new();
    let mut remaining = total as usize;
    let mut chunk = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(chunk.len());
        let got = r.read(&mut chunk[..want]).await?;
        if got == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        body.extend_from_slice(&chunk[..got]);
        remaining -= got;
    }
    Ok(BodyOutcome::Read(body))
}

async fn read_chunked<R: AsyncBufRead + Unpin>(r: &mut R) -> io::Result<BodyOutcome> {
    let mut body = Vec::new();
    loop {
        let line = match read_line_bounded(r, MAX_LINE).await? {
            Line::Eof | Line::TooLong => {
                return Ok(BodyOutcome::Malformed("Malformed chunked body".to_string()));
            }
            Line::Data(line) => line,
        };
        let text = String::from_utf8_lossy(&line);
        let size_part = text.trim().split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_part, 16) else {
            return Ok(BodyOutcome::Malformed(format!(
                "Invalid chunked encoding length: {size_part:?}"
            )));
        };
        if size == 0 {
            break;
        }
        let mut chunk = vec![0u8; size];
        r.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);
        // CRLF after the chunk data; consumed but not validated
        let mut crlf = [0u8; 2];
        r.read_exact(&mut crlf).await?;
    }
    // discard trailers up to the blank line
    loop {
        match read_line_bounded(r, MAX_LINE).await? {
            Line::Data(line) if line == b"\r\n" || line == b"\n" => break,
            Line::Data(_) => continue,
            Line::Eof | Line::TooLong => break,
        }
    }
    Ok(BodyOutcome::Read(body))
}
