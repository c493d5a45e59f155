//! Response specification engine.
//!
//! A specification is a compact textual description of the exact bytes and
//! timing of a response, e.g. `200:b"hello"` or
//! `404:m"gone":h"X-Why"="testing":b@2048:p100,2:d200`.
//!
//! Grammar, components separated by `:`:
//!
//! - `CODE` — status code, mandatory, first
//! - `m"reason"` — reason phrase (defaults from the status code)
//! - `h"Name"="value"` — header, repeatable
//! - `b<value>` — body
//! - `p<offset>,<seconds|f>` — pause at a byte offset, `f` pauses forever
//! - `d<offset>` — disconnect at a byte offset
//! - `i<offset>,<value>` — inject extra bytes at a byte offset
//!
//! Values are `"literal"` (escapes `\"` `\\` `\n` `\r` `\t` `\xNN`),
//! `@n` for n bytes of generated filler, or `<"path"` for a file under the
//! configured static directory. Offsets are byte positions into the rendered
//! response, or `a` for "after everything".

use std::fmt;
use std::io;
use std::path::{Component, Path};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::RequestSettings;
use crate::log::ResponseSummary;

/// Generated filler values larger than this fail to parse rather than
/// exhaust memory
const MAX_GENERATED: u64 = 256 * 1024 * 1024;

const FOREVER: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// How far into the rendered response an action applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    Byte(u64),
    /// After the complete response has been written
    End,
}

impl Offset {
    fn resolve(self, total: u64) -> u64 {
        match self {
            Offset::Byte(n) => n.min(total),
            Offset::End => total,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PauseLength {
    For(Duration),
    Forever,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Pause { offset: Offset, length: PauseLength },
    Disconnect { offset: Offset },
    Inject { offset: Offset, data: Vec<u8> },
}

impl Action {
    pub fn offset(&self) -> Offset {
        match self {
            Action::Pause { offset, .. }
            | Action::Disconnect { offset }
            | Action::Inject { offset, .. } => *offset,
        }
    }

    pub fn is_pause(&self) -> bool {
        matches!(self, Action::Pause { .. })
    }
}

/// A parsed specification, ready to serve. All file references are resolved
/// at parse time; serving needs no further settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Malformed specification text; `pos` is a byte offset into `spec`
    Syntax {
        msg: String,
        spec: String,
        pos: usize,
    },
    /// The specification referenced a file that is outside the static
    /// directory, unreadable, or no static directory is configured
    FileAccessDenied,
}

impl ParseError {
    /// The offending spec with a caret under the error position
    pub fn marked(&self) -> String {
        match self {
            ParseError::Syntax { spec, pos, .. } => {
                format!("{}\n{}^", spec, " ".repeat(*pos))
            }
            ParseError::FileAccessDenied => String::new(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Syntax { msg, pos, .. } => write!(f, "{msg} at offset {pos}"),
            ParseError::FileAccessDenied => write!(f, "file access denied"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse a specification into a servable [`Response`]
pub fn parse_response(settings: &RequestSettings, spec: &str) -> Result<Response, ParseError> {
    let spec = spec.trim();
    let mut c = Cursor::new(spec);

    let code = c.number()?;
    if code > u16::MAX as u64 {
        return Err(c.err("status code out of range"));
    }
    let code = code as u16;

    let mut reason: Option<String> = None;
    let mut body: Option<Vec<u8>> = None;
    let mut headers = Vec::new();
    let mut actions = Vec::new();

    while c.eat(b':') {
        match c.peek() {
            Some(b'm') => {
                c.bump();
                if reason.is_some() {
                    return Err(c.err("duplicate reason clause"));
                }
                reason = Some(String::from_utf8_lossy(&c.quoted()?).into_owned());
            }
            Some(b'h') => {
                c.bump();
                let name = String::from_utf8_lossy(&c.quoted()?).into_owned();
                c.expect(b'=')?;
                let value = c.quoted()?;
                headers.push((name, value));
            }
            Some(b'b') => {
                c.bump();
                if body.is_some() {
                    return Err(c.err("duplicate body clause"));
                }
                body = Some(c.value(settings)?);
            }
            Some(b'p') => {
                c.bump();
                let offset = c.offset()?;
                c.expect(b',')?;
                let length = c.pause()?;
                actions.push(Action::Pause { offset, length });
            }
            Some(b'd') => {
                c.bump();
                actions.push(Action::Disconnect {
                    offset: c.offset()?,
                });
            }
            Some(b'i') => {
                c.bump();
                let offset = c.offset()?;
                c.expect(b',')?;
                let data = c.value(settings)?;
                actions.push(Action::Inject { offset, data });
            }
            Some(other) => {
                return Err(c.err(format!("unknown component {:?}", other as char)));
            }
            None => return Err(c.err("expected component after ':'")),
        }
    }
    if !c.at_end() {
        return Err(c.err("unexpected trailing characters"));
    }

    Ok(Response {
        code,
        reason: reason.unwrap_or_else(|| status_text(code).to_string()),
        headers,
        body: body.unwrap_or_default(),
        actions,
    })
}

/// Synthetic response served when crafting or a policy check fails. Status
/// 800 keeps these distinguishable on the wire from deliberately crafted
/// error statuses.
pub fn error_response(reason: &str, body: &str) -> Response {
    Response {
        code: 800,
        reason: reason.to_string(),
        headers: vec![("Content-Type".to_string(), b"text/plain".to_vec())],
        body: body.as_bytes().to_vec(),
        actions: Vec::new(),
    }
}

impl Response {
    fn render_head(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.code, self.reason).as_bytes());
        let mut has_content_length = false;
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                has_content_length = true;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        if !has_content_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Upper bound on the number of bytes `serve` can write
    pub fn maximum_length(&self) -> u64 {
        let injected: usize = self
            .actions
            .iter()
            .map(|a| match a {
                Action::Inject { data, .. } => data.len(),
                _ => 0,
            })
            .sum();
        (self.render_head().len() + self.body.len() + injected) as u64
    }

    /// Write the response, applying actions at their byte offsets. Returns a
    /// summary of what actually went over the wire.
    pub async fn serve<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<ResponseSummary> {
        let mut wire = self.render_head();
        wire.extend_from_slice(&self.body);
        let total = wire.len() as u64;

        let mut ordered: Vec<(u64, &Action)> = self
            .actions
            .iter()
            .map(|a| (a.offset().resolve(total), a))
            .collect();
        ordered.sort_by_key(|(offset, _)| *offset);

        let mut disconnect = false;
        let mut written: u64 = 0;
        let mut cursor: usize = 0;
        for (offset, action) in ordered {
            let offset = offset as usize;
            if offset > cursor {
                w.write_all(&wire[cursor..offset]).await?;
                written += (offset - cursor) as u64;
                cursor = offset;
            }
            w.flush().await?;
            match action {
                Action::Pause { length, .. } => match length {
                    PauseLength::For(d) => tokio::time::sleep(*d).await,
                    PauseLength::Forever => tokio::time::sleep(FOREVER).await,
                },
                Action::Disconnect { .. } => {
                    disconnect = true;
                    break;
                }
                Action::Inject { data, .. } => {
                    w.write_all(data).await?;
                    written += data.len() as u64;
                }
            }
        }
        if !disconnect && cursor < wire.len() {
            w.write_all(&wire[cursor..]).await?;
            written += (wire.len() - cursor) as u64;
        }
        w.flush().await?;

        Ok(ResponseSummary {
            code: self.code,
            reason: self.reason.clone(),
            header_count: self.headers.len(),
            bytes_written: written,
            disconnect,
        })
    }
}

fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn filler(n: usize) -> Vec<u8> {
    // deterministic printable filler so transcripts are reproducible
    (0..n).map(|i| b'!' + (i % 94) as u8).collect()
}

fn read_static_file(settings: &RequestSettings, raw: &[u8]) -> Result<Vec<u8>, ParseError> {
    let Some(base) = &settings.staticdir else {
        return Err(ParseError::FileAccessDenied);
    };
    let rel = String::from_utf8_lossy(raw).into_owned();
    let mut path = base.clone();
    for comp in Path::new(&rel).components() {
        match comp {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return Err(ParseError::FileAccessDenied),
        }
    }
    std::fs::read(&path).map_err(|_| ParseError::FileAccessDenied)
}

struct Cursor<'a> {
    spec: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(spec: &'a str) -> Self {
        Cursor {
            spec,
            bytes: spec.as_bytes(),
            pos: 0,
        }
    }

    fn err(&self, msg: impl Into<String>) -> ParseError {
        ParseError::Syntax {
            msg: msg.into(),
            spec: self.spec.to_string(),
            pos: self.pos.min(self.spec.len()),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), ParseError> {
        if self.eat(b) {
            Ok(())
        } else {
            Err(self.err(format!("expected {:?}", b as char)))
        }
    }

    fn number(&mut self) -> Result<u64, ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.err("expected number"));
        }
        self.spec[start..self.pos]
            .parse()
            .map_err(|_| self.err("number out of range"))
    }

    fn decimal(&mut self) -> Result<f64, ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9') | Some(b'.')) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.err("expected number"));
        }
        self.spec[start..self.pos]
            .parse()
            .map_err(|_| self.err("invalid number"))
    }

    fn hex_digit(&mut self) -> Result<u8, ParseError> {
        match self.bump() {
            Some(b @ b'0'..=b'9') => Ok(b - b'0'),
            Some(b @ b'a'..=b'f') => Ok(b - b'a' + 10),
            Some(b @ b'A'..=b'F') => Ok(b - b'A' + 10),
            _ => Err(self.err("expected hex digit")),
        }
    }

    fn quoted(&mut self) -> Result<Vec<u8>, ParseError> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string")),
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push(b'"'),
                    Some(b'\\') => out.push(b'\\'),
                    Some(b'n') => out.push(b'\n'),
                    Some(b'r') => out.push(b'\r'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'x') => {
                        let hi = self.hex_digit()?;
                        let lo = self.hex_digit()?;
                        out.push(hi << 4 | lo);
                    }
                    _ => return Err(self.err("invalid escape")),
                },
                Some(b) => out.push(b),
            }
        }
    }

    fn value(&mut self, settings: &RequestSettings) -> Result<Vec<u8>, ParseError> {
        match self.peek() {
            Some(b'"') => self.quoted(),
            Some(b'@') => {
                self.bump();
                let n = self.number()?;
                if n > MAX_GENERATED {
                    return Err(self.err("generated value too large"));
                }
                Ok(filler(n as usize))
            }
            Some(b'<') => {
                self.bump();
                let raw = if self.peek() == Some(b'"') {
                    self.quoted()?
                } else {
                    let start = self.pos;
                    while !matches!(self.peek(), Some(b':') | None) {
                        self.pos += 1;
                    }
                    self.bytes[start..self.pos].to_vec()
                };
                read_static_file(settings, &raw)
            }
            _ => Err(self.err("expected value")),
        }
    }

    fn offset(&mut self) -> Result<Offset, ParseError> {
        if self.eat(b'a') {
            return Ok(Offset::End);
        }
        Ok(Offset::Byte(self.number()?))
    }

    fn pause(&mut self) -> Result<PauseLength, ParseError> {
        if self.eat(b'f') {
            return Ok(PauseLength::Forever);
        }
        let secs = self.decimal()?;
        if !secs.is_finite() || secs > 1e9 {
            return Err(self.err("pause too long"));
        }
        Ok(PauseLength::For(Duration::from_secs_f64(secs)))
    }
}
