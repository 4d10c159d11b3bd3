//! Raw HTTP/1.1 request/response over an established stream.
//!
//! The response is parsed incrementally by [`ResponseParser`]: bytes are
//! appended as they arrive and a cursor marks how far they have been
//! consumed, so nothing is rescanned from the start of the buffer. The whole
//! exchange runs under a single timeout; dropping the timed-out future is the
//! only cleanup needed.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// User agent sent with every probe.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Longest header block accepted before giving up on a response.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Longest chunk-size or trailer line accepted.
const MAX_LINE_BYTES: usize = 1024;

const READ_CHUNK: usize = 4096;

/// Error from one probe exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    /// Status line was not `HTTP/1.x 2xx`. Carries the status line.
    #[error("non-success status: {0}")]
    NonSuccessStatus(String),

    #[error("no complete response within {timeout_ms}ms")]
    ResponseTimeout { timeout_ms: u64 },

    /// I/O failure or malformed framing.
    #[error("socket error: {0}")]
    Socket(String),

    /// Peer closed the stream before the response completed.
    #[error("connection closed before response completed")]
    ConnectionClosed,
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ResponseTimeout { .. })
    }

    fn framing(msg: impl Into<String>) -> Self {
        Self::Socket(msg.into())
    }
}

/// The request bytes for `GET {path}` on virtual host `host`.
pub fn build_request(host: &str, path: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Connection: keep-alive\r\n\
         Accept: */*\r\n\
         Accept-Encoding: identity\r\n\
         \r\n"
    )
}

/// Send one request and read one response within `timeout`.
///
/// Returns the decoded body (lossy UTF-8). On any error the stream is in an
/// unknown state and must not be reused.
pub async fn probe<S>(
    stream: &mut S,
    host: &str,
    path: &str,
    timeout: Duration,
) -> Result<String, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, exchange(stream, host, path)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::ResponseTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

async fn exchange<S>(stream: &mut S, host: &str, path: &str) -> Result<String, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_request(host, path);
    stream.write_all(request.as_bytes()).await.map_err(io_error)?;
    stream.flush().await.map_err(io_error)?;

    let mut parser = ResponseParser::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await.map_err(io_error)?;
        if n == 0 {
            return Err(ProbeError::ConnectionClosed);
        }
        if let Some(body) = parser.feed(&chunk[..n])? {
            return Ok(body);
        }
    }
}

fn io_error(e: std::io::Error) -> ProbeError {
    // tokio-rustls reports a close without close_notify as UnexpectedEof.
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProbeError::ConnectionClosed
    } else {
        ProbeError::Socket(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response parser
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHeaders,
    AwaitingBody(Framing),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length(usize),
    Chunked(Chunk),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    /// Expecting `size-hex[;ext] CRLF`.
    Size,
    /// Inside chunk data with this many bytes left.
    Data(usize),
    /// Expecting the CRLF that ends chunk data.
    DataEnd,
    /// After the zero-size chunk: trailer lines until an empty line.
    Trailer,
}

/// Incremental HTTP/1.1 response parser.
#[derive(Debug)]
pub struct ResponseParser {
    buf: Vec<u8>,
    cursor: usize,
    /// How far the header terminator search has got.
    scanned: usize,
    state: State,
    body: Vec<u8>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(READ_CHUNK),
            cursor: 0,
            scanned: 0,
            state: State::AwaitingHeaders,
            body: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Append received bytes and advance. Returns the body once complete.
    ///
    /// Bytes fed after completion are ignored.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<String>, ProbeError> {
        if self.is_done() {
            return Ok(None);
        }
        self.buf.extend_from_slice(bytes);

        loop {
            match self.state {
                State::AwaitingHeaders => {
                    if !self.parse_head()? {
                        return Ok(None);
                    }
                }
                State::AwaitingBody(Framing::Length(len)) => {
                    let available = self.buf.len() - self.cursor;
                    if available < len {
                        return Ok(None);
                    }
                    let end = self.cursor + len;
                    self.body.extend_from_slice(&self.buf[self.cursor..end]);
                    self.cursor = end;
                    self.state = State::Done;
                }
                State::AwaitingBody(Framing::Chunked(chunk)) => {
                    match self.parse_chunk(chunk)? {
                        Some(next) => self.state = next,
                        None => return Ok(None),
                    }
                }
                State::Done => {
                    let body = std::mem::take(&mut self.body);
                    return Ok(Some(String::from_utf8_lossy(&body).into_owned()));
                }
            }
        }
    }

    /// Next CRLF at or after the cursor, as an absolute offset.
    fn find_crlf(&self) -> Option<usize> {
        self.buf[self.cursor..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| self.cursor + i)
    }

    /// Parse the status line and headers once `CRLF CRLF` has arrived.
    /// Returns false while more bytes are needed.
    fn parse_head(&mut self) -> Result<bool, ProbeError> {
        let from = self.scanned.saturating_sub(3);
        let found = self.buf[from..]
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|i| from + i);
        let Some(end) = found else {
            self.scanned = self.buf.len();
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(ProbeError::framing("response header block too large"));
            }
            return Ok(false);
        };

        let head = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.cursor = end + 4;

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default().trim();
        if !is_success_status(status_line) {
            return Err(ProbeError::NonSuccessStatus(status_line.to_string()));
        }

        let mut chunked = false;
        let mut content_length = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value
                    .rsplit(',')
                    .next()
                    .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
            } else if name.eq_ignore_ascii_case("content-length") {
                let len = value
                    .parse::<usize>()
                    .map_err(|_| ProbeError::framing(format!("invalid content-length '{value}'")))?;
                content_length = Some(len);
            }
        }

        self.state = match (chunked, content_length) {
            (true, _) => State::AwaitingBody(Framing::Chunked(Chunk::Size)),
            (false, Some(len)) => State::AwaitingBody(Framing::Length(len)),
            (false, None) => {
                return Err(ProbeError::framing(
                    "response has no framing (neither chunked nor content-length)",
                ))
            }
        };
        Ok(true)
    }

    /// Advance the chunked decoder by one step. Returns the next state, or
    /// `None` while more bytes are needed.
    fn parse_chunk(&mut self, chunk: Chunk) -> Result<Option<State>, ProbeError> {
        let chunked = |c| State::AwaitingBody(Framing::Chunked(c));
        match chunk {
            Chunk::Size => {
                let Some(eol) = self.find_crlf() else {
                    return self.line_pending("chunk size line too long");
                };
                let line = String::from_utf8_lossy(&self.buf[self.cursor..eol]).into_owned();
                let size_hex = line.split(';').next().unwrap_or_default().trim();
                let size = usize::from_str_radix(size_hex, 16)
                    .map_err(|_| ProbeError::framing(format!("malformed chunk size '{line}'")))?;
                self.cursor = eol + 2;
                Ok(Some(if size == 0 {
                    chunked(Chunk::Trailer)
                } else {
                    chunked(Chunk::Data(size))
                }))
            }
            Chunk::Data(remaining) => {
                let available = self.buf.len() - self.cursor;
                if available == 0 {
                    return Ok(None);
                }
                let take = remaining.min(available);
                self.body
                    .extend_from_slice(&self.buf[self.cursor..self.cursor + take]);
                self.cursor += take;
                Ok(Some(if take == remaining {
                    chunked(Chunk::DataEnd)
                } else {
                    chunked(Chunk::Data(remaining - take))
                }))
            }
            Chunk::DataEnd => {
                if self.buf.len() - self.cursor < 2 {
                    return Ok(None);
                }
                if &self.buf[self.cursor..self.cursor + 2] != b"\r\n" {
                    return Err(ProbeError::framing("missing CRLF after chunk data"));
                }
                self.cursor += 2;
                Ok(Some(chunked(Chunk::Size)))
            }
            Chunk::Trailer => {
                let Some(eol) = self.find_crlf() else {
                    return self.line_pending("trailer line too long");
                };
                let empty = eol == self.cursor;
                self.cursor = eol + 2;
                Ok(Some(if empty { State::Done } else { chunked(Chunk::Trailer) }))
            }
        }
    }

    fn line_pending(&self, too_long: &str) -> Result<Option<State>, ProbeError> {
        if self.buf.len() - self.cursor > MAX_LINE_BYTES {
            return Err(ProbeError::framing(too_long));
        }
        Ok(None)
    }
}

/// `HTTP/1.x 2xx ...`
fn is_success_status(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    let version_ok = parts.next().is_some_and(|v| v.starts_with("HTTP/1."));
    let code_ok = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .is_some_and(|code| (200..300).contains(&code));
    version_ok && code_ok
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
