//! Incremental HTTP request decoding.
//!
//! Bytes of one connection are fed in as they are reassembled; `decode` yields
//! each request once its head and body are complete. Framing follows RFC 7230:
//! chunked transfer coding wins over Content-Length, and a request with neither
//! has no body.

use super::request::{Headers, HttpRequest, Version};
use crate::packet::Conversation;
use bytes::{Buf, Bytes, BytesMut};
use core::fmt;
use memchr::memmem;

const MAX_HEADERS: usize = 128;

#[derive(Debug)]
pub(crate) enum ParseError {
    Head(httparse::Error),
    HeadTooLarge(usize),
    UnsupportedVersion(u8),
    InvalidContentLength,
    UnsupportedTransferEncoding,
    InvalidChunk,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Head(e) => write!(f, "invalid request head: {e}"),
            ParseError::HeadTooLarge(n) => write!(f, "request head exceeds {n} bytes"),
            ParseError::UnsupportedVersion(v) => write!(f, "unsupported HTTP/1.{v}"),
            ParseError::InvalidContentLength => f.write_str("invalid Content-Length"),
            ParseError::UnsupportedTransferEncoding => {
                f.write_str("unsupported Transfer-Encoding")
            }
            ParseError::InvalidChunk => f.write_str("invalid chunk framing"),
        }
    }
}

impl core::error::Error for ParseError {}

#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    version: Version,
    headers: Headers,
}

#[derive(Debug, Clone, Copy)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug)]
enum State {
    Head,
    Body {
        head: RequestHead,
        len: usize,
    },
    Chunked {
        head: RequestHead,
        body: BytesMut,
        trailers: Headers,
        chunk: Chunk,
    },
}

#[derive(Debug)]
pub(crate) struct RequestDecoder {
    conversation: Conversation,
    buf: BytesMut,
    state: State,
    max_head: usize,
}

impl RequestDecoder {
    pub(crate) fn new(conversation: Conversation, max_head: usize) -> Self {
        Self {
            conversation,
            buf: BytesMut::new(),
            state: State::Head,
            max_head,
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True while part of a request has been received but not all of it
    pub(crate) fn has_partial(&self) -> bool {
        !matches!(self.state, State::Head) || self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Decode the next complete request from the buffered bytes.
    /// `Ok(None)` means more bytes are needed.
    pub(crate) fn decode(&mut self) -> Result<Option<HttpRequest>, ParseError> {
        loop {
            match core::mem::replace(&mut self.state, State::Head) {
                State::Head => {
                    let Some((head, consumed)) = self.parse_head()? else {
                        return Ok(None);
                    };
                    self.buf.advance(consumed);
                    self.state = framing(head)?;
                }
                State::Body { head, len } => {
                    if self.buf.len() < len {
                        self.state = State::Body { head, len };
                        return Ok(None);
                    }
                    let body = self.buf.split_to(len).freeze();
                    return Ok(Some(self.finish(head, body, Headers::default())));
                }
                State::Chunked {
                    head,
                    mut body,
                    mut trailers,
                    chunk,
                } => match self.decode_chunks(chunk, &mut body, &mut trailers)? {
                    Some(chunk) => {
                        self.state = State::Chunked {
                            head,
                            body,
                            trailers,
                            chunk,
                        };
                        return Ok(None);
                    }
                    None => return Ok(Some(self.finish(head, body.freeze(), trailers))),
                },
            }
        }
    }

    fn finish(&self, head: RequestHead, body: Bytes, trailers: Headers) -> HttpRequest {
        HttpRequest {
            conversation: self.conversation,
            method: head.method,
            target: head.target,
            version: head.version,
            headers: head.headers,
            body,
            trailers,
        }
    }

    fn parse_head(&mut self) -> Result<Option<(RequestHead, usize)>, ParseError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        match parse_request_head(&self.buf) {
            Ok(Some(parsed)) => Ok(Some(parsed)),
            Ok(None) if self.buf.len() > self.max_head => {
                Err(ParseError::HeadTooLarge(self.max_head))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                // httparse rejects obsolete line folding; retry on the unfolded head
                let Some(end) = memmem::find(&self.buf, b"\r\n\r\n") else {
                    if has_folding(&self.buf) && self.buf.len() <= self.max_head {
                        return Ok(None);
                    }
                    return Err(e);
                };
                let head_len = end + 4;
                let raw = &self.buf[..head_len];
                if !has_folding(raw) {
                    return Err(e);
                }
                let unfolded = unfold_http_headers(raw);
                match parse_request_head(&unfolded)? {
                    Some((head, _)) => Ok(Some((head, head_len))),
                    None => Err(e),
                }
            }
        }
    }

    /// Advance through chunked framing. Returns the chunk state to resume from
    /// when more bytes are needed, `None` once the body is complete.
    fn decode_chunks(
        &mut self,
        mut chunk: Chunk,
        body: &mut BytesMut,
        trailers: &mut Headers,
    ) -> Result<Option<Chunk>, ParseError> {
        loop {
            chunk = match chunk {
                Chunk::Size => match httparse::parse_chunk_size(&self.buf) {
                    Ok(httparse::Status::Complete((consumed, 0))) => {
                        self.buf.advance(consumed);
                        Chunk::Trailers
                    }
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        self.buf.advance(consumed);
                        Chunk::Data(size)
                    }
                    Ok(httparse::Status::Partial) => return Ok(Some(Chunk::Size)),
                    Err(_) => return Err(ParseError::InvalidChunk),
                },
                Chunk::Data(remaining) => {
                    let available = self.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    body.extend_from_slice(&self.buf.split_to(available));
                    let remaining = remaining - available as u64;
                    if remaining > 0 {
                        return Ok(Some(Chunk::Data(remaining)));
                    }
                    Chunk::DataEnd
                }
                Chunk::DataEnd => {
                    if self.buf.len() < 2 {
                        return Ok(Some(Chunk::DataEnd));
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunk);
                    }
                    self.buf.advance(2);
                    Chunk::Size
                }
                Chunk::Trailers => {
                    let Some(end) = memmem::find(&self.buf, b"\r\n") else {
                        if self.buf.len() > self.max_head {
                            return Err(ParseError::HeadTooLarge(self.max_head));
                        }
                        return Ok(Some(Chunk::Trailers));
                    };
                    let line = self.buf.split_to(end + 2);
                    let line = &line[..end];
                    if line.is_empty() {
                        return Ok(None);
                    }
                    let Some(colon) = memchr::memchr(b':', line) else {
                        return Err(ParseError::InvalidChunk);
                    };
                    let name = core::str::from_utf8(&line[..colon])
                        .map_err(|_| ParseError::InvalidChunk)?
                        .trim();
                    trailers.push(name, line[colon + 1..].trim_ascii());
                    Chunk::Trailers
                }
            };
        }
    }
}

fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let status = req.parse(buf).map_err(ParseError::Head)?;
    let httparse::Status::Complete(consumed) = status else {
        return Ok(None);
    };

    let (Some(method), Some(target), Some(version)) = (req.method, req.path, req.version) else {
        return Ok(None);
    };
    let version = match version {
        0 => Version::Http10,
        1 => Version::Http11,
        other => return Err(ParseError::UnsupportedVersion(other)),
    };

    let mut fields = Headers::default();
    for header in req.headers.iter() {
        fields.push(header.name, header.value);
    }

    Ok(Some((
        RequestHead {
            method: method.to_owned(),
            target: target.to_owned(),
            version,
            headers: fields,
        },
        consumed,
    )))
}

/// Pick the body framing from the request head
fn framing(head: RequestHead) -> Result<State, ParseError> {
    let codings: Vec<&[u8]> = head.headers.get_all("transfer-encoding").collect();
    if !codings.is_empty() {
        let chunked = codings
            .last()
            .and_then(|v| v.rsplit(|&b| b == b',').next())
            .is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"));
        if !chunked {
            return Err(ParseError::UnsupportedTransferEncoding);
        }
        return Ok(State::Chunked {
            head,
            body: BytesMut::new(),
            trailers: Headers::default(),
            chunk: Chunk::Size,
        });
    }

    let mut len: Option<usize> = None;
    for value in head.headers.get_all("content-length") {
        let parsed = parse_content_length(value).ok_or(ParseError::InvalidContentLength)?;
        if len.is_some_and(|l| l != parsed) {
            return Err(ParseError::InvalidContentLength);
        }
        len = Some(parsed);
    }

    Ok(State::Body {
        head,
        len: len.unwrap_or(0),
    })
}

fn parse_content_length(value: &[u8]) -> Option<usize> {
    let value = value.trim_ascii();
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    core::str::from_utf8(value).ok()?.parse().ok()
}

fn has_folding(head: &[u8]) -> bool {
    memmem::find(head, b"\n ").is_some() || memmem::find(head, b"\n\t").is_some()
}

/// Unfold header lines that use obsolete line folding (RFC 7230 Section 3.2.4).
/// A line starting with a space or tab continues the previous header value.
pub(crate) fn unfold_http_headers(head: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(head.len());
    let mut lines = head
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

    // First line is the request line, never folded
    if let Some(first_line) = lines.next() {
        result.extend_from_slice(first_line);
        result.extend_from_slice(b"\r\n");
    }

    let mut current_line: Vec<u8> = Vec::new();
    for line in lines {
        if line.starts_with(b" ") || line.starts_with(b"\t") {
            current_line.push(b' ');
            current_line.extend_from_slice(line.trim_ascii());
        } else {
            if !current_line.is_empty() {
                result.extend_from_slice(&current_line);
                result.extend_from_slice(b"\r\n");
                current_line.clear();
            }
            current_line.extend_from_slice(line);
        }
    }
    if !current_line.is_empty() {
        result.extend_from_slice(&current_line);
        result.extend_from_slice(b"\r\n");
    }
    result.extend_from_slice(b"\r\n");
    result
}
