//! Framing layer: splits each leg's byte stream into chunks along message
//! boundaries without changing a single byte.
//!
//! Decoders only decide *where* to cut. Encoders write chunks back verbatim,
//! so whatever a decoder gets wrong, the peer still receives exactly the bytes
//! that were sent.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config;
use bytes::{Bytes, BytesMut};
use std::{fmt::Display, io, str::FromStr};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

/// A decode/encode stack installed on both legs of a session.
pub trait Framing: Send + Sync + 'static {
    /// Codec used on one leg.
    type Codec: Decoder<Item = Bytes, Error = io::Error>
        + Encoder<Bytes, Error = io::Error>
        + Clone
        + Send
        + 'static;

    /// Codec for the accepted (client-facing) connection.
    fn inbound_codec(&self) -> Self::Codec;

    /// Codec for the dialed (remote-facing) connection.
    fn outbound_codec(&self) -> Self::Codec;
}

/// Which framing a route uses.
#[derive(Debug, Default, Copy, Clone, Hash, Eq, PartialEq)]
pub enum FramingKind {
    /// Opaque bytes, cut wherever the socket happens to deliver them
    Raw,
    /// HTTP/1.x messages
    #[default]
    Http,
}

/// Unknown framing name.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
#[error("Invalid framing (expected `raw` or `http`)")]
pub struct InvalidFraming;

impl Display for FramingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Raw => "raw",
            Self::Http => "http",
        })
    }
}

impl FromStr for FramingKind {
    type Err = InvalidFraming;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" | "tcp" => Ok(Self::Raw),
            "http" => Ok(Self::Http),
            _ => Err(InvalidFraming),
        }
    }
}

/// Pass bytes through in whatever pieces they arrive.
#[derive(Debug, Default, Copy, Clone)]
pub struct RawFraming;

impl Framing for RawFraming {
    type Codec = RawCodec;

    fn inbound_codec(&self) -> RawCodec {
        RawCodec
    }

    fn outbound_codec(&self) -> RawCodec {
        RawCodec
    }
}

/// Requests are decoded on the inbound leg and responses on the outbound leg.
#[derive(Debug, Default, Copy, Clone)]
pub struct HttpFraming;

impl Framing for HttpFraming {
    type Codec = HttpCodec;

    fn inbound_codec(&self) -> HttpCodec {
        HttpCodec::request()
    }

    fn outbound_codec(&self) -> HttpCodec {
        HttpCodec::response()
    }
}

/// Take at most `limit` (and at most `MAX_CHUNK_SIZE`) buffered bytes.
fn take_bytes(src: &mut BytesMut, limit: u64) -> Option<Bytes> {
    if src.is_empty() || limit == 0 {
        return None;
    }
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let len = src.len().min(limit).min(config::MAX_CHUNK_SIZE);
    Some(src.split_to(len).freeze())
}

/// Write a chunk back verbatim.
fn encode_verbatim(item: &Bytes, dst: &mut BytesMut) {
    dst.extend_from_slice(item);
}

/// Opaque byte codec.
#[derive(Debug, Default, Copy, Clone)]
pub struct RawCodec;

impl Decoder for RawCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        Ok(take_bytes(src, u64::MAX))
    }
}

impl Encoder<Bytes> for RawCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        encode_verbatim(&item, dst);
        Ok(())
    }
}

/// Longest method name to wait for before deciding a request is not HTTP.
const MAX_METHOD_LEN: usize = 32;
/// Every HTTP/1.x response starts with this.
const HTTP_VERSION_PREFIX: &str = "HTTP/";

/// Which side of an HTTP exchange a codec decodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Role {
    Request,
    Response,
}

/// Where the decoder is within the current message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    /// Waiting for a complete start line and header block
    Head,
    /// This many body bytes remain
    Body(u64),
    /// Expecting a chunk-size line
    ChunkSize,
    /// This many bytes of chunk data, including its CRLF, remain
    ChunkData(u64),
    /// Inside the trailer section of a chunked body
    Trailers,
    /// Body runs until the connection closes
    UntilClose,
    /// Gave up on finding boundaries; everything else passes through
    Opaque,
}

/// How the body following a head is delimited.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BodyKind {
    None,
    Length(u64),
    Chunked,
    UntilClose,
    Tunnel,
}

/// HTTP/1.x message boundary codec.
///
/// Each decoded chunk is a message head, or a piece of body no longer than
/// `MAX_CHUNK_SIZE`. Anything that does not look like HTTP switches the codec
/// into passthrough for the rest of the connection; the relay never rejects
/// traffic.
#[derive(Debug, Clone)]
pub struct HttpCodec {
    role: Role,
    state: State,
}

impl HttpCodec {
    /// Codec for a stream of requests.
    #[must_use]
    pub const fn request() -> Self {
        Self {
            role: Role::Request,
            state: State::Head,
        }
    }

    /// Codec for a stream of responses.
    #[must_use]
    pub const fn response() -> Self {
        Self {
            role: Role::Response,
            state: State::Head,
        }
    }

    /// Whether the codec has stopped looking for message boundaries.
    #[must_use]
    pub fn is_opaque(&self) -> bool {
        self.state == State::Opaque
    }

    fn give_up(&mut self, why: &str) {
        debug!("HTTP framing lost ({why}), passing the rest through");
        self.state = State::Opaque;
    }

    /// Whether a message starting with `start` can still be HTTP. `start`
    /// is the whole first line without its `\n` if `complete`, or whatever
    /// of it has arrived so far.
    fn plausible_start(&self, start: &[u8], complete: bool) -> bool {
        match self.role {
            Role::Request => {
                let method_len = start
                    .iter()
                    .position(|&b| b == b' ')
                    .unwrap_or(start.len());
                let method = &start[..method_len];
                if method.len() > MAX_METHOD_LEN || !method.iter().all(|&b| is_token_byte(b)) {
                    return false;
                }
                if !complete {
                    return true;
                }
                let Ok(line) = std::str::from_utf8(trim_cr(start)) else {
                    return false;
                };
                let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
                matches!(tokens[..], [_, _, version] if version.starts_with(HTTP_VERSION_PREFIX))
            }
            Role::Response => {
                let prefix = &start[..start.len().min(HTTP_VERSION_PREFIX.len())];
                if !HTTP_VERSION_PREFIX.as_bytes().starts_with(prefix) {
                    return false;
                }
                if !complete {
                    return true;
                }
                let Ok(line) = std::str::from_utf8(trim_cr(start)) else {
                    return false;
                };
                let mut tokens = line.split_ascii_whitespace();
                tokens.next().is_some_and(|v| v.starts_with(HTTP_VERSION_PREFIX))
                    && tokens.next().is_some_and(|status| {
                        http::StatusCode::from_bytes(status.as_bytes()).is_ok()
                    })
            }
        }
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Option<Bytes> {
        let line_end = src.iter().position(|&b| b == b'\n');
        if !self.plausible_start(&src[..line_end.unwrap_or(src.len())], line_end.is_some()) {
            self.give_up("not an HTTP start line");
            return take_bytes(src, u64::MAX);
        }
        let Some(end) = head_end(src) else {
            if src.len() > config::MAX_HEAD_SIZE {
                self.give_up("head too large");
                return take_bytes(src, u64::MAX);
            }
            return None;
        };
        let head = src.split_to(end).freeze();
        self.state = match self.body_kind(&head) {
            Some(BodyKind::None | BodyKind::Length(0)) => State::Head,
            Some(BodyKind::Length(len)) => State::Body(len),
            Some(BodyKind::Chunked) => State::ChunkSize,
            Some(BodyKind::UntilClose) => State::UntilClose,
            Some(BodyKind::Tunnel) => State::Opaque,
            None => {
                self.give_up("unparsable head");
                State::Opaque
            }
        };
        trace!("decoded {:?} head of {} bytes, next {:?}", self.role, head.len(), self.state);
        Some(head)
    }

    /// Work out how the body after `head` is delimited, or `None` if `head`
    /// is not HTTP.
    fn body_kind(&self, head: &[u8]) -> Option<BodyKind> {
        let mut lines = head.split(|&b| b == b'\n').map(trim_cr);
        let start_line = std::str::from_utf8(lines.next()?).ok()?;
        let mut tokens = start_line.split_ascii_whitespace();
        let first = tokens.next()?;
        let second = tokens.next()?;
        let mut content_length = None;
        let mut chunked = false;
        for line in lines {
            let Ok(line) = std::str::from_utf8(line) else {
                continue;
            };
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            if name.eq_ignore_ascii_case(http::header::CONTENT_LENGTH.as_str()) {
                content_length = Some(value.parse::<u64>().ok()?);
            } else if name.eq_ignore_ascii_case(http::header::TRANSFER_ENCODING.as_str()) {
                chunked = value
                    .rsplit(',')
                    .next()
                    .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
            }
        }
        match self.role {
            Role::Request => {
                if !first.bytes().all(is_token_byte) || !second.is_ascii() {
                    return None;
                }
                if first == http::Method::CONNECT.as_str() {
                    Some(BodyKind::Tunnel)
                } else if chunked {
                    Some(BodyKind::Chunked)
                } else {
                    Some(BodyKind::Length(content_length.unwrap_or(0)))
                }
            }
            Role::Response => {
                if !first.starts_with("HTTP/") {
                    return None;
                }
                let status = http::StatusCode::from_bytes(second.as_bytes()).ok()?;
                if status == http::StatusCode::SWITCHING_PROTOCOLS {
                    Some(BodyKind::Tunnel)
                } else if status.is_informational()
                    || status == http::StatusCode::NO_CONTENT
                    || status == http::StatusCode::NOT_MODIFIED
                {
                    Some(BodyKind::None)
                } else if chunked {
                    Some(BodyKind::Chunked)
                } else if let Some(len) = content_length {
                    Some(BodyKind::Length(len))
                } else {
                    Some(BodyKind::UntilClose)
                }
            }
        }
    }

    fn decode_chunk_size(&mut self, src: &mut BytesMut) -> Option<Bytes> {
        let Some(end) = find(src, b"\n") else {
            if src.len() > config::MAX_HEAD_SIZE {
                self.give_up("chunk size line too long");
                return take_bytes(src, u64::MAX);
            }
            return None;
        };
        let line = src.split_to(end + 1).freeze();
        let size = std::str::from_utf8(trim_cr(&line[..end]))
            .ok()
            .and_then(|s| {
                let s = s.split(';').next().unwrap_or_default().trim();
                u64::from_str_radix(s, 16).ok()
            });
        self.state = match size {
            Some(0) => State::Trailers,
            Some(size) => State::ChunkData(size.saturating_add(2)),
            None => {
                self.give_up("bad chunk size");
                State::Opaque
            }
        };
        Some(line)
    }

    fn decode_trailer(&mut self, src: &mut BytesMut) -> Option<Bytes> {
        let Some(end) = find(src, b"\n") else {
            if src.len() > config::MAX_HEAD_SIZE {
                self.give_up("trailer too long");
                return take_bytes(src, u64::MAX);
            }
            return None;
        };
        let line = src.split_to(end + 1).freeze();
        if trim_cr(&line[..end]).is_empty() {
            // Empty line ends the message
            self.state = State::Head;
        }
        Some(line)
    }
}

impl Decoder for HttpCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        let chunk = match self.state {
            State::Head => self.decode_head(src),
            State::Body(remaining) => {
                let chunk = take_bytes(src, remaining);
                if let Some(chunk) = &chunk {
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 { State::Head } else { State::Body(left) };
                }
                chunk
            }
            State::ChunkSize => self.decode_chunk_size(src),
            State::ChunkData(remaining) => {
                let chunk = take_bytes(src, remaining);
                if let Some(chunk) = &chunk {
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        State::ChunkSize
                    } else {
                        State::ChunkData(left)
                    };
                }
                chunk
            }
            State::Trailers => self.decode_trailer(src),
            State::UntilClose | State::Opaque => take_bytes(src, u64::MAX),
        };
        Ok(chunk)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if let Some(chunk) = self.decode(src)? {
            return Ok(Some(chunk));
        }
        // A truncated message still goes through as-is
        if !src.is_empty() {
            trace!("passing {} trailing bytes through at EOF", src.len());
        }
        Ok(take_bytes(src, u64::MAX))
    }
}

impl Encoder<Bytes> for HttpCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        encode_verbatim(&item, dst);
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the head at the start of `buf`, up to and including the empty
/// line that ends it. Bare `\n` line endings are accepted.
fn head_end(buf: &[u8]) -> Option<usize> {
    buf.iter()
        .enumerate()
        .filter(|&(_, &b)| b == b'\n')
        .find_map(|(i, _)| match &buf[i + 1..] {
            [b'\n', ..] => Some(i + 2),
            [b'\r', b'\n', ..] => Some(i + 3),
            _ => None,
        })
}

/// `tchar` from RFC 9110, the characters of a method name.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}
