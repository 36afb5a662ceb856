//! The HTTP/1.1 request-decoding state machine.
//!
//! A stateful [`monoio_codec::Decoder`] turning the connection's byte
//! stream into framed events: one [`H1Frame::Head`] per message, zero or
//! more [`H1Frame::Data`], and a terminal [`H1Frame::End`] carrying any
//! chunked trailers. The request head is parsed with `httparse`; framing
//! (content-length vs chunked), limits (URI length, header size), the
//! `Expect` handshake, hop-by-hop header normalization and cookie folding
//! all happen here, so the frames already carry the internal immutable
//! header representation.
//!
//! Protocol errors are fatal to the connection: the caller answers with
//! [`DecodeError::status`] if it still can, then closes. After an accepted
//! upgrade the caller flips the decoder into tunnel mode and every
//! subsequent byte is delivered opaquely.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use lagoon_core::config::RequestLimits;
use monoio_codec::{Decoded, Decoder};
use tracing::debug;

const MAX_HEADER_COUNT: usize = 96;
const MAX_CHUNK_SIZE_LINE: usize = 64;

#[derive(Debug)]
pub enum H1Frame {
    Head(RequestHead),
    Data(Bytes),
    /// End of the message body, with trailers when the message was chunked
    /// and carried any.
    End(Option<HeaderMap>),
}

/// A decoded request head with framing already resolved and headers
/// normalized for the protocol-independent layer.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    /// Origin-form request target (`/path?query`), or `*` for OPTIONS.
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: BodyKind,
    pub expect_continue: bool,
    pub keepalive: bool,
    pub upgrade: Option<UpgradeKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Fixed(u64),
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeKind {
    H2c,
    WebSocket,
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("malformed request: {0}")]
    BadRequest(&'static str),
    #[error("request target too long")]
    UriTooLong,
    #[error("header section too large")]
    HeaderFieldsTooLarge,
    #[error("method not supported")]
    MethodNotAllowed,
    #[error("unsupported expectation")]
    ExpectationFailed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// The status that best explains the failure to the peer, when a
    /// response can still be written.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DecodeError::BadRequest(_) => Some(StatusCode::BAD_REQUEST),
            DecodeError::UriTooLong => Some(StatusCode::URI_TOO_LONG),
            DecodeError::HeaderFieldsTooLarge => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            DecodeError::MethodNotAllowed => Some(StatusCode::METHOD_NOT_ALLOWED),
            DecodeError::ExpectationFailed => Some(StatusCode::EXPECTATION_FAILED),
            DecodeError::Io(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    ChunkTrailers,
    Tunnel,
}

pub struct RequestDecoder {
    state: State,
    limits: RequestLimits,
}

impl RequestDecoder {
    pub fn new(limits: RequestLimits) -> Self {
        Self {
            state: State::Head,
            limits,
        }
    }

    /// Deliver all further bytes as opaque data frames; entered after an
    /// accepted WebSocket upgrade.
    pub fn set_tunnel(&mut self) {
        self.state = State::Tunnel;
    }

    pub fn is_tunnel(&self) -> bool {
        self.state == State::Tunnel
    }

    /// True between messages; only then may the connection be retired
    /// cleanly.
    pub fn is_idle(&self) -> bool {
        self.state == State::Head
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<H1Frame>, DecodeError> {
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut parsed = httparse::Request::new(&mut header_buf);
        let head_len = match parsed.parse(src) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if !src.contains(&b'\n') && src.len() > self.limits.max_uri_length {
                    return Err(DecodeError::UriTooLong);
                }
                if src.len() > self.limits.max_header_bytes {
                    return Err(DecodeError::HeaderFieldsTooLarge);
                }
                return Ok(None);
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Err(DecodeError::HeaderFieldsTooLarge)
            }
            Err(err) => {
                debug!("request head rejected: {err}");
                return Err(DecodeError::BadRequest("unparseable request head"));
            }
        };

        let method = parse_method(parsed.method.unwrap_or(""))?;
        let target = parsed.path.unwrap_or("").to_string();
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            _ => return Err(DecodeError::BadRequest("unsupported http version")),
        };
        validate_target(&target, &method)?;
        if target.len() > self.limits.max_uri_length {
            return Err(DecodeError::UriTooLong);
        }

        let mut headers = HeaderMap::with_capacity(parsed.headers.len());
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|_| DecodeError::BadRequest("invalid header name"))?;
            let value = HeaderValue::from_bytes(h.value)
                .map_err(|_| DecodeError::BadRequest("invalid header value"))?;
            headers.append(name, value);
        }
        src.advance(head_len);

        let body = resolve_body_framing(&headers)?;
        let expect_continue = resolve_expect(&mut headers, version)?;
        let connection = connection_tokens(&headers);
        let keepalive = match version {
            Version::HTTP_10 => connection.iter().any(|t| t == "keep-alive"),
            _ => !connection.iter().any(|t| t == "close"),
        };
        let upgrade = if connection.iter().any(|t| t == "upgrade") {
            resolve_upgrade(&headers)
        } else {
            None
        };
        normalize_headers(&mut headers, &connection);

        self.state = match body {
            BodyKind::Empty => State::Head,
            BodyKind::Fixed(n) => State::FixedBody { remaining: n },
            BodyKind::Chunked => State::ChunkSize,
        };

        Ok(Some(H1Frame::Head(RequestHead {
            method,
            target,
            version,
            headers,
            body,
            expect_continue,
            keepalive,
            upgrade,
        })))
    }

    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<H1Frame>, DecodeError> {
        self.decode_inner(src)
    }
}

impl Decoder for RequestDecoder {
    type Item = H1Frame;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<H1Frame>, DecodeError> {
        match self.decode_inner(src)? {
            Some(frame) => Ok(Decoded::Some(frame)),
            None => Ok(Decoded::Insufficient),
        }
    }
}

impl RequestDecoder {
    fn decode_inner(&mut self, src: &mut BytesMut) -> Result<Option<H1Frame>, DecodeError> {
        loop {
            match self.state {
                State::Head => return self.decode_head(src),
                State::FixedBody { remaining } => {
                    if remaining == 0 {
                        self.state = State::Head;
                        return Ok(Some(H1Frame::End(None)));
                    }
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = (src.len() as u64).min(remaining) as usize;
                    let data = src.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.state = State::FixedBody { remaining };
                    return Ok(Some(H1Frame::Data(data)));
                }
                State::ChunkSize => {
                    let Some(line_end) = find_crlf(src) else {
                        if src.len() > MAX_CHUNK_SIZE_LINE {
                            return Err(DecodeError::BadRequest("chunk size line too long"));
                        }
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&src[..line_end])?;
                    src.advance(line_end + 2);
                    self.state = if size == 0 {
                        State::ChunkTrailers
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                State::ChunkData { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = (src.len() as u64).min(remaining) as usize;
                    let data = src.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                    return Ok(Some(H1Frame::Data(data)));
                }
                State::ChunkDataEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(DecodeError::BadRequest("missing chunk terminator"));
                    }
                    src.advance(2);
                    self.state = State::ChunkSize;
                }
                State::ChunkTrailers => {
                    if src.starts_with(b"\r\n") {
                        src.advance(2);
                        self.state = State::Head;
                        return Ok(Some(H1Frame::End(None)));
                    }
                    let Some(block_end) = find_double_crlf(src) else {
                        if src.len() > self.limits.max_header_bytes {
                            return Err(DecodeError::HeaderFieldsTooLarge);
                        }
                        return Ok(None);
                    };
                    let trailers = parse_trailers(&src[..block_end + 4])?;
                    src.advance(block_end + 4);
                    self.state = State::Head;
                    return Ok(Some(H1Frame::End(Some(trailers))));
                }
                State::Tunnel => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let data = src.split_to(src.len()).freeze();
                    return Ok(Some(H1Frame::Data(data)));
                }
            }
        }
    }
}

fn parse_method(token: &str) -> Result<Method, DecodeError> {
    // CONNECT is deliberately grouped with unknown methods: this server
    // does not proxy.
    match token {
        "GET" => Ok(Method::GET),
        "HEAD" => Ok(Method::HEAD),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "OPTIONS" => Ok(Method::OPTIONS),
        "TRACE" => Ok(Method::TRACE),
        "PATCH" => Ok(Method::PATCH),
        _ => Err(DecodeError::MethodNotAllowed),
    }
}

fn validate_target(target: &str, method: &Method) -> Result<(), DecodeError> {
    if target == "*" {
        if method == Method::OPTIONS {
            return Ok(());
        }
        return Err(DecodeError::BadRequest("asterisk target requires OPTIONS"));
    }
    if !target.starts_with('/') {
        return Err(DecodeError::BadRequest("request target must be origin form"));
    }
    Ok(())
}

fn resolve_body_framing(headers: &HeaderMap) -> Result<BodyKind, DecodeError> {
    let has_te = headers.contains_key(header::TRANSFER_ENCODING);
    let has_cl = headers.contains_key(header::CONTENT_LENGTH);
    if has_te {
        if has_cl {
            // RFC 7230 §3.3.3: reject rather than guess at smuggling bait.
            return Err(DecodeError::BadRequest("conflicting message length"));
        }
        let mut codings = Vec::new();
        for value in headers.get_all(header::TRANSFER_ENCODING) {
            let value = value
                .to_str()
                .map_err(|_| DecodeError::BadRequest("invalid transfer-encoding"))?;
            codings.extend(value.split(',').map(|t| t.trim().to_ascii_lowercase()));
        }
        if codings.last().map(String::as_str) != Some("chunked") {
            return Err(DecodeError::BadRequest("unsupported transfer encoding"));
        }
        return Ok(BodyKind::Chunked);
    }
    if has_cl {
        let mut resolved: Option<u64> = None;
        for value in headers.get_all(header::CONTENT_LENGTH) {
            let text = value
                .to_str()
                .map_err(|_| DecodeError::BadRequest("malformed content-length"))?
                .trim();
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(DecodeError::BadRequest("malformed content-length"));
            }
            let parsed: u64 = text
                .parse()
                .map_err(|_| DecodeError::BadRequest("malformed content-length"))?;
            if resolved.replace(parsed).is_some_and(|prev| prev != parsed) {
                return Err(DecodeError::BadRequest("conflicting content-length"));
            }
        }
        return Ok(match resolved {
            Some(0) | None => BodyKind::Empty,
            Some(n) => BodyKind::Fixed(n),
        });
    }
    Ok(BodyKind::Empty)
}

fn resolve_expect(headers: &mut HeaderMap, version: Version) -> Result<bool, DecodeError> {
    let values: Vec<HeaderValue> = headers
        .get_all(header::EXPECT)
        .iter()
        .cloned()
        .collect();
    headers.remove(header::EXPECT);
    if version == Version::HTTP_10 || values.is_empty() {
        // HTTP/1.0 requests ignore Expect entirely.
        return Ok(false);
    }
    // TODO(revisit): RFC 7231 permits a list of expectations; only the
    // single exact 100-continue token is honored for now.
    if values.len() == 1 {
        if let Ok(value) = values[0].to_str() {
            if value.trim().eq_ignore_ascii_case("100-continue") {
                return Ok(true);
            }
        }
    }
    Err(DecodeError::ExpectationFailed)
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    let mut tokens = Vec::new();
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            tokens.extend(
                value
                    .split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty()),
            );
        }
    }
    tokens
}

fn resolve_upgrade(headers: &HeaderMap) -> Option<UpgradeKind> {
    let value = headers.get(header::UPGRADE)?.to_str().ok()?;
    let mut protocols = value.split(',').map(str::trim);
    if protocols.clone().any(|p| p.eq_ignore_ascii_case("h2c")) {
        return Some(UpgradeKind::H2c);
    }
    if protocols.any(|p| p.eq_ignore_ascii_case("websocket")) {
        return Some(UpgradeKind::WebSocket);
    }
    None
}

/// Strip hop-by-hop headers so the request converts cleanly to the
/// HTTP/2-compatible internal form, and fold multiple `Cookie` lines into
/// one.
fn normalize_headers(headers: &mut HeaderMap, connection_tokens: &[String]) {
    for token in connection_tokens {
        if let Ok(name) = token.parse::<HeaderName>() {
            headers.remove(name);
        }
    }
    headers.remove(header::CONNECTION);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
    headers.remove(header::TE);
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
    headers.remove("http2-settings");

    if headers.get_all(header::COOKIE).iter().count() > 1 {
        let folded = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join("; ");
        if let Ok(value) = HeaderValue::from_str(&folded) {
            headers.remove(header::COOKIE);
            headers.insert(header::COOKIE, value);
        }
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|w| w == b"\r\n")
}

fn find_double_crlf(src: &[u8]) -> Option<usize> {
    src.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, DecodeError> {
    let line = match line.iter().position(|&b| b == b';') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let text = std::str::from_utf8(line)
        .map_err(|_| DecodeError::BadRequest("invalid chunk size"))?
        .trim();
    if text.is_empty() {
        return Err(DecodeError::BadRequest("invalid chunk size"));
    }
    u64::from_str_radix(text, 16).map_err(|_| DecodeError::BadRequest("invalid chunk size"))
}

fn parse_trailers(block: &[u8]) -> Result<HeaderMap, DecodeError> {
    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let (_, parsed) = match httparse::parse_headers(block, &mut header_buf) {
        Ok(httparse::Status::Complete(done)) => done,
        _ => return Err(DecodeError::BadRequest("malformed trailers")),
    };
    let mut trailers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| DecodeError::BadRequest("invalid trailer name"))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| DecodeError::BadRequest("invalid trailer value"))?;
        trailers.append(name, value);
    }
    Ok(trailers)
}
