//! Raw HTTP/1.x parsing and rendering for the upgrade handshake.
//!
//! Only what the handshake needs is implemented: one request per connection, parsed once the
//! whole header block (terminated by an empty line) has arrived, and simple responses with
//! an optional body. There is no keep-alive and no request body.
use std::net::{IpAddr, SocketAddr};

use ::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use bytes::{BufMut, Bytes, BytesMut};
use ipnet::IpNet;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    combinator::{all_consuming, rest, value},
    sequence::{preceded, terminated},
    IResult, Parser,
};

use crate::{Result, WebSocketError};

/// Default cap on the bytes buffered before the header block completes.
pub const MAX_REQUEST_SIZE: usize = 4096;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// A parsed upgrade request.
///
/// `Request` is an immutable snapshot: accessors hand out borrows or copies, never a way to
/// modify what was received.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    cookies: Vec<(String, String)>,
    peer_addr: Option<SocketAddr>,
    client_ip: Option<IpAddr>,
}

impl Request {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request-target exactly as sent, path and query included.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The path component of the request-target.
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    /// The raw query string, without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, query)| query)
    }

    /// Decoded `key=value` pairs of the query string.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query()
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The first value of header `name` (case-insensitive), if it is visible ASCII.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Every comma-separated token of every `name` header, trimmed.
    pub fn header_tokens(&self, name: impl header::AsHeaderName) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .collect()
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Address of the TCP peer.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Address of the real client: the forwarded address when the peer is a trusted proxy,
    /// the peer address otherwise.
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }
}

/// Incremental parser for the upgrade request.
///
/// Feed it the cumulative bytes received on a connection; it answers `Ok(None)` until the
/// header block is complete.
#[derive(Debug, Clone)]
pub struct RequestParser {
    max_size: usize,
    trusted_proxies: Vec<IpNet>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new(MAX_REQUEST_SIZE)
    }
}

impl RequestParser {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            trusted_proxies: Vec::new(),
        }
    }

    /// Peers inside these networks may set `Forwarded` / `X-Forwarded-For`.
    pub fn with_trusted_proxies(self, trusted_proxies: Vec<IpNet>) -> Self {
        Self {
            trusted_proxies,
            ..self
        }
    }

    /// Parses `buffer` once it holds a complete header block.
    ///
    /// # Returns
    /// - `Ok(Some((request, consumed)))` with the number of bytes the header block used. Bytes
    ///   after it already belong to the WebSocket stream.
    /// - `Ok(None)` while the header block is incomplete.
    ///
    /// # Errors
    /// - `RequestTooLarge` if the header block does not fit in the configured maximum.
    /// - `MalformedRequest` if the request line or a header line is invalid.
    pub fn parse(
        &self,
        buffer: &[u8],
        peer_addr: Option<SocketAddr>,
    ) -> Result<Option<(Request, usize)>> {
        let Some(end) = find_terminator(buffer) else {
            if buffer.len() > self.max_size {
                return Err(WebSocketError::RequestTooLarge);
            }
            return Ok(None);
        };

        let consumed = end + HEADER_TERMINATOR.len();
        if consumed > self.max_size {
            return Err(WebSocketError::RequestTooLarge);
        }

        let mut lines = buffer[..end]
            .split(|&byte| byte == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

        let request_line = lines
            .next()
            .ok_or(WebSocketError::MalformedRequest("request line"))?;
        let (_, (method, target, version)) = request_line_parser(request_line)
            .map_err(|_| WebSocketError::MalformedRequest("request line"))?;

        let method =
            Method::from_bytes(method).map_err(|_| WebSocketError::MalformedRequest("method"))?;
        let target = String::from_utf8(target.to_vec())
            .map_err(|_| WebSocketError::MalformedRequest("request target"))?;

        let mut headers = HeaderMap::new();
        for line in lines {
            let (_, (name, value)) = header_line_parser(line)
                .map_err(|_| WebSocketError::MalformedRequest("header line"))?;
            let name = HeaderName::from_bytes(name)
                .map_err(|_| WebSocketError::MalformedRequest("header name"))?;
            let value = HeaderValue::from_bytes(value.trim_ascii())
                .map_err(|_| WebSocketError::MalformedRequest("header value"))?;
            headers.append(name, value);
        }

        let cookies = parse_cookies(&headers);
        let client_ip = peer_addr.map(|peer| self.resolve_client_ip(peer.ip(), &headers));

        Ok(Some((
            Request {
                method,
                target,
                version,
                headers,
                cookies,
                peer_addr,
                client_ip,
            },
            consumed,
        )))
    }

    fn resolve_client_ip(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        if !self.trusted_proxies.iter().any(|net| net.contains(&peer)) {
            return peer;
        }

        forwarded_for(headers)
            .or_else(|| x_forwarded_for(headers))
            .unwrap_or(peer)
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

fn is_token(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c)
}

/// `METHOD SP request-target SP HTTP/1.(0|1)`
fn request_line_parser(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], Version)> {
    all_consuming((
        terminated(take_while1(is_token), tag(" ")),
        terminated(take_while1(|c: u8| c > b' ' && c != 0x7F), tag(" ")),
        preceded(
            tag("HTTP/1."),
            alt((
                value(Version::HTTP_10, tag("0")),
                value(Version::HTTP_11, tag("1")),
            )),
        ),
    ))
    .parse(input)
}

/// `field-name ":" OWS field-value OWS`
fn header_line_parser(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    (terminated(take_while1(is_token), tag(":")), rest).parse(input)
}

fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim().trim_matches('"');
            Some((name.to_owned(), value.to_owned()))
        })
        .collect()
}

/// The `for=` parameter of the first `Forwarded` element (RFC 7239).
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get(header::FORWARDED)?.to_str().ok()?;
    let first = value.split(',').next()?;
    first.split(';').find_map(|param| {
        let (key, node) = param.trim().split_once('=')?;
        if !key.eq_ignore_ascii_case("for") {
            return None;
        }
        parse_node(node.trim().trim_matches('"'))
    })
}

/// The left-most address of `X-Forwarded-For`.
fn x_forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    parse_node(value.split(',').next()?.trim())
}

/// Accepts `1.2.3.4`, `1.2.3.4:80`, `::1`, `[::1]` and `[::1]:80`.
fn parse_node(node: &str) -> Option<IpAddr> {
    if let Ok(ip) = node.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(addr) = node.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    node.strip_prefix('[')?.strip_suffix(']')?.parse().ok()
}

/// An HTTP response written before the connection switches protocols or closes.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// A bodyless response that also tells the client the connection ends.
    pub fn error(status: StatusCode) -> Self {
        let mut response = Self::new(status);
        response
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        response
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Appends a header from a string value.
    ///
    /// # Errors
    /// `MalformedRequest` if `value` contains characters not allowed in a header.
    pub fn try_with_header(self, name: HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|_| WebSocketError::MalformedRequest("header value"))?;
        Ok(self.with_header(name, value))
    }

    pub fn with_body(self, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..self
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Writes the status line, headers and body.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(b"HTTP/1.1 ");
        dst.put_slice(self.status.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.status.canonical_reason().unwrap_or("").as_bytes());
        dst.put_slice(b"\r\n");

        for (name, value) in &self.headers {
            put_title_case(dst, name.as_str());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }

        if self.status != StatusCode::SWITCHING_PROTOCOLS
            && !self.headers.contains_key(header::CONTENT_LENGTH)
        {
            dst.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        dst.put_slice(b"\r\n");
        dst.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(128 + self.body.len());
        self.encode(&mut dst);
        dst.freeze()
    }

    /// Parses the status line and headers of a response, as a client reading the handshake
    /// answer would. The body, if any, is left in the buffer.
    ///
    /// # Returns
    /// `Ok(None)` until the header block is complete, otherwise the response and the number of
    /// bytes its header block used.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Response, usize)>> {
        let Some(end) = find_terminator(buffer) else {
            return Ok(None);
        };

        let mut lines = buffer[..end]
            .split(|&byte| byte == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

        let status_line = lines
            .next()
            .ok_or(WebSocketError::MalformedRequest("status line"))?;
        let (_, code) = status_line_parser(status_line)
            .map_err(|_| WebSocketError::MalformedRequest("status line"))?;
        let status = StatusCode::from_bytes(code)
            .map_err(|_| WebSocketError::MalformedRequest("status code"))?;

        let mut response = Response::new(status);
        for line in lines {
            let (_, (name, value)) = header_line_parser(line)
                .map_err(|_| WebSocketError::MalformedRequest("header line"))?;
            let name = HeaderName::from_bytes(name)
                .map_err(|_| WebSocketError::MalformedRequest("header name"))?;
            let value = HeaderValue::from_bytes(value.trim_ascii())
                .map_err(|_| WebSocketError::MalformedRequest("header value"))?;
            response.headers.append(name, value);
        }

        Ok(Some((response, end + HEADER_TERMINATOR.len())))
    }
}

/// `HTTP/1.x SP 3DIGIT SP reason-phrase`
fn status_line_parser(input: &[u8]) -> IResult<&[u8], &[u8]> {
    preceded(
        (tag("HTTP/1."), alt((tag("0"), tag("1"))), tag(" ")),
        terminated(take_while1(|c: u8| c.is_ascii_digit()), rest),
    )
    .parse(input)
}

fn put_title_case(dst: &mut BytesMut, name: &str) {
    let mut upper = true;
    for c in name.bytes() {
        dst.put_u8(if upper { c.to_ascii_uppercase() } else { c });
        upper = c == b'-';
    }
}
