//! # HTTP
//!
//! The minimal HTTP/1.1 surface needed by the WebSocket opening handshake
//! ([RFC 6455 Section 4](https://datatracker.ietf.org/doc/html/rfc6455#section-4)):
//!
//! - [`Headers`], an ordered multimap with case-insensitive lookup,
//! - [`parse_request`] / [`parse_response`] for a single header block ending in `\r\n\r\n`,
//! - [`build_request`] / [`build_response`] for the messages this crate sends,
//! - [`validate_handshake`] for the upgrade headers on either side.
//!
//! Bodies are never parsed: a handshake carries none, and whatever follows the header block
//! already belongs to the WebSocket stream.

use std::fmt;

use base64::prelude::*;
use bytes::Bytes;

use crate::{protocol::Role, Result, WebSocketError};

pub const CONNECTION: &str = "Connection";
pub const UPGRADE: &str = "Upgrade";
pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
pub const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
pub const SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
pub const HOST: &str = "Host";
pub const DATE: &str = "Date";
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Header block terminator.
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Case-insensitive HTTP headers.
///
/// Names compare case-insensitively but keep the case they were added with. Entries iterate in
/// insertion order, and a name may carry several values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value, keeping the existing values of `name`.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Removes every value of `name`, returning how many there were.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Returns the single value of `name`.
    ///
    /// # Errors
    /// [`WebSocketError::Header`] when the header is missing or has more than one value.
    pub fn get(&self, name: &str) -> Result<&str> {
        match self.get_all(name)[..] {
            [value] => Ok(value),
            [] => Err(WebSocketError::Header {
                name: name.to_string(),
                value: None,
            }),
            _ => Err(WebSocketError::Header {
                name: name.to_string(),
                value: Some("multiple values".to_string()),
            }),
        }
    }

    /// Returns the first value of `name`, if any.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns all values of `name` in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.first(name).is_some()
    }

    /// Distinct header names, in the case of their first occurrence.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (name, _) in &self.entries {
            if !names.iter().any(|seen| seen.eq_ignore_ascii_case(name)) {
                names.push(name);
            }
        }
        names
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every `(name, value)` pair in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Formats the headers for transmission: one `Name: value\r\n` line per entry and the
/// terminating blank line.
impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        f.write_str("\r\n")
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.add(name, value);
        }
        headers
    }
}

/// A parsed HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Request {
    /// The request target without its query string.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }
}

/// A parsed HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

/// Returns the offset just past the header terminator, if `data` contains one.
pub fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(HEAD_END.len())
        .position(|window| window == HEAD_END)
        .map(|pos| pos + HEAD_END.len())
}

/// Splits a header block into its start line and header lines.
///
/// Lines end in CRLF. The block is decoded as ISO-8859-1, so obs-text in header values comes out
/// as U+0080..=U+00FF. The start line must be visible ASCII and spaces.
fn split_head(data: &[u8]) -> Result<(usize, Vec<String>)> {
    let consumed = find_head_end(data).ok_or(WebSocketError::IncompleteHttp)?;
    let head: String = data[..consumed - HEAD_END.len()]
        .iter()
        .map(|&b| char::from(b))
        .collect();

    let lines: Vec<String> = head.split("\r\n").map(str::to_string).collect();
    if lines.iter().any(|line| line.contains(|c: char| c == '\r' || c == '\n')) {
        return Err(WebSocketError::Handshake("HTTP lines must end in CRLF".to_string()));
    }
    let start = &lines[0];
    if start.is_empty() {
        return Err(WebSocketError::Handshake("empty HTTP message".to_string()));
    }
    if !start.bytes().all(|b| (0x21..=0x7E).contains(&b) || b == b' ') {
        return Err(WebSocketError::Handshake(
            "invalid characters in HTTP start line".to_string(),
        ));
    }
    Ok((consumed, lines))
}

fn parse_headers(lines: &[String]) -> Result<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WebSocketError::Handshake(format!("invalid header line: {line}")))?;

        // no whitespace allowed between the name and the colon, nor folded lines
        if !is_valid_header_name(name) {
            return Err(WebSocketError::Handshake(format!(
                "invalid header name: {name}"
            )));
        }
        let value = value.trim_matches(|c| c == ' ' || c == '\t');
        if !is_valid_header_value(value) {
            return Err(WebSocketError::Handshake(format!(
                "invalid header value: {value}"
            )));
        }
        headers.add(name, value);
    }
    Ok(headers)
}

/// Parses an HTTP/1.1 `GET` request from the front of `data`.
///
/// Returns the request and the number of bytes its header block occupied.
///
/// # Errors
/// - [`WebSocketError::IncompleteHttp`] when the header terminator has not arrived yet.
/// - [`WebSocketError::Handshake`] for anything malformed, another method or another version.
pub fn parse_request(data: &[u8]) -> Result<(Request, usize)> {
    let (consumed, lines) = split_head(data)?;

    let mut parts = lines[0].splitn(3, ' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(WebSocketError::Handshake(format!(
            "invalid request line: {}",
            lines[0]
        )));
    };

    if version != "HTTP/1.1" {
        return Err(WebSocketError::Handshake(format!(
            "unsupported HTTP version: {version}"
        )));
    }
    if method != "GET" {
        return Err(WebSocketError::Handshake(format!(
            "unsupported HTTP method: {method}"
        )));
    }

    let request = Request {
        method: method.to_string(),
        target: target.to_string(),
        headers: parse_headers(&lines[1..])?,
        body: None,
    };
    Ok((request, consumed))
}

/// Parses an HTTP/1.1 response from the front of `data`.
///
/// # Errors
/// Same as [`parse_request`]; the status code must lie in `100..=599`.
pub fn parse_response(data: &[u8]) -> Result<(Response, usize)> {
    let (consumed, lines) = split_head(data)?;

    let mut parts = lines[0].splitn(3, ' ');
    let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
        return Err(WebSocketError::Handshake(format!(
            "invalid status line: {}",
            lines[0]
        )));
    };
    let reason = parts.next().unwrap_or_default();

    if version != "HTTP/1.1" {
        return Err(WebSocketError::Handshake(format!(
            "unsupported HTTP version: {version}"
        )));
    }
    let status_code = status
        .parse::<u16>()
        .ok()
        .filter(|code| (100..=599).contains(code))
        .ok_or_else(|| WebSocketError::Handshake(format!("invalid status code: {status}")))?;

    let response = Response {
        status_code,
        reason: reason.to_string(),
        headers: parse_headers(&lines[1..])?,
        body: None,
    };
    Ok((response, consumed))
}

/// Canonical reason phrase of a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
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
        413 => "Content Too Large",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Current time as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Serializes a response.
///
/// A `Date` header is added when absent, and `Content-Length` is set whenever a body is given.
pub fn build_response(status: u16, mut headers: Headers, body: Option<&[u8]>) -> Bytes {
    if !headers.contains(DATE) {
        headers.set(DATE, http_date());
    }
    if let Some(body) = body {
        headers.set(CONTENT_LENGTH, body.len().to_string());
    }

    let mut data = format!("HTTP/1.1 {status} {}\r\n{headers}", reason_phrase(status)).into_bytes();
    if let Some(body) = body {
        data.extend_from_slice(body);
    }
    Bytes::from(data)
}

/// Serializes a `GET` request for `target`.
pub fn build_request(target: &str, headers: &Headers) -> Bytes {
    Bytes::from(format!("GET {target} HTTP/1.1\r\n{headers}"))
}

/// Checks the upgrade headers of a handshake.
///
/// Both sides require `Connection` to list `upgrade`, `Upgrade: websocket` and
/// `Sec-WebSocket-Version: 13`. A server (validating a request) also requires a
/// `Sec-WebSocket-Key` decoding to 16 bytes; a client (validating a response) requires a
/// `Sec-WebSocket-Accept` decoding to 20 bytes.
///
/// # Errors
/// - [`WebSocketError::Header`] for a missing, duplicated or wrong header.
/// - [`WebSocketError::Security`] for a badly encoded key or accept value.
pub fn validate_handshake(headers: &Headers, role: Role) -> Result<()> {
    let connection = headers.get(CONNECTION)?;
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(WebSocketError::Header {
            name: CONNECTION.to_string(),
            value: Some(connection.to_string()),
        });
    }

    let upgrade = headers.get(UPGRADE)?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(WebSocketError::Header {
            name: UPGRADE.to_string(),
            value: Some(upgrade.to_string()),
        });
    }

    let version = headers.get(SEC_WEBSOCKET_VERSION)?;
    if version != "13" {
        return Err(WebSocketError::Header {
            name: SEC_WEBSOCKET_VERSION.to_string(),
            value: Some(version.to_string()),
        });
    }

    match role {
        Role::Server => {
            let key = headers.get(SEC_WEBSOCKET_KEY)?;
            if decoded_len(key) != Some(16) {
                return Err(WebSocketError::Security(format!(
                    "invalid {SEC_WEBSOCKET_KEY} header"
                )));
            }
        }
        Role::Client => {
            let accept = headers.get(SEC_WEBSOCKET_ACCEPT)?;
            if decoded_len(accept) != Some(20) {
                return Err(WebSocketError::Security(format!(
                    "invalid {SEC_WEBSOCKET_ACCEPT} header"
                )));
            }
        }
    }

    Ok(())
}

fn decoded_len(value: &str) -> Option<usize> {
    BASE64_STANDARD.decode(value).ok().map(|bytes| bytes.len())
}

/// RFC 7230 token.
fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

/// Visible ASCII and obs-text with interior spaces and tabs, e.g.
/// `User-Agent: Mozilla/5.0 (X11)`.
fn is_valid_header_value(value: &str) -> bool {
    value
        .chars()
        .all(|c| matches!(c, '\x21'..='\x7E' | '\u{80}'..='\u{FF}' | ' ' | '\t'))
}
