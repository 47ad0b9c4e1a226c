//! HTTP/1.1 request-line and header parsing (§4.E).
//!
//! Grounded on `bin/httpd/src/main.rs`'s `parse_request`: tolerant of bare
//! `\n` line endings in addition to `\r\n`, and a deliberately small set of
//! methods. A space before the header colon (`"Host : x"`) is a hard parse
//! error rather than being trimmed away, matching the original's strict
//! rejection of ambiguous framing.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
}

/// Methods the REST and filesystem handlers actually act on. Anything else
/// parses fine but is turned away with 501 before it ever reaches the
/// handler chain (§6: "Supports GET, HEAD, POST, PUT; others return 501").
pub fn is_supported_method(method: Method) -> bool {
    matches!(method, Method::Get | Method::Head | Method::Post | Method::Put)
}

impl Method {
    fn parse(s: &str) -> Result<Method, ParseError> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "CONNECT" => Ok(Method::Connect),
            _ => Err(ParseError::not_implemented("unknown method")),
        }
    }
}

/// A malformed or unsupported request, carrying the HTTP status the
/// pipeline should answer with rather than a bare protocol error that would
/// otherwise propagate out of the reactor's dispatch loop and leave the
/// connection hanging with no response at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError {
    pub status: u16,
    pub reason: &'static str,
}

impl ParseError {
    fn bad_request(reason: &'static str) -> Self {
        ParseError { status: 400, reason }
    }

    fn not_implemented(reason: &'static str) -> Self {
        ParseError { status: 501, reason }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.status)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version_minor: u8,
    pub headers: HashMap<String, String>,
    /// Byte length of the parsed header block, including the terminating
    /// blank line, so the caller knows where the message body starts.
    pub header_len: usize,
    /// Request body, once `Content-Length` bytes have been fully buffered.
    /// `None` for bodyless requests and while a body is still arriving.
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Split `buf` into lines on `\r\n` or bare `\n`, returning `(line, next_pos)`
/// pairs. Used by both the request-line and header scanners below.
fn next_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = &buf[start..];
    let nl = rest.iter().position(|&b| b == b'\n')?;
    let mut end = nl;
    if end > 0 && rest[end - 1] == b'\r' {
        end -= 1;
    }
    Some((&rest[..end], start + nl + 1))
}

/// Attempt to parse a full request (request line, headers, and body) out of
/// `buf`. Returns `Ok(None)` if the header block or the `Content-Length`
/// body isn't fully buffered yet, so the pipeline can keep accumulating
/// bytes and retry.
pub fn parse_request(buf: &[u8]) -> Result<Option<Request>, ParseError> {
    let Some((line, mut pos)) = next_line(buf, 0) else { return Ok(None) };
    let line = std::str::from_utf8(line).map_err(|_| ParseError::bad_request("non-utf8 request line"))?;
    let mut parts = line.split(' ');
    let method = parts.next().ok_or(ParseError::bad_request("missing method"))?;
    let uri = parts.next().ok_or(ParseError::bad_request("missing uri"))?;
    let version = parts.next().ok_or(ParseError::bad_request("missing version"))?;
    if parts.next().is_some() {
        return Err(ParseError::bad_request("malformed request line"));
    }
    let version_minor = match version {
        "HTTP/1.0" => 0,
        "HTTP/1.1" => 1,
        _ => return Err(ParseError::bad_request("unsupported http version")),
    };
    let method = Method::parse(method)?;

    let mut headers = HashMap::new();
    loop {
        let Some((line, next_pos)) = next_line(buf, pos) else { return Ok(None) };
        if line.is_empty() {
            pos = next_pos;
            break;
        }
        let line = std::str::from_utf8(line).map_err(|_| ParseError::bad_request("non-utf8 header"))?;
        let colon = line.find(':').ok_or(ParseError::bad_request("header missing colon"))?;
        let (name, rest) = line.split_at(colon);
        if name.ends_with(' ') || name.ends_with('\t') {
            return Err(ParseError::bad_request("space before header colon"));
        }
        let value = rest[1..].trim_start();
        headers.insert(name.to_ascii_lowercase(), value.to_string());
        pos = next_pos;
    }

    let mut req = Request { method, uri: uri.to_string(), version_minor, headers, header_len: pos, body: None };
    let body_end = req.header_len + req.content_length();
    if buf.len() < body_end {
        return Ok(None);
    }
    if body_end > req.header_len {
        req.body = Some(buf[req.header_len..body_end].to_vec());
    }
    Ok(Some(req))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_method_uri_and_headers() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: switch.local\r\nContent-Length: 0\r\n\r\n";
        let req = parse_request(raw).unwrap().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.uri, "/index.html");
        assert_eq!(req.version_minor, 1);
        assert_eq!(req.header("host"), Some("switch.local"));
        assert_eq!(req.header_len, raw.len());
        assert!(req.body.is_none());
    }

    #[test]
    fn tolerates_bare_lf_line_endings() {
        let raw = b"GET / HTTP/1.1\nHost: x\n\n";
        let req = parse_request(raw).unwrap().unwrap();
        assert_eq!(req.uri, "/");
        assert_eq!(req.header("host"), Some("x"));
    }

    #[test]
    fn incomplete_header_block_returns_none() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n";
        assert!(parse_request(raw).unwrap().is_none());
    }

    #[test]
    fn space_before_colon_is_a_hard_error() {
        let raw = b"GET / HTTP/1.1\r\nHost : x\r\n\r\n";
        let err = parse_request(raw).unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[test]
    fn unknown_method_is_not_implemented() {
        let raw = b"PATCH / HTTP/1.1\r\n\r\n";
        let err = parse_request(raw).unwrap_err();
        assert_eq!(err.status, 501);
    }

    #[test]
    fn content_length_defaults_to_zero() {
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        let req = parse_request(raw).unwrap().unwrap();
        assert_eq!(req.content_length(), 0);
    }

    #[test]
    fn body_waits_for_full_content_length_before_completing() {
        let raw = b"PUT /rest/gpios/0 HTTP/1.1\r\nContent-Length: 13\r\n\r\n{\"level\":tr";
        assert!(parse_request(raw).unwrap().is_none());
    }

    #[test]
    fn body_is_extracted_once_fully_buffered() {
        let raw = b"PUT /rest/gpios/0 HTTP/1.1\r\nContent-Length: 14\r\n\r\n{\"level\":true}";
        let req = parse_request(raw).unwrap().unwrap();
        assert_eq!(req.body.as_deref(), Some(&b"{\"level\":true}"[..]));
    }
}
