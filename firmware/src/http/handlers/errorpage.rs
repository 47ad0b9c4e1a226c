//! Canned error-page bodies (§4.G). Grounded on `bin/httpd/src/main.rs`'s
//! `send_error`: a short fixed HTML body per status code, written directly
//! rather than templated, since the set of codes this firmware ever emits
//! is small and fixed.

use crate::conntable::{Connection, ConnId};
use crate::dbffs::Dbffs;
use crate::error::FwResult;
use crate::http::parser::Request;
use crate::http::pipeline::{HandlerResult, HttpHandler};

fn reason_phrase(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Error",
    }
}

pub fn write_error(conn: &mut Connection, code: u16) -> FwResult<()> {
    let reason = reason_phrase(code);
    let body = format!(
        "<!DOCTYPE html><html><head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1></body></html>"
    );
    let head = format!(
        "HTTP/1.1 {code} {reason}\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    conn.send_buf.append(head.as_bytes());
    conn.send_buf.append(body.as_bytes());
    Ok(())
}

/// Last-resort handler that lets the DBFFS image override a canned error
/// body with a custom one. Registered after `FsHandler`: once every earlier
/// handler has declined (`DoneContinue`) and at least one of them recorded a
/// status via `DoneError`, this looks up `/<code>.html` and serves it if
/// present; otherwise it declines too, and the chain falls back to
/// `write_error`'s built-in page.
pub struct ErrorPageFsHandler {
    image: Vec<u8>,
}

impl ErrorPageFsHandler {
    pub fn new(image: Vec<u8>) -> Self {
        ErrorPageFsHandler { image }
    }
}

impl HttpHandler for ErrorPageFsHandler {
    fn matches(&self, _uri: &str) -> bool {
        true
    }

    fn handle(&mut self, _conn_id: ConnId, _req: &Request, conn: &mut Connection) -> FwResult<HandlerResult> {
        let code = match &conn.category {
            crate::conntable::Category::Http(state) => state.status,
            _ => None,
        };
        let Some(code) = code.filter(|c| *c >= 400) else {
            return Ok(HandlerResult::DoneContinue);
        };
        let path = format!("/{code}.html");
        let Ok(fs) = Dbffs::new(&self.image) else {
            return Ok(HandlerResult::DoneContinue);
        };
        let file = match fs.find(&path) {
            Ok(f) => f,
            Err(_) => return Ok(HandlerResult::DoneContinue),
        };
        let reason = reason_phrase(code);
        let head = format!(
            "HTTP/1.1 {code} {reason}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            file.size
        );
        conn.send_buf.append(head.as_bytes());
        conn.send_buf.append(file.data);
        Ok(HandlerResult::DoneFinal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntable::{Category, SendBuffer};
    use crate::http::pipeline::HttpState;
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    fn test_conn() -> Connection {
        Connection {
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            local_ip: Ipv4Addr::UNSPECIFIED,
            local_port: 80,
            category: Category::Http(HttpState::new()),
            send_buf: SendBuffer::new(),
            closing: false,
            timeout: Duration::from_secs(30),
            last_activity: Instant::now(),
            is_listener: false,
        }
    }

    #[test]
    fn writes_status_line_and_matching_content_length() {
        let mut conn = test_conn();
        write_error(&mut conn, 404).unwrap();
        let out = String::from_utf8(conn.send_buf.as_slice().to_vec()).unwrap();
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        let body_start = out.find("\r\n\r\n").unwrap() + 4;
        let body_len = out.len() - body_start;
        let cl: usize = out
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(cl, body_len);
    }

    fn req() -> Request {
        Request { method: crate::http::parser::Method::Get, uri: "/missing".into(), version_minor: 1, headers: Default::default(), header_len: 0, body: None }
    }

    #[test]
    fn serves_custom_error_page_when_present_in_dbffs() {
        let image = crate::dbffs::DbffsBuilder::new().file("404.html", b"custom not found").build();
        let mut handler = ErrorPageFsHandler::new(image);
        let mut conn = test_conn();
        if let Category::Http(state) = &mut conn.category {
            state.status = Some(404);
        }
        let result = handler.handle(0, &req(), &mut conn).unwrap();
        assert!(matches!(result, HandlerResult::DoneFinal));
        assert!(conn.send_buf.as_slice().ends_with(b"custom not found"));
    }

    #[test]
    fn declines_when_no_custom_page_exists() {
        let image = crate::dbffs::DbffsBuilder::new().file("index.html", b"hi").build();
        let mut handler = ErrorPageFsHandler::new(image);
        let mut conn = test_conn();
        if let Category::Http(state) = &mut conn.category {
            state.status = Some(404);
        }
        let result = handler.handle(0, &req(), &mut conn).unwrap();
        assert!(matches!(result, HandlerResult::DoneContinue));
    }

    #[test]
    fn declines_when_no_error_status_recorded() {
        let image = crate::dbffs::DbffsBuilder::new().file("404.html", b"custom").build();
        let mut handler = ErrorPageFsHandler::new(image);
        let mut conn = test_conn();
        let result = handler.handle(0, &req(), &mut conn).unwrap();
        assert!(matches!(result, HandlerResult::DoneContinue));
    }
}
