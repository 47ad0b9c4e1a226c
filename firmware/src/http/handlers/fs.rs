//! Static file handler backed by DBFFS (§4.G). The MIME table and
//! directory-index fallback are carried over near verbatim from
//! `bin/httpd/src/main.rs`'s `mime_type_for`/`handle_request`.

use crate::conntable::{Category, Connection, ConnId};
use crate::dbffs::Dbffs;
use crate::error::{FwError, FwResult};
use crate::http::handlers::deny::is_safe_path;
use crate::http::parser::{Method, Request};
use crate::http::pipeline::{HandlerResult, HttpHandler};

fn mime_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Serves the read-only DBFFS image over HTTP. Registered last in the
/// handler chain so REST/WS upgrade handlers get first refusal.
pub struct FsHandler {
    image: Vec<u8>,
}

impl FsHandler {
    pub fn new(image: Vec<u8>) -> Self {
        FsHandler { image }
    }

    fn resolve(&self, uri: &str) -> String {
        if uri.ends_with('/') || uri.is_empty() {
            format!("{uri}index.html")
        } else {
            uri.to_string()
        }
    }
}

impl HttpHandler for FsHandler {
    fn matches(&self, _uri: &str) -> bool {
        // Fallback handler: always matches when nothing more specific did.
        true
    }

    fn handle(&mut self, _conn_id: ConnId, req: &Request, conn: &mut Connection) -> FwResult<HandlerResult> {
        if !matches!(req.method, Method::Get | Method::Head) {
            return Ok(HandlerResult::DoneError(405));
        }
        if !is_safe_path(&req.uri) {
            return Ok(HandlerResult::DoneError(403));
        }
        let path = self.resolve(&req.uri);
        let fs = match Dbffs::new(&self.image) {
            Ok(fs) => fs,
            Err(_) => return Ok(HandlerResult::DoneError(500)),
        };
        let file = match fs.find(&path) {
            Ok(f) => f,
            // Not found: fall through rather than claim the request, so a
            // later error-page handler (or, absent one, the default 404)
            // gets to respond.
            Err(_) => return Ok(HandlerResult::DoneContinue),
        };

        let (headers_sent, stream_offset) = match &conn.category {
            Category::Http(s) => (s.headers_sent, s.stream_offset),
            _ => return Err(FwError::Invariant("fs handler on non-http connection")),
        };

        let mut wrote = 0usize;
        if !headers_sent {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                mime_type_for(&path),
                file.size
            );
            let n = conn.send_buf.append(head.as_bytes());
            wrote += n;
            if n < head.len() {
                // Send buffer is too full even for the headers; ask the
                // pipeline to re-enter once it has drained (§4.F
                // "Backpressure").
                return Ok(HandlerResult::Wrote(wrote));
            }
            if let Category::Http(s) = &mut conn.category {
                s.headers_sent = true;
            }
            if req.method == Method::Head {
                return Ok(HandlerResult::DoneFinal);
            }
        }

        // Stream the body in chunks sized to whatever send-buffer space
        // remains (§4.G "streams the file in ≤1440-byte chunks sized to
        // fit the remaining send-buffer space").
        let remaining = &file.data[stream_offset..];
        if remaining.is_empty() {
            return Ok(HandlerResult::DoneFinal);
        }
        let n = conn.send_buf.append(remaining);
        wrote += n;
        if let Category::Http(s) = &mut conn.category {
            s.stream_offset += n;
        }
        if stream_offset + n >= file.data.len() {
            Ok(HandlerResult::DoneFinal)
        } else {
            Ok(HandlerResult::Wrote(wrote))
        }
    }
}
