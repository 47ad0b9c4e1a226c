//! Path-safety gate, checked before the filesystem handler ever touches
//! DBFFS. Grounded on `bin/httpd/src/main.rs`'s `is_safe_path`: requires a
//! leading `/`, rejects `..` segments and embedded NUL bytes.

use crate::conntable::{Connection, ConnId};
use crate::error::FwResult;
use crate::http::parser::Request;
use crate::http::pipeline::{HandlerResult, HttpHandler};

/// Unconditionally 403s any request under a registered prefix. Grounded on
/// `original_source/user/handlers/deny/http-deny.c`'s
/// `http_deny_all_handler`, used to wall off sensitive paths (e.g. `/cfg/`)
/// without giving the filesystem handler a chance to serve them.
pub struct DenyHandler {
    prefix: String,
}

impl DenyHandler {
    pub fn new(prefix: impl Into<String>) -> Self {
        DenyHandler { prefix: prefix.into() }
    }
}

impl HttpHandler for DenyHandler {
    fn matches(&self, uri: &str) -> bool {
        uri.starts_with(&self.prefix)
    }

    fn handle(&mut self, _conn_id: ConnId, _req: &Request, _conn: &mut Connection) -> FwResult<HandlerResult> {
        Ok(HandlerResult::DoneError(403))
    }
}

pub fn is_safe_path(uri: &str) -> bool {
    if !uri.starts_with('/') {
        return false;
    }
    if uri.as_bytes().contains(&0) {
        return false;
    }
    uri.split('/').all(|segment| segment != "..")
}
