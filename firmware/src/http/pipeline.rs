//! Response-assembly state machine and handler chain (§4.F/§4.G).
//!
//! Each connection's `HttpState` tracks where it is between "no request
//! parsed yet" and "response fully flushed". Handlers are tried in
//! registration order; the first whose URI pattern matches gets control and
//! returns a `HandlerResult` telling the pipeline what to do next. This
//! replaces the original firmware's fixed `handlers[]` table walked by
//! index with the same linear-match idea, generalized to a `Vec` any
//! embedder can extend with its own pluggable handler chain.

use crate::conntable::{Connection, ConnId};
use crate::error::{FwError, FwResult};
use crate::http::parser::{self, is_supported_method, Request};

/// Where a connection's response assembly currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePhase {
    /// Accumulating request bytes; no complete request line + headers yet.
    AwaitingRequest,
    /// A handler has been chosen and is producing the status line.
    Status,
    /// Status line written; handler is producing headers.
    Headers,
    /// Headers written; handler is producing the message body.
    Message,
    /// Body complete, buffered in the connection's send buffer.
    Assembled,
    /// Fully flushed to the transport.
    Done,
}

/// What a handler's `handle` call tells the pipeline to do next, matching
/// the original firmware's four-way handler return plus a partial-progress
/// variant for handlers that stream output across several pipeline ticks.
pub enum HandlerResult {
    /// Response complete; close the connection after it drains.
    DoneFinal,
    /// Response complete; keep the connection open for another request.
    DoneContinue,
    /// Response complete; caller must not recycle the connection's
    /// resources yet (a streaming handler still owns external state).
    DoneNoDealloc,
    /// Handler failed; the pipeline substitutes an error-page response.
    DoneError(u16),
    /// Partial progress: `n` bytes written this call, handler wants to be
    /// invoked again on the next pipeline tick.
    Wrote(usize),
}

pub trait HttpHandler {
    /// True if this handler should service `uri`. Checked in registration
    /// order; the first match wins (§4.G: "prefix or exact").
    fn matches(&self, uri: &str) -> bool;

    fn handle(&mut self, conn_id: ConnId, req: &Request, conn: &mut Connection) -> FwResult<HandlerResult>;
}

/// Per-connection HTTP state, embedded in `Category::Http`.
pub struct HttpState {
    pub recv_buf: Vec<u8>,
    pub phase: ResponsePhase,
    pub request: Option<Request>,
    /// Index into the handler chain of the handler currently being driven
    /// (`Wrote` resumes the same one).
    pub active_handler: Option<usize>,
    /// Index to resume the `matches()` search from on the next
    /// `DoneContinue`/`DoneError`, so a handler earlier in the chain is
    /// never retried for the same request (§4.F: "handlers tried in
    /// registration order").
    pub search_from: usize,
    /// Status a handler has committed to via `DoneError`, visible to later
    /// handlers in the chain (the error-page filesystem handler looks here
    /// to decide whether to act) even though no bytes have been written yet.
    pub status: Option<u16>,
    /// Bytes of the active handler's body already copied into `send_buf`,
    /// so a streaming handler (the filesystem handler on a large file) knows
    /// where to resume on its next `Wrote` call instead of restarting.
    pub stream_offset: usize,
    /// Whether the active streaming handler has already written its status
    /// line and headers, so it writes them exactly once even though it may
    /// be re-entered many times while the body drains.
    pub headers_sent: bool,
}

impl HttpState {
    pub fn new() -> Self {
        HttpState {
            recv_buf: Vec::new(),
            phase: ResponsePhase::AwaitingRequest,
            request: None,
            active_handler: None,
            search_from: 0,
            status: None,
            stream_offset: 0,
            headers_sent: false,
        }
    }

    pub fn reset_for_next_request(&mut self) {
        self.recv_buf.clear();
        self.phase = ResponsePhase::AwaitingRequest;
        self.request = None;
        self.active_handler = None;
        self.search_from = 0;
        self.status = None;
        self.stream_offset = 0;
        self.headers_sent = false;
    }
}

impl Default for HttpState {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum buffered request size before treating it as a hostile/oversized
/// client and closing the connection. The send buffer is 1440 bytes; the
/// request side gets a more generous bound since headers can be longer.
pub const MAX_REQUEST_BYTES: usize = 4096;

/// Ordered table of handlers, tried in registration order on each request.
pub struct HandlerChain {
    handlers: Vec<Box<dyn HttpHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        HandlerChain { handlers: Vec::new() }
    }

    pub fn register(&mut self, handler: Box<dyn HttpHandler>) {
        self.handlers.push(handler);
    }

    fn find(&self, uri: &str) -> Option<usize> {
        self.find_from(uri, 0)
    }

    /// Search for the next matching handler starting at `from`, used to
    /// resume the chain after a `DoneContinue`/`DoneError` without retrying
    /// handlers earlier in registration order (§4.F/§4.G: "falls through to
    /// the next matching handler").
    fn find_from(&self, uri: &str, from: usize) -> Option<usize> {
        self.handlers.iter().skip(from).position(|h| h.matches(uri)).map(|i| i + from)
    }

    /// Feed newly received bytes into `conn`'s HTTP state, parsing a request
    /// once the header block is fully buffered and dispatching it to the
    /// first matching handler. Returns `Ok(())` once a response has been
    /// written into `conn.send_buf` (or queued for further `Wrote` calls).
    pub fn on_recv(&mut self, conn_id: ConnId, data: &[u8], conn: &mut Connection) -> FwResult<()> {
        let state = match &mut conn.category {
            crate::conntable::Category::Http(s) => s,
            _ => return Err(FwError::Invariant("on_recv on non-http connection")),
        };
        if state.recv_buf.len() + data.len() > MAX_REQUEST_BYTES {
            return self.finish_with_error(conn, 400);
        }
        state.recv_buf.extend_from_slice(data);

        if state.phase == ResponsePhase::AwaitingRequest {
            let req = match parser::parse_request(&state.recv_buf) {
                Ok(Some(req)) => req,
                Ok(None) => return Ok(()),
                Err(e) => return self.finish_with_error(conn, e.status),
            };
            if !is_supported_method(req.method) {
                return self.finish_with_error(conn, 501);
            }
            let uri = req.uri.clone();
            let state = match &mut conn.category {
                crate::conntable::Category::Http(s) => s,
                _ => return Err(FwError::Invariant("on_recv on non-http connection")),
            };
            state.request = Some(req);
            state.phase = ResponsePhase::Status;
            state.active_handler = self.find_from(&uri, 0);
            state.search_from = state.active_handler.map(|i| i + 1).unwrap_or(0);
        }

        self.drive(conn_id, conn)
    }

    /// Re-enter the handler chain for a connection whose active handler is
    /// mid-stream (returned `Wrote` earlier), now that more send-buffer
    /// space has opened up. Called by the engine after a flush drains bytes
    /// out from under a streaming handler (`fs.rs`'s chunked file body).
    pub fn resume(&mut self, conn_id: ConnId, conn: &mut Connection) -> FwResult<()> {
        self.drive(conn_id, conn)
    }

    /// Run the active handler forward, one `HandlerResult` at a time, until
    /// the response reaches `Assembled` or the handler asks to be resumed
    /// later (`Wrote`, returned to the caller as `Ok(())` with the phase
    /// left unchanged).
    fn drive(&mut self, conn_id: ConnId, conn: &mut Connection) -> FwResult<()> {
        loop {
            let idx = {
                let state = match &conn.category {
                    crate::conntable::Category::Http(s) => s,
                    _ => return Err(FwError::Invariant("drive on non-http connection")),
                };
                if state.request.is_none() {
                    return Ok(());
                }
                match state.active_handler {
                    Some(idx) => idx,
                    None => {
                        self.finish_with_error(conn, 404)?;
                        return Ok(());
                    }
                }
            };
            // Move the request out of the connection for the duration of the
            // handler call so the handler can hold `&Request` alongside
            // `&mut Connection` without an aliasing borrow; put it back
            // afterwards in case the handler asks to be driven again.
            let req = match &mut conn.category {
                crate::conntable::Category::Http(s) => s.request.take(),
                _ => None,
            };
            let Some(req) = req else { return Ok(()) };
            let result = match self.handlers.get_mut(idx) {
                Some(h) => h.handle(conn_id, &req, conn)?,
                None => {
                    return self.finish_with_error(conn, 404);
                }
            };
            let uri = req.uri.clone();
            if let crate::conntable::Category::Http(s) = &mut conn.category {
                s.request = Some(req);
            }
            match result {
                HandlerResult::Wrote(_) => {
                    // Partial progress: the handler's send-buffer space ran
                    // out before its body did. Stop driving now rather than
                    // spin calling it again with no room freed; the engine
                    // resumes the chain once a flush drains bytes out.
                    if let crate::conntable::Category::Http(s) = &mut conn.category {
                        s.phase = ResponsePhase::Message;
                    }
                    return Ok(());
                }
                HandlerResult::DoneFinal => {
                    self.mark_assembled(conn);
                    conn.closing = true;
                    return Ok(());
                }
                HandlerResult::DoneNoDealloc => {
                    // The handler changed the connection's protocol (e.g.
                    // a WebSocket upgrade) and still owns it; leave it open.
                    self.mark_assembled(conn);
                    return Ok(());
                }
                HandlerResult::DoneContinue | HandlerResult::DoneError(_) => {
                    // The handler declined to produce a response: either it
                    // wrote nothing and wants the next matching handler
                    // tried (`DoneContinue`), or it wants an error recorded
                    // but still gives later handlers (the error-page
                    // filesystem handler) a chance to supply a body
                    // (`DoneError`). Either way, advance the search cursor
                    // and keep walking the chain for this URI.
                    if let HandlerResult::DoneError(code) = result {
                        if let crate::conntable::Category::Http(s) = &mut conn.category {
                            s.status = Some(code);
                        }
                    }
                    let next = {
                        let state = match &conn.category {
                            crate::conntable::Category::Http(s) => s,
                            _ => return Err(FwError::Invariant("drive on non-http connection")),
                        };
                        self.find_from(&uri, state.search_from)
                    };
                    match next {
                        Some(found) => {
                            if let crate::conntable::Category::Http(s) = &mut conn.category {
                                s.active_handler = Some(found);
                                s.search_from = found + 1;
                            }
                            continue;
                        }
                        None => {
                            let code = match &conn.category {
                                crate::conntable::Category::Http(s) => s.status.unwrap_or(404),
                                _ => 404,
                            };
                            return self.finish_with_error(conn, code);
                        }
                    }
                }
            }
        }
    }

    fn mark_assembled(&self, conn: &mut Connection) {
        if let crate::conntable::Category::Http(state) = &mut conn.category {
            state.phase = ResponsePhase::Assembled;
        }
    }

    fn finish_with_error(&mut self, conn: &mut Connection, code: u16) -> FwResult<()> {
        crate::http::handlers::errorpage::write_error(conn, code)?;
        self.mark_assembled(conn);
        conn.closing = code >= 500;
        Ok(())
    }
}

impl Default for HandlerChain {
    fn default() -> Self {
        Self::new()
    }
}

/// URI prefix match helper shared by handlers that serve a subtree
/// (`/rest/...`, `/ws/...`) rather than a single exact path.
pub fn uri_has_prefix(uri: &str, prefix: &str) -> bool {
    uri == prefix.trim_end_matches('/') || uri.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntable::{Category, SendBuffer};
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    fn test_conn(category: Category) -> Connection {
        Connection {
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            local_ip: Ipv4Addr::UNSPECIFIED,
            local_port: 80,
            category,
            send_buf: SendBuffer::new(),
            closing: false,
            timeout: Duration::from_secs(30),
            last_activity: Instant::now(),
            is_listener: false,
        }
    }

    struct EchoUriHandler;
    impl HttpHandler for EchoUriHandler {
        fn matches(&self, uri: &str) -> bool {
            uri == "/echo"
        }
        fn handle(&mut self, _conn_id: ConnId, req: &Request, conn: &mut Connection) -> FwResult<HandlerResult> {
            conn.send_buf.append(req.uri.as_bytes());
            Ok(HandlerResult::DoneFinal)
        }
    }

    struct PassThroughHandler;
    impl HttpHandler for PassThroughHandler {
        fn matches(&self, _uri: &str) -> bool {
            true
        }
        fn handle(&mut self, _conn_id: ConnId, _req: &Request, _conn: &mut Connection) -> FwResult<HandlerResult> {
            Ok(HandlerResult::DoneContinue)
        }
    }

    #[test]
    fn unmatched_uri_yields_404() {
        let mut chain = HandlerChain::new();
        chain.register(Box::new(EchoUriHandler));
        let mut conn = test_conn(Category::Http(HttpState::new()));
        chain.on_recv(0, b"GET /missing HTTP/1.1\r\n\r\n", &mut conn).unwrap();
        assert!(conn.send_buf.as_slice().starts_with(b"HTTP/1.1 404"));
    }

    #[test]
    fn matched_handler_writes_into_send_buffer() {
        let mut chain = HandlerChain::new();
        chain.register(Box::new(EchoUriHandler));
        let mut conn = test_conn(Category::Http(HttpState::new()));
        chain.on_recv(0, b"GET /echo HTTP/1.1\r\n\r\n", &mut conn).unwrap();
        assert_eq!(conn.send_buf.as_slice(), b"/echo");
        // Persistent connections are out of scope: a completed response
        // always closes once it has drained.
        assert!(conn.closing);
    }

    #[test]
    fn done_continue_falls_through_to_the_next_matching_handler() {
        let mut chain = HandlerChain::new();
        chain.register(Box::new(PassThroughHandler));
        chain.register(Box::new(EchoUriHandler));
        let mut conn = test_conn(Category::Http(HttpState::new()));
        chain.on_recv(0, b"GET /echo HTTP/1.1\r\n\r\n", &mut conn).unwrap();
        assert_eq!(conn.send_buf.as_slice(), b"/echo");
    }

    #[test]
    fn done_continue_with_no_further_handler_yields_404() {
        let mut chain = HandlerChain::new();
        chain.register(Box::new(PassThroughHandler));
        let mut conn = test_conn(Category::Http(HttpState::new()));
        chain.on_recv(0, b"GET /anything HTTP/1.1\r\n\r\n", &mut conn).unwrap();
        assert!(conn.send_buf.as_slice().starts_with(b"HTTP/1.1 404"));
    }

    #[test]
    fn incomplete_request_leaves_phase_awaiting() {
        let mut chain = HandlerChain::new();
        let mut conn = test_conn(Category::Http(HttpState::new()));
        chain.on_recv(0, b"GET /echo HTTP/1.1\r\n", &mut conn).unwrap();
        if let Category::Http(state) = &conn.category {
            assert_eq!(state.phase, ResponsePhase::AwaitingRequest);
        } else {
            panic!("expected http state");
        }
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut chain = HandlerChain::new();
        let mut conn = test_conn(Category::Http(HttpState::new()));
        let huge = vec![b'a'; MAX_REQUEST_BYTES + 1];
        // Like every other parse-error path (§7: "smallest appropriate
        // negative response"), this writes a 400 and returns `Ok(())`
        // rather than propagating an error out of the pipeline.
        assert!(chain.on_recv(0, &huge, &mut conn).is_ok());
        assert!(conn.send_buf.as_slice().starts_with(b"HTTP/1.1 400"));
    }
}
