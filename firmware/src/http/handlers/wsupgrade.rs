//! HTTP -> WebSocket upgrade handshake (§4.H, RFC 6455 §1.3).
//!
//! Server-side handshake: validate the client's `Sec-WebSocket-Key`, compute
//! `base64(SHA1(key ++ GUID))`, and switch the connection's category from
//! `Http` to `Ws`. Uses the `sha1`/`base64` crates for that computation, the
//! same pair the ecosystem's own WebSocket servers (axum, picoserve) reach
//! for.

use crate::conntable::{Category, ConnId, Connection};
use crate::error::FwResult;
use crate::http::parser::Request;
use crate::http::pipeline::{HandlerResult, HttpHandler};
use crate::ws::registry::{WsConnState, WsRegistry};
use base64::Engine;
use sha1::{Digest, Sha1};
use std::cell::RefCell;
use std::rc::Rc;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Matches upgrade requests under `/ws/...` and completes the handshake,
/// choosing a protocol handler by the client's requested subprotocol name.
pub struct WsUpgradeHandler {
    registry: Rc<RefCell<WsRegistry>>,
}

impl WsUpgradeHandler {
    pub fn new(registry: Rc<RefCell<WsRegistry>>) -> Self {
        WsUpgradeHandler { registry }
    }
}

impl HttpHandler for WsUpgradeHandler {
    fn matches(&self, uri: &str) -> bool {
        uri.starts_with("/ws/") || uri == "/ws"
    }

    fn handle(&mut self, conn_id: ConnId, req: &Request, conn: &mut Connection) -> FwResult<HandlerResult> {
        let is_upgrade = req
            .header("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        let is_websocket = req
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let Some(client_key) = req.header("sec-websocket-key") else {
            return Ok(HandlerResult::DoneError(400));
        };
        if req.header("host").is_none() || !is_upgrade || !is_websocket {
            return Ok(HandlerResult::DoneError(400));
        }

        // §4.G: an unsupported `Sec-WebSocket-Version` gets a dedicated 426
        // reply carrying the version this server does support, not a plain 400.
        if req.header("sec-websocket-version") != Some("13") {
            conn.send_buf.append(
                b"HTTP/1.1 426 Upgrade Required\r\nSec-WebSocket-Version: 13\r\nConnection: close\r\n\r\n",
            );
            conn.closing = true;
            return Ok(HandlerResult::DoneFinal);
        }

        let protocol_name = req.header("sec-websocket-protocol").unwrap_or("wifiswitch").to_string();
        let protocol_idx = {
            let registry = self.registry.borrow();
            registry.find_by_name(&protocol_name)
        };
        let Some(protocol_idx) = protocol_idx else {
            return Ok(HandlerResult::DoneError(404));
        };

        let accept = accept_key(client_key);
        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n"
        );
        // §4.G: "one Sec-WebSocket-Protocol header per registered protocol".
        for name in self.registry.borrow().names() {
            response.push_str(&format!("Sec-WebSocket-Protocol: {name}\r\n"));
        }
        response.push_str("\r\n");
        conn.send_buf.append(response.as_bytes());
        conn.category = Category::Ws(WsConnState::new(protocol_idx));

        {
            let mut registry = self.registry.borrow_mut();
            if let Some(handler) = registry.get_mut(protocol_idx) {
                handler.on_connect(conn_id, conn)?;
            }
        }

        Ok(HandlerResult::DoneNoDealloc)
    }
}
