//! Protocol handler registry for upgraded WebSocket connections (§4.H).
//!
//! A connection's `Sec-WebSocket-Protocol` request header selects one
//! handler from this table at upgrade time; every subsequent frame on that
//! connection dispatches straight to it. Capacity is small and fixed
//! (the original firmware's handler table holds 10 slots) since a switch
//! firmware only ever wires in a couple of protocols (`wifiswitch`, and
//! room for a future one) rather than supporting arbitrary registration.

use crate::conntable::{Connection, ConnId};
use crate::error::{FwError, FwResult};
use crate::ws::frame::WsFrame;

pub const MAX_PROTOCOLS: usize = 10;

pub trait WsProtocolHandler {
    fn name(&self) -> &str;

    fn on_connect(&mut self, conn_id: ConnId, conn: &mut Connection) -> FwResult<()>;
    fn on_message(&mut self, conn_id: ConnId, conn: &mut Connection, frame: &WsFrame) -> FwResult<()>;
    fn on_close(&mut self, conn_id: ConnId);

    /// Called for an inbound `ping` control frame. No default pong is sent
    /// by the core (§4.H: "handler-defined reply; no default pong is built
    /// in"); handlers that want RFC 6455's default behavior reply with one
    /// themselves via `conn.send_buf`.
    #[allow(unused_variables)]
    fn on_ping(&mut self, conn_id: ConnId, conn: &mut Connection, frame: &WsFrame) -> FwResult<()> {
        Ok(())
    }

    #[allow(unused_variables)]
    fn on_pong(&mut self, conn_id: ConnId, conn: &mut Connection, frame: &WsFrame) -> FwResult<()> {
        Ok(())
    }
}

/// Per-connection WebSocket state, embedded in `Category::Ws` (§3).
pub struct WsConnState {
    pub recv_buf: Vec<u8>,
    pub protocol_idx: Option<usize>,
    /// Set once this side has sent a close frame, so a close frame arriving
    /// afterwards is recognized as the peer's echo rather than a fresh
    /// close request (§4.H dispatch).
    pub closing: bool,
}

impl WsConnState {
    pub fn new(protocol_idx: usize) -> Self {
        WsConnState { recv_buf: Vec::new(), protocol_idx: Some(protocol_idx), closing: false }
    }
}

pub struct WsRegistry {
    handlers: Vec<Option<Box<dyn WsProtocolHandler>>>,
}

impl WsRegistry {
    pub fn new() -> Self {
        WsRegistry { handlers: Vec::new() }
    }

    pub fn register(&mut self, handler: Box<dyn WsProtocolHandler>) -> FwResult<usize> {
        if let Some(idx) = self.handlers.iter().position(|h| h.is_none()) {
            self.handlers[idx] = Some(handler);
            return Ok(idx);
        }
        if self.handlers.len() >= MAX_PROTOCOLS {
            return Err(FwError::ResourceExhausted("ws protocol table"));
        }
        self.handlers.push(Some(handler));
        Ok(self.handlers.len() - 1)
    }

    /// Drop a handler, moving the last entry into the freed slot (§4.H:
    /// "`unregister(id)` compacts by moving the last entry into the removed
    /// slot") so the table never grows without bound across repeated
    /// register/unregister cycles. The relocated entry takes on the removed
    /// id; every other still-registered entry keeps its id (testable
    /// property 8).
    pub fn unregister(&mut self, idx: usize) {
        if idx >= self.handlers.len() {
            return;
        }
        let last = self.handlers.len() - 1;
        if idx != last {
            self.handlers[idx] = self.handlers[last].take();
        } else {
            self.handlers[idx] = None;
        }
        while matches!(self.handlers.last(), Some(None)) {
            self.handlers.pop();
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.handlers
            .iter()
            .position(|h| h.as_ref().map(|h| h.name() == name).unwrap_or(false))
    }

    /// Names of every registered protocol, in table order. The upgrade
    /// handler sends one `Sec-WebSocket-Protocol` response header per name
    /// (§4.G: "one `Sec-WebSocket-Protocol` header per registered protocol").
    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().filter_map(|h| h.as_ref().map(|h| h.name())).collect()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Box<dyn WsProtocolHandler>> {
        self.handlers.get_mut(idx).and_then(|h| h.as_mut())
    }

    pub fn dispatch_message(&mut self, idx: usize, conn_id: ConnId, conn: &mut Connection, frame: &WsFrame) -> FwResult<()> {
        match self.get_mut(idx) {
            Some(h) => h.on_message(conn_id, conn, frame),
            None => Err(FwError::Invariant("dispatch to unregistered ws protocol")),
        }
    }
}

impl Default for WsRegistry {
    fn default() -> Self {
        Self::new()
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

    struct EchoHandler {
        name: &'static str,
        messages: Vec<Vec<u8>>,
    }

    impl EchoHandler {
        fn named(name: &'static str) -> Box<Self> {
            Box::new(EchoHandler { name, messages: Vec::new() })
        }
    }

    impl WsProtocolHandler for EchoHandler {
        fn name(&self) -> &str {
            self.name
        }
        fn on_connect(&mut self, _id: ConnId, _conn: &mut Connection) -> FwResult<()> {
            Ok(())
        }
        fn on_message(&mut self, _id: ConnId, _conn: &mut Connection, frame: &WsFrame) -> FwResult<()> {
            self.messages.push(frame.payload.clone());
            Ok(())
        }
        fn on_close(&mut self, _id: ConnId) {}
    }

    #[test]
    fn register_then_find_by_name() {
        let mut registry = WsRegistry::new();
        let idx = registry.register(EchoHandler::named("echo")).unwrap();
        assert_eq!(registry.find_by_name("echo"), Some(idx));
        assert_eq!(registry.find_by_name("nope"), None);
    }

    #[test]
    fn unregister_moves_the_last_entry_into_the_freed_slot() {
        let mut registry = WsRegistry::new();
        let a = registry.register(EchoHandler::named("a")).unwrap();
        let b = registry.register(EchoHandler::named("b")).unwrap();
        registry.unregister(a);
        // `b` was the last entry; it relocates into `a`'s freed slot and the
        // table shrinks rather than leaving a tombstone.
        assert_eq!(registry.find_by_name("b"), Some(a));
        assert_eq!(registry.handlers.len(), 1);
        let _ = b;
    }

    #[test]
    fn unregistering_the_last_slot_just_shrinks_the_table() {
        let mut registry = WsRegistry::new();
        let a = registry.register(EchoHandler::named("a")).unwrap();
        let b = registry.register(EchoHandler::named("b")).unwrap();
        registry.unregister(b);
        assert_eq!(registry.find_by_name("a"), Some(a));
        assert_eq!(registry.handlers.len(), 1);
    }

    #[test]
    fn dispatch_routes_frame_to_registered_handler() {
        let mut registry = WsRegistry::new();
        let idx = registry.register(EchoHandler::named("echo")).unwrap();
        let mut conn = test_conn();
        let frame = WsFrame { opcode: crate::ws::frame::Opcode::Text, fin: true, payload: b"hi".to_vec() };
        registry.dispatch_message(idx, 0, &mut conn, &frame).unwrap();
    }

    #[test]
    fn exhausting_the_table_is_an_error() {
        let mut registry = WsRegistry::new();
        for _ in 0..MAX_PROTOCOLS {
            registry.register(EchoHandler::named("echo")).unwrap();
        }
        assert!(registry.register(EchoHandler::named("echo")).is_err());
    }
}
