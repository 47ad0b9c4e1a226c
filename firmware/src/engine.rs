//! Ties the connection table, send pump, and protocol handlers together
//! into the single-threaded reactor loop (§5).
//!
//! One `tick` drains every event the transport has queued since the last
//! call and runs each one to completion before moving to the next — no
//! handler call is ever reentered or interleaved with another connection's
//! handling, the cooperative scheduling model the whole crate is built
//! around: the global mutable singletons the original firmware relied on
//! become this single explicitly-owned `Engine` instead.

use crate::conntable::{Category, ConnId, ConnTable, Connection, SendBuffer};
use crate::dhcp::DhcpServer;
use crate::dns::DnsResponder;
use crate::error::{FwError, FwResult};
use crate::http::pipeline::{HandlerChain, HttpState, ResponsePhase};
use crate::sendpump::SendPump;
use crate::transport::{Proto, Transport, TransportEvent};
use crate::ws::frame::decode_frames;
use crate::ws::registry::WsRegistry;
use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Engine<T: Transport> {
    transport: T,
    conns: ConnTable,
    pump: SendPump,
    http_chain: HandlerChain,
    ws_registry: Rc<RefCell<WsRegistry>>,
    dhcp: Option<(ConnId, DhcpServer)>,
    dns: Option<(ConnId, DnsResponder)>,
    /// `/24` is the only subnet this responder supports (Non-goals §1).
    subnet_mask: Ipv4Addr,
    /// Epoch for DHCP lease timestamps; leases are expressed in
    /// milliseconds since this instant rather than wall-clock time, the
    /// same `Instant`-based scheme `ConnTable::tick` already uses for
    /// connection timeouts.
    start: Instant,
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T, http_chain: HandlerChain, ws_registry: Rc<RefCell<WsRegistry>>) -> Self {
        Engine {
            transport,
            conns: ConnTable::new(),
            pump: SendPump::new(),
            http_chain,
            ws_registry,
            dhcp: None,
            dns: None,
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            start: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn listen_http(&mut self, local_ip: Ipv4Addr, port: u16) -> ConnId {
        let conn_id = self.transport.listen(Proto::Tcp, local_ip, port);
        self.conns.insert_at(conn_id, Connection {
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            local_ip,
            local_port: port,
            category: Category::Tcp,
            send_buf: SendBuffer::new(),
            closing: false,
            timeout: DEFAULT_CONN_TIMEOUT,
            last_activity: Instant::now(),
            is_listener: true,
        });
        conn_id
    }

    pub fn listen_dhcp(&mut self, local_ip: Ipv4Addr, server: DhcpServer) -> ConnId {
        let conn_id = self.transport.listen(Proto::Udp, local_ip, 67);
        self.conns.insert_at(conn_id, Connection {
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            local_ip,
            local_port: 67,
            category: Category::Udp,
            send_buf: SendBuffer::new(),
            closing: false,
            timeout: DEFAULT_CONN_TIMEOUT,
            last_activity: Instant::now(),
            is_listener: true,
        });
        self.dhcp = Some((conn_id, server));
        conn_id
    }

    pub fn listen_dns(&mut self, local_ip: Ipv4Addr, responder: DnsResponder) -> ConnId {
        let conn_id = self.transport.listen(Proto::Udp, local_ip, 53);
        self.conns.insert_at(conn_id, Connection {
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            local_ip,
            local_port: 53,
            category: Category::Dns,
            send_buf: SendBuffer::new(),
            closing: false,
            timeout: DEFAULT_CONN_TIMEOUT,
            last_activity: Instant::now(),
            is_listener: true,
        });
        self.dns = Some((conn_id, responder));
        conn_id
    }

    /// Drain queued transport events and run each to completion. Returns
    /// the number of events processed, mainly useful for tests.
    pub fn tick(&mut self) -> FwResult<usize> {
        let events = self.transport.poll_events();
        let n = events.len();
        for event in events {
            self.handle_event(event)?;
        }
        self.flush_sends();
        Ok(n)
    }

    fn handle_event(&mut self, event: TransportEvent) -> FwResult<()> {
        match event {
            TransportEvent::Accepted { new_conn, remote_ip, remote_port, .. } => {
                self.conns.insert_at(new_conn, Connection {
                    remote_ip,
                    remote_port,
                    local_ip: Ipv4Addr::UNSPECIFIED,
                    local_port: 80,
                    category: Category::Http(HttpState::new()),
                    send_buf: SendBuffer::new(),
                    closing: false,
                    timeout: DEFAULT_CONN_TIMEOUT,
                    last_activity: Instant::now(),
                    is_listener: false,
                });
                Ok(())
            }
            TransportEvent::Received { conn, data } => self.on_recv(conn, &data),
            TransportEvent::Datagram { listener, remote_ip, remote_port, data } => {
                self.on_datagram(listener, remote_ip, remote_port, &data)
            }
            TransportEvent::Sent { conn } => {
                if let Some((next_conn, data)) = self.pump.on_sent() {
                    self.transport.send(next_conn, &data);
                }
                // §4.F: "the transport's sent-callback ... re-enters the
                // pipeline to send more bytes" for a handler that returned
                // `Wrote` because the send buffer was full.
                let mid_stream = matches!(self.conns.get(conn),
                    Some(c) if matches!(&c.category, Category::Http(s) if s.phase == ResponsePhase::Message) && c.send_buf.is_empty());
                if mid_stream {
                    if let Some(c) = self.conns.get_mut(conn) {
                        if self.http_chain.resume(conn, c).is_err() {
                            self.conns.disconnect(conn);
                        }
                    }
                }
                Ok(())
            }
            TransportEvent::Disconnected { conn } => {
                self.conns.disconnect(conn);
                Ok(())
            }
        }
    }

    fn on_recv(&mut self, conn_id: ConnId, data: &[u8]) -> FwResult<()> {
        let now = Instant::now();
        if let Some(conn) = self.conns.get_mut(conn_id) {
            conn.touch(now);
        }
        let category_tag = self.conns.get(conn_id).map(|c| c.category.name());
        match category_tag {
            Some("http") => {
                let conn = self.conns.get_mut(conn_id).ok_or(FwError::Invariant("missing connection"))?;
                if self.http_chain.on_recv(conn_id, data, conn).is_err() {
                    // A handler bug (or a connection caught mid-handshake by
                    // an invariant check) must not take the rest of this
                    // tick's event batch down with it.
                    self.conns.disconnect(conn_id);
                }
                Ok(())
            }
            Some("ws") => self.on_ws_recv(conn_id, data),
            _ => Err(FwError::Invariant("recv on a connection with no protocol attached")),
        }
    }

    fn on_ws_recv(&mut self, conn_id: ConnId, data: &[u8]) -> FwResult<()> {
        let conn = self.conns.get_mut(conn_id).ok_or(FwError::Invariant("missing connection"))?;
        let protocol_idx = match &mut conn.category {
            Category::Ws(state) => {
                state.recv_buf.extend_from_slice(data);
                state.protocol_idx
            }
            _ => return Err(FwError::Invariant("ws recv on non-ws connection")),
        };
        let Some(protocol_idx) = protocol_idx else { return Ok(()) };

        let buffered = match &conn.category {
            Category::Ws(state) => state.recv_buf.clone(),
            _ => unreachable!(),
        };
        let (frames, consumed) = match decode_frames(&buffered) {
            Ok(v) => v,
            Err(_) => {
                // A malformed frame (e.g. unmasked) can never be fixed by
                // more bytes; close this connection instead of failing the
                // whole tick (§7: "parse error -> protocol-violation close").
                self.conns.disconnect(conn_id);
                return Ok(());
            }
        };
        if let Category::Ws(state) = &mut conn.category {
            state.recv_buf.drain(..consumed);
        }

        for frame in &frames {
            let conn = self.conns.get_mut(conn_id).ok_or(FwError::Invariant("missing connection"))?;
            if frame.is_close() {
                let already_closing = match &conn.category {
                    Category::Ws(state) => state.closing,
                    _ => false,
                };
                {
                    let mut registry = self.ws_registry.borrow_mut();
                    if let Some(h) = registry.get_mut(protocol_idx) {
                        h.on_close(conn_id);
                    }
                }
                if already_closing {
                    // Our own close frame's echo: the handshake is complete.
                    self.conns.disconnect(conn_id);
                } else {
                    // Peer-initiated close: answer with our own close frame
                    // before disconnecting (§4.H dispatch).
                    let conn = self.conns.get_mut(conn_id).ok_or(FwError::Invariant("missing connection"))?;
                    conn.send_buf.append(&crate::ws::frame::encode_close(1000, ""));
                    if let Category::Ws(state) = &mut conn.category {
                        state.closing = true;
                    }
                    self.conns.disconnect(conn_id);
                }
                break;
            }
            if frame.is_ping() {
                let result = {
                    let mut registry = self.ws_registry.borrow_mut();
                    match registry.get_mut(protocol_idx) {
                        Some(h) => h.on_ping(conn_id, conn, frame),
                        None => Ok(()),
                    }
                };
                if result.is_err() {
                    self.conns.disconnect(conn_id);
                    return Ok(());
                }
                continue;
            }
            if frame.is_pong() {
                let result = {
                    let mut registry = self.ws_registry.borrow_mut();
                    match registry.get_mut(protocol_idx) {
                        Some(h) => h.on_pong(conn_id, conn, frame),
                        None => Ok(()),
                    }
                };
                if result.is_err() {
                    self.conns.disconnect(conn_id);
                    return Ok(());
                }
                continue;
            }
            let result = {
                let mut registry = self.ws_registry.borrow_mut();
                registry.dispatch_message(protocol_idx, conn_id, conn, frame)
            };
            if result.is_err() {
                // A handler error (malformed application payload, wrong
                // frame type for the protocol) closes only this connection;
                // it must not abort the rest of this tick's event batch.
                self.conns.disconnect(conn_id);
                return Ok(());
            }
        }
        Ok(())
    }

    fn on_datagram(&mut self, listener: ConnId, remote_ip: Ipv4Addr, remote_port: u16, data: &[u8]) -> FwResult<()> {
        let now_ms = self.now_ms();
        if let Some((dhcp_listener, server)) = &mut self.dhcp {
            if *dhcp_listener == listener {
                server.reap_expired(now_ms);
                let Some((req, xid)) = crate::dhcp::decode_request(data) else {
                    // Relayed (giaddr != 0) or otherwise malformed; §4.J
                    // only serves clients on its own broadcast domain.
                    return Ok(());
                };
                let chaddr = req.mac;
                let reply = server.handle(&req, now_ms);
                if let Some(bytes) = crate::dhcp::encode_reply(&reply, xid, chaddr, server.server_ip(), self.subnet_mask) {
                    // Non-goals exclude subnets other than /24, so the
                    // reply always goes to the broadcast address per §4.J.
                    self.transport.send_to(listener, Ipv4Addr::BROADCAST, remote_port, &bytes);
                }
                return Ok(());
            }
        }
        if let Some((dns_listener, responder)) = &self.dns {
            if *dns_listener == listener {
                if let Some(bytes) = responder.handle(data) {
                    self.transport.send_to(listener, remote_ip, remote_port, &bytes);
                }
                return Ok(());
            }
        }
        Ok(())
    }

    /// Move each connection's assembled response bytes through the global
    /// send pump, submitting directly to the transport when the pump is
    /// idle and letting backpressure hold the rest in each connection's own
    /// send buffer otherwise (§4.C, §4.F "Backpressure").
    fn flush_sends(&mut self) {
        let ids: Vec<ConnId> = self.conns.iter_active().map(|(id, _)| id).collect();
        for id in ids {
            let Some(conn) = self.conns.get_mut(id) else { continue };
            if conn.send_buf.is_empty() {
                continue;
            }
            let chunk = conn.send_buf.as_slice().to_vec();
            let n = chunk.len();
            match self.pump.net_send(id, chunk) {
                Ok(Some((conn_id, data))) => {
                    conn.send_buf.consume(n);
                    self.transport.send(conn_id, &data);
                }
                Ok(None) => conn.send_buf.consume(n),
                Err(_) => {
                    // Shared backlog is full; leave bytes queued in the
                    // connection's own buffer and retry next tick.
                }
            }
        }
        self.conns.tick(Instant::now());
    }

    pub fn conns(&self) -> &ConnTable {
        &self.conns
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
