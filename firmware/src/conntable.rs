//! Connection table: lifecycle and metadata for every TCP/UDP connection.
//!
//! The original firmware links connections through two doubly-linked lists
//! (listening, active) with raw `prev`/`next` pointers. This is replaced by a
//! slab arena addressed by a `ConnId` handle: handles outlive reallocation and
//! removal never requires relinking neighbors. The two logical lists become
//! iteration filters (`is_listener`) over the arena.

use crate::http::pipeline::HttpState;
use crate::ws::registry::WsConnState;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Capacity of a connection's response-assembly send buffer (§3).
pub const SEND_BUF_CAP: usize = 1440;

/// Handle to a connection table entry. Stable for the connection's lifetime;
/// never reused while the connection it names is live.
pub type ConnId = usize;

/// Transport category, tagged per connection (Design Notes: "encode the
/// connection's category as a tagged variant ... dispatch is on the tag").
pub enum Category {
    /// A bare TCP connection: either a listening socket, or an accepted
    /// socket that has not yet had an HTTP request attached.
    Tcp,
    Http(HttpState),
    Ws(WsConnState),
    /// A bound UDP listener (used by the DHCP responder).
    Udp,
    /// A bound UDP listener carrying the DNS captive responder.
    Dns,
}

impl Category {
    pub fn name(&self) -> &'static str {
        match self {
            Category::Tcp => "tcp",
            Category::Http(_) => "http",
            Category::Ws(_) => "ws",
            Category::Udp => "udp",
            Category::Dns => "dns",
        }
    }
}

/// Fixed-capacity response-assembly buffer with a write cursor. Handlers
/// append into this via `http_send`/WS frame encode; the pipeline flushes it
/// through the send pump.
pub struct SendBuffer {
    buf: [u8; SEND_BUF_CAP],
    len: usize,
}

impl SendBuffer {
    pub fn new() -> Self {
        SendBuffer { buf: [0; SEND_BUF_CAP], len: 0 }
    }

    pub fn remaining(&self) -> usize {
        SEND_BUF_CAP - self.len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Append as much of `data` as fits. Returns the number of bytes copied;
    /// a short count means the caller must retry once the buffer drains.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    /// Drop the first `n` bytes (already handed to the send pump).
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The central per-connection object (§3). Owned exclusively by the
/// connection table; handlers borrow it via `ConnTable::get`/`get_mut`.
pub struct Connection {
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub category: Category,
    pub send_buf: SendBuffer,
    pub closing: bool,
    pub timeout: Duration,
    pub last_activity: Instant,
    /// True for listener entries (TCP accept socket, bound UDP socket).
    /// Listener entries never carry a `send_buf` payload or expire.
    pub is_listener: bool,
}

impl Connection {
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        !self.is_listener && now.duration_since(self.last_activity) > self.timeout
    }
}

/// Slab-backed table of connections, addressed by `ConnId`.
pub struct ConnTable {
    slots: Vec<Option<Connection>>,
    free: Vec<usize>,
}

impl ConnTable {
    pub fn new() -> Self {
        ConnTable { slots: Vec::new(), free: Vec::new() }
    }

    /// Insert a new connection (accept or listen). Returns its handle.
    pub fn insert(&mut self, conn: Connection) -> ConnId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(conn);
            idx
        } else {
            self.slots.push(Some(conn));
            self.slots.len() - 1
        }
    }

    /// Insert a connection at a caller-chosen id. The transport layer (not
    /// this table) is the authority for connection identity — a listener's
    /// port binding or an accepted socket's fd is assigned by the transport
    /// before the table ever hears about it, so every future event names
    /// the connection by that id. Growing the slab to fit keeps the two id
    /// spaces identical instead of hoping two independent counters agree.
    pub fn insert_at(&mut self, id: ConnId, conn: Connection) {
        if id >= self.slots.len() {
            self.slots.resize_with(id + 1, || None);
        }
        if self.slots[id].is_none() {
            self.free.retain(|&f| f != id);
        }
        self.slots[id] = Some(conn);
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    /// Mark for teardown. The connection is not freed until its send buffer
    /// has drained (housekeeping tick, §5 "Cancellation").
    pub fn disconnect(&mut self, id: ConnId) {
        if let Some(conn) = self.get_mut(id) {
            conn.closing = true;
        }
    }

    /// Unlink and release a slot. Only the housekeeping tick calls this,
    /// and only once `closing` is set and `send_buf` has drained.
    pub fn free(&mut self, id: ConnId) {
        if self.slots.get(id).map(|s| s.is_some()).unwrap_or(false) {
            self.slots[id] = None;
            self.free.push(id);
        }
    }

    /// Housekeeping tick: advance timeouts, reap drained+closing connections.
    /// Returns the ids that were freed this tick.
    pub fn tick(&mut self, now: Instant) -> Vec<ConnId> {
        let mut reaped = Vec::new();
        for idx in 0..self.slots.len() {
            let should_reap = match &mut self.slots[idx] {
                Some(conn) => {
                    if !conn.is_listener && !conn.closing && conn.is_timed_out(now) {
                        conn.closing = true;
                    }
                    conn.closing && conn.send_buf.is_empty()
                }
                None => false,
            };
            if should_reap {
                self.free(idx);
                reaped.push(idx);
            }
        }
        reaped
    }

    /// Iterate all live connections (listeners and active alike).
    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|c| (i, c)))
    }

    /// Active connections only (Design §4.B: "active list").
    pub fn iter_active(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.iter().filter(|(_, c)| !c.is_listener)
    }

    /// Listeners only, optionally filtered by local port (Design §4.B:
    /// "at most one listener per (transport, port)").
    pub fn find_listener(&self, local_port: u16) -> Option<ConnId> {
        self.iter()
            .find(|(_, c)| c.is_listener && c.local_port == local_port)
            .map(|(id, _)| id)
    }
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}
