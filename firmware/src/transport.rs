//! The boundary between the cooperative single-threaded core and the real
//! network stack (§5, §6). The engine never touches a socket directly;
//! everything goes through this trait, so tests run the full dispatch
//! logic against `FakeTransport` with no actual I/O.

use crate::conntable::ConnId;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

/// Events the transport delivers back into the engine. In the real
/// implementation these arrive off an I/O thread through a channel and are
/// drained one at a time on the single reactor thread (§5: "run to
/// completion"); in tests they are pushed directly.
#[derive(Debug)]
pub enum TransportEvent {
    Accepted { listener: ConnId, new_conn: ConnId, remote_ip: Ipv4Addr, remote_port: u16 },
    Received { conn: ConnId, data: Vec<u8> },
    /// A UDP listener received a datagram from `remote_ip:remote_port`,
    /// which has no persistent connection of its own.
    Datagram { listener: ConnId, remote_ip: Ipv4Addr, remote_port: u16, data: Vec<u8> },
    Sent { conn: ConnId },
    Disconnected { conn: ConnId },
}

pub trait Transport {
    /// Bind a listening socket. Returns the connection table id assigned to
    /// the listener entry.
    fn listen(&mut self, proto: Proto, local_ip: Ipv4Addr, port: u16) -> ConnId;

    /// Queue `data` for send on `conn`. Per §5, at most one send may be in
    /// flight per connection; the caller (send pump) enforces this.
    fn send(&mut self, conn: ConnId, data: &[u8]);

    /// For UDP listeners: send a datagram to an arbitrary peer rather than
    /// a connection's fixed remote address.
    fn send_to(&mut self, listener: ConnId, remote_ip: Ipv4Addr, remote_port: u16, data: &[u8]);

    fn disconnect(&mut self, conn: ConnId);

    /// Drain and return every event queued since the last call. The engine
    /// calls this once per reactor-loop iteration.
    fn poll_events(&mut self) -> Vec<TransportEvent>;
}

/// An in-memory transport for tests: no sockets, just a queue the test
/// harness pushes events onto and a log of outgoing sends it can assert
/// against. Grounded in shape on `betrusted-io-betrusted-ec`'s use of fake
/// hardware shims in its HAL tests.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;

    pub struct FakeTransport {
        next_id: ConnId,
        events: Vec<TransportEvent>,
        pub sent_log: Vec<(ConnId, Vec<u8>)>,
        pub listeners: HashMap<ConnId, (Proto, u16)>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            FakeTransport { next_id: 0, events: Vec::new(), sent_log: Vec::new(), listeners: HashMap::new() }
        }

        pub fn push_event(&mut self, event: TransportEvent) {
            self.events.push(event);
        }

        pub fn alloc_conn_id(&mut self) -> ConnId {
            let id = self.next_id;
            self.next_id += 1;
            id
        }
    }

    impl Transport for FakeTransport {
        fn listen(&mut self, proto: Proto, _local_ip: Ipv4Addr, port: u16) -> ConnId {
            let id = self.alloc_conn_id();
            self.listeners.insert(id, (proto, port));
            id
        }

        fn send(&mut self, conn: ConnId, data: &[u8]) {
            self.sent_log.push((conn, data.to_vec()));
            self.events.push(TransportEvent::Sent { conn });
        }

        fn send_to(&mut self, listener: ConnId, _remote_ip: Ipv4Addr, _remote_port: u16, data: &[u8]) {
            self.sent_log.push((listener, data.to_vec()));
        }

        fn disconnect(&mut self, conn: ConnId) {
            self.events.push(TransportEvent::Disconnected { conn });
        }

        fn poll_events(&mut self) -> Vec<TransportEvent> {
            std::mem::take(&mut self.events)
        }
    }

    #[test]
    fn listen_assigns_distinct_ids() {
        let mut t = FakeTransport::new();
        let a = t.listen(Proto::Tcp, Ipv4Addr::UNSPECIFIED, 80);
        let b = t.listen(Proto::Udp, Ipv4Addr::UNSPECIFIED, 67);
        assert_ne!(a, b);
    }

    #[test]
    fn send_is_logged_and_reported_sent() {
        let mut t = FakeTransport::new();
        t.send(3, b"hello");
        assert_eq!(t.sent_log, vec![(3, b"hello".to_vec())]);
        let events = t.poll_events();
        assert!(matches!(events[0], TransportEvent::Sent { conn: 3 }));
    }
}
