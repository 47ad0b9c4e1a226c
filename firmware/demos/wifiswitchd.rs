//! Runnable demo binary: wires the cooperative engine to real
//! `std::net` sockets.
//!
//! Every blocking socket call lives on its own background thread; each
//! thread only ever does I/O and forwards what it reads into one channel.
//! The reactor thread drains that channel through `StdTransport::poll_events`
//! and hands events to `Engine::tick` one at a time, so the single-threaded,
//! run-to-completion contract the engine is built around is preserved even
//! though real sockets are inherently concurrent.

use log::{info, warn};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use wifiswitch_firmware::config::ConfigManager;
use wifiswitch_firmware::conntable::ConnId;
use wifiswitch_firmware::dhcp::DhcpServer;
use wifiswitch_firmware::dns::DnsResponder;
use wifiswitch_firmware::engine::Engine;
use wifiswitch_firmware::http::handlers::deny::DenyHandler;
use wifiswitch_firmware::http::handlers::fs::FsHandler;
use wifiswitch_firmware::http::handlers::rest::RestHandler;
use wifiswitch_firmware::http::handlers::wsupgrade::WsUpgradeHandler;
use wifiswitch_firmware::http::pipeline::HandlerChain;
use wifiswitch_firmware::platform::fakes::{FakeConfigStore, FakeGpio, FakeWifiRadio};
use wifiswitch_firmware::proto::WifiswitchHandler;
use wifiswitch_firmware::transport::{Proto, Transport, TransportEvent};
use wifiswitch_firmware::ws::registry::WsRegistry;

use std::cell::RefCell;
use std::rc::Rc;

enum Sink {
    Tcp(Arc<Mutex<TcpStream>>),
    Udp(Arc<UdpSocket>),
}

struct StdTransport {
    next_id: ConnId,
    tx: Sender<TransportEvent>,
    rx: Receiver<TransportEvent>,
    /// Shared with the background accept/reader threads, which register a
    /// connection's write half here as soon as it exists; `send`/`send_to`
    /// read it from the reactor thread.
    sinks: Arc<Mutex<HashMap<ConnId, Sink>>>,
}

impl StdTransport {
    fn new() -> Self {
        let (tx, rx) = channel();
        StdTransport { next_id: 0, tx, rx, sinks: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn alloc_id(&mut self) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn spawn_tcp_accept_loop(
        &self,
        listener_id: ConnId,
        listener: TcpListener,
        tx: Sender<TransportEvent>,
        next_id: Arc<Mutex<ConnId>>,
        sinks: Arc<Mutex<HashMap<ConnId, Sink>>>,
    ) {
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let Some(std::net::SocketAddr::V4(peer)) = stream.peer_addr().ok() else { continue };
                let Ok(reader) = stream.try_clone() else { continue };
                let new_conn = {
                    let mut guard = next_id.lock().unwrap();
                    let id = *guard;
                    *guard += 1;
                    id
                };
                sinks.lock().unwrap().insert(new_conn, Sink::Tcp(Arc::new(Mutex::new(stream))));
                let _ = tx.send(TransportEvent::Accepted {
                    listener: listener_id,
                    new_conn,
                    remote_ip: *peer.ip(),
                    remote_port: peer.port(),
                });
                let tx2 = tx.clone();
                thread::spawn(move || {
                    let mut reader = reader;
                    let mut buf = [0u8; 2048];
                    loop {
                        match reader.read(&mut buf) {
                            Ok(0) => {
                                let _ = tx2.send(TransportEvent::Disconnected { conn: new_conn });
                                break;
                            }
                            Ok(n) => {
                                let _ = tx2.send(TransportEvent::Received { conn: new_conn, data: buf[..n].to_vec() });
                            }
                            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                            Err(_) => {
                                let _ = tx2.send(TransportEvent::Disconnected { conn: new_conn });
                                break;
                            }
                        }
                    }
                });
            }
        });
    }
}

impl Transport for StdTransport {
    fn listen(&mut self, proto: Proto, local_ip: Ipv4Addr, port: u16) -> ConnId {
        let id = self.alloc_id();
        match proto {
            Proto::Tcp => {
                let listener = TcpListener::bind((local_ip, port)).expect("bind tcp listener");
                let next_id = Arc::new(Mutex::new(self.next_id));
                self.spawn_tcp_accept_loop(id, listener, self.tx.clone(), next_id, self.sinks.clone());
            }
            Proto::Udp => {
                let socket = Arc::new(UdpSocket::bind((local_ip, port)).expect("bind udp socket"));
                self.sinks.lock().unwrap().insert(id, Sink::Udp(socket.clone()));
                let tx = self.tx.clone();
                let listener_id = id;
                thread::spawn(move || {
                    let mut buf = [0u8; 1500];
                    loop {
                        match socket.recv_from(&mut buf) {
                            Ok((n, std::net::SocketAddr::V4(peer))) => {
                                let _ = tx.send(TransportEvent::Datagram {
                                    listener: listener_id,
                                    remote_ip: *peer.ip(),
                                    remote_port: peer.port(),
                                    data: buf[..n].to_vec(),
                                });
                            }
                            Ok(_) => {}
                            Err(_) => break,
                        }
                    }
                });
            }
        }
        id
    }

    fn send(&mut self, conn: ConnId, data: &[u8]) {
        if let Some(Sink::Tcp(stream)) = self.sinks.lock().unwrap().get(&conn) {
            if let Ok(mut s) = stream.lock() {
                let _ = s.write_all(data);
            }
        }
        let _ = self.tx.send(TransportEvent::Sent { conn });
    }

    fn send_to(&mut self, listener: ConnId, remote_ip: Ipv4Addr, remote_port: u16, data: &[u8]) {
        if let Some(Sink::Udp(socket)) = self.sinks.lock().unwrap().get(&listener) {
            let _ = socket.send_to(data, (remote_ip, remote_port));
        }
    }

    fn disconnect(&mut self, conn: ConnId) {
        self.sinks.lock().unwrap().remove(&conn);
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

fn main() {
    env_logger::init();

    // An empty but valid DBFFS image (just the fs signature, no entries); a
    // real board loads a populated image from flash instead.
    let fs_image = 0xDBFF_5000u32.to_le_bytes().to_vec();

    let registry = Rc::new(RefCell::new(WsRegistry::new()));
    registry
        .borrow_mut()
        .register(Box::new(WifiswitchHandler::new(
            FakeWifiRadio::new(),
            FakeGpio::new(0b11),
            ConfigManager::new(FakeConfigStore::default()),
        )))
        .expect("register wifiswitch protocol handler");

    let mut chain = HandlerChain::new();
    chain.register(Box::new(WsUpgradeHandler::new(registry.clone())));
    chain.register(Box::new(DenyHandler::new("/cfg/")));
    chain.register(Box::new(RestHandler::new(
        FakeWifiRadio::new(),
        FakeGpio::new(0b11),
        ConfigManager::new(FakeConfigStore::default()),
    )));
    chain.register(Box::new(FsHandler::new(fs_image)));

    let transport = StdTransport::new();
    let mut engine = Engine::new(transport, chain, registry);

    let bind_ip = Ipv4Addr::new(192, 168, 4, 1);
    engine.listen_http(bind_ip, 80);
    engine.listen_dhcp(bind_ip, DhcpServer::new(Ipv4Addr::new(192, 168, 4, 0), bind_ip, 100));
    engine.listen_dns(bind_ip, DnsResponder::new(bind_ip, ""));

    info!("wifiswitchd listening on {bind_ip}");
    loop {
        match engine.tick() {
            Ok(_) => {}
            Err(e) => warn!("engine tick error: {e}"),
        }
        thread::sleep(std::time::Duration::from_millis(10));
    }
}
