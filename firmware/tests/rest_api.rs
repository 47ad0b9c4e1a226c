//! Exercises the REST and static-file handlers together through the
//! handler chain, the way a real request actually flows: REST routes get
//! first refusal, everything else falls through to the filesystem handler.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use wifiswitch_firmware::config::ConfigManager;
use wifiswitch_firmware::conntable::{Category, Connection, SendBuffer};
use wifiswitch_firmware::dbffs::DbffsBuilder;
use wifiswitch_firmware::http::handlers::fs::FsHandler;
use wifiswitch_firmware::http::handlers::rest::RestHandler;
use wifiswitch_firmware::http::pipeline::{HandlerChain, HttpState};
use wifiswitch_firmware::platform::fakes::{FakeConfigStore, FakeGpio, FakeWifiRadio};

fn fresh_conn() -> Connection {
    Connection {
        remote_ip: Ipv4Addr::new(192, 168, 4, 50),
        remote_port: 4000,
        local_ip: Ipv4Addr::new(192, 168, 4, 1),
        local_port: 80,
        category: Category::Http(HttpState::new()),
        send_buf: SendBuffer::new(),
        closing: false,
        timeout: Duration::from_secs(30),
        last_activity: Instant::now(),
        is_listener: false,
    }
}

fn chain() -> HandlerChain {
    let mut chain = HandlerChain::new();
    chain.register(Box::new(RestHandler::new(
        FakeWifiRadio::new(),
        FakeGpio::new(0b0000_0000_0000_0001),
        ConfigManager::new(FakeConfigStore::default()),
    )));
    let image = DbffsBuilder::new().file("index.html", b"<h1>switch</h1>").build();
    chain.register(Box::new(FsHandler::new(image)));
    chain
}

#[test]
fn fw_version_request_is_routed_to_rest_not_the_filesystem() {
    let mut chain = chain();
    let mut conn = fresh_conn();
    chain.on_recv(0, b"GET /rest/fw/version HTTP/1.1\r\n\r\n", &mut conn).unwrap();
    let out = String::from_utf8(conn.send_buf.as_slice().to_vec()).unwrap();
    assert!(out.starts_with("HTTP/1.1 200 OK"));
    assert!(out.contains("application/json"));
}

#[test]
fn disabled_gpio_pin_returns_404_without_faulting_the_handler_chain() {
    let mut chain = chain();
    let mut conn = fresh_conn();
    chain.on_recv(0, b"GET /rest/gpios/42 HTTP/1.1\r\n\r\n", &mut conn).unwrap();
    assert!(conn.send_buf.as_slice().starts_with(b"HTTP/1.1 404"));
}

#[test]
fn root_path_falls_through_to_the_filesystem_handler() {
    let mut chain = chain();
    let mut conn = fresh_conn();
    chain.on_recv(0, b"GET / HTTP/1.1\r\n\r\n", &mut conn).unwrap();
    let out = String::from_utf8(conn.send_buf.as_slice().to_vec()).unwrap();
    assert!(out.starts_with("HTTP/1.1 200 OK"));
    assert!(out.ends_with("<h1>switch</h1>"));
}

#[test]
fn gpio_write_then_read_round_trips_through_put_and_get() {
    let mut chain = chain();
    let mut conn = fresh_conn();
    let put_req = b"PUT /rest/gpios/0 HTTP/1.1\r\nContent-Length: 14\r\n\r\n{\"level\":true}";
    chain.on_recv(0, put_req, &mut conn).unwrap();
    let put_out = String::from_utf8(conn.send_buf.as_slice().to_vec()).unwrap();
    assert!(put_out.contains("\"level\":true"));

    conn.send_buf.clear();
    if let Category::Http(state) = &mut conn.category {
        state.reset_for_next_request();
    }
    chain.on_recv(0, b"GET /rest/gpios/0 HTTP/1.1\r\n\r\n", &mut conn).unwrap();
    let out = String::from_utf8(conn.send_buf.as_slice().to_vec()).unwrap();
    assert!(out.contains("\"level\":true"));
}
