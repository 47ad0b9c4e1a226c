//! REST API handler: firmware/system info, network configuration, and GPIO
//! control (§4.G, §6).
//!
//! Grounded on `original_source` `user/handlers/rest/gpio.c`'s enabled-pin
//! bitmask (`REST_GPIO_ENABLED`, `REST_GPIO_PINS`): a pin outside the mask
//! is treated exactly like a pin that doesn't exist, falling through the
//! handler chain via `DoneContinue` without writing anything, so clients
//! can't distinguish "disabled" from "no such URI" by response shape.

use crate::config::ConfigManager;
use crate::conntable::{Connection, ConnId};
use crate::error::FwResult;
use crate::http::parser::{Method, Request};
use crate::http::pipeline::{HandlerResult, HttpHandler};
use crate::platform::{ConfigStore, Gpio, WifiRadio, GPIO_PIN_COUNT};
use serde::{Deserialize, Serialize};

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const HTTPD_VERSION: &str = "1.1";
pub const DBFFS_VERSION: &str = "1";

#[derive(Serialize)]
struct VersionBody<'a> {
    fw_ver: &'a str,
    httpd_ver: &'a str,
    dbffs_ver: &'a str,
}

#[derive(Serialize)]
struct MemBody {
    free_bytes: u32,
    total_bytes: u32,
}

#[derive(Serialize)]
struct NetworkBody {
    mode: &'static str,
    ssid: String,
    hostname: String,
    ip: String,
}

#[derive(Serialize)]
struct NetworksBody {
    ssids: Vec<String>,
}

#[derive(Deserialize)]
struct PasswordPut {
    passwd: String,
}

#[derive(Deserialize)]
struct NetworkPut {
    mode: Option<String>,
    ssid: Option<String>,
    hostname: Option<String>,
}

#[derive(Serialize)]
struct GpioBody {
    pin: u8,
    level: bool,
}

#[derive(Serialize)]
struct GpiosBody {
    enabled_mask: u16,
    pins: Vec<GpioBody>,
}

#[derive(Deserialize)]
struct GpioPut {
    level: bool,
}

fn mode_str(mode: crate::platform::WifiMode) -> &'static str {
    match mode {
        crate::platform::WifiMode::Ap => "ap",
        crate::platform::WifiMode::Station => "station",
        crate::platform::WifiMode::ApStation => "apstation",
    }
}

pub struct RestHandler<W: WifiRadio, G: Gpio, C: ConfigStore> {
    radio: W,
    gpio: G,
    config: ConfigManager<C>,
    /// Set once a `/rest/net/networks` scan has been requested and hasn't
    /// completed, mirroring the wifiswitch protocol's single-outstanding-scan
    /// rule for the REST surface's own suspending handler (§4.G: "net-names
    /// handler suspends").
    scan_outstanding: bool,
}

impl<W: WifiRadio, G: Gpio, C: ConfigStore> RestHandler<W, G, C> {
    pub fn new(radio: W, gpio: G, config: ConfigManager<C>) -> Self {
        RestHandler { radio, gpio, config, scan_outstanding: false }
    }

    fn write_json(&self, conn: &mut Connection, body: &str) {
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\
             Connection: close\r\n\r\n",
            body.len()
        );
        conn.send_buf.append(head.as_bytes());
        conn.send_buf.append(body.as_bytes());
    }

    fn body_of<'a>(&self, req: &'a Request) -> &'a [u8] {
        req.body.as_deref().unwrap_or(&[])
    }

    fn handle_version(&self, conn: &mut Connection) -> FwResult<HandlerResult> {
        let body = serde_json::to_string(&VersionBody {
            fw_ver: FIRMWARE_VERSION,
            httpd_ver: HTTPD_VERSION,
            dbffs_ver: DBFFS_VERSION,
        })
        .expect("version body always serializes");
        self.write_json(conn, &body);
        Ok(HandlerResult::DoneFinal)
    }

    /// `/rest/fw/mem`: a coarse heap-usage snapshot. On a real board this
    /// reads the allocator's free-list total; there is no such concept in a
    /// `std` build, so both fields report the process's fixed request-buffer
    /// budget as a stand-in that at least keeps the response shape honest.
    fn handle_mem(&self, conn: &mut Connection) -> FwResult<HandlerResult> {
        let body = serde_json::to_string(&MemBody {
            free_bytes: crate::http::pipeline::MAX_REQUEST_BYTES as u32,
            total_bytes: crate::http::pipeline::MAX_REQUEST_BYTES as u32,
        })
        .expect("mem body always serializes");
        self.write_json(conn, &body);
        Ok(HandlerResult::DoneFinal)
    }

    fn handle_network_get(&self, conn: &mut Connection) -> FwResult<HandlerResult> {
        let record = self.config.load()?;
        let ip = self.radio.station_ip().map(|ip| ip.to_string()).unwrap_or_default();
        let body = serde_json::to_string(&NetworkBody {
            mode: mode_str(self.radio.mode()),
            ssid: self.radio.ap_info().ssid,
            hostname: record.hostname,
            ip,
        })
        .expect("network body always serializes");
        self.write_json(conn, &body);
        Ok(HandlerResult::DoneFinal)
    }

    fn handle_network_put(&mut self, req: &Request, conn: &mut Connection) -> FwResult<HandlerResult> {
        let Ok(put) = serde_json::from_slice::<NetworkPut>(self.body_of(req)) else {
            return Ok(HandlerResult::DoneError(400));
        };
        let mut record = self.config.load()?;
        if let Some(mode) = &put.mode {
            let new_mode = match mode.as_str() {
                "station" => crate::platform::WifiMode::Station,
                "ap" => crate::platform::WifiMode::Ap,
                _ => return Ok(HandlerResult::DoneError(400)),
            };
            self.radio.set_mode(new_mode);
            record.network_mode = match new_mode {
                crate::platform::WifiMode::Ap => crate::config::NetworkMode::Ap,
                crate::platform::WifiMode::Station => crate::config::NetworkMode::Station,
                crate::platform::WifiMode::ApStation => crate::config::NetworkMode::ApStation,
            };
        }
        if let Some(ssid) = &put.ssid {
            self.radio.connect_station(ssid, "")?;
        }
        if let Some(hostname) = put.hostname {
            record.hostname = hostname;
        }
        self.config.save(&record)?;
        self.handle_network_get(conn)
    }

    /// `/rest/net/networks`: suspends on the first call (triggers a scan,
    /// returns `DoneNoDealloc`), and the resuming call (driven by the
    /// external scan-complete notification re-entering the pipeline) writes
    /// the SSID list and completes the response (§4.G).
    fn handle_networks(&mut self, conn: &mut Connection) -> FwResult<HandlerResult> {
        match self.radio.scan_results() {
            Some(results) => {
                self.scan_outstanding = false;
                let ssids = results.into_iter().map(|r| truncate_ssid(&r.ssid)).collect();
                let body = serde_json::to_string(&NetworksBody { ssids }).expect("networks body always serializes");
                self.write_json(conn, &body);
                Ok(HandlerResult::DoneFinal)
            }
            None => {
                if !self.scan_outstanding {
                    self.radio.start_scan()?;
                    self.scan_outstanding = true;
                }
                Ok(HandlerResult::DoneNoDealloc)
            }
        }
    }

    fn handle_password(&mut self, req: &Request, conn: &mut Connection) -> FwResult<HandlerResult> {
        if req.method != Method::Put {
            return Ok(HandlerResult::DoneError(405));
        }
        let Ok(put) = serde_json::from_slice::<PasswordPut>(self.body_of(req)) else {
            return Ok(HandlerResult::DoneError(400));
        };
        let ssid = self.radio.ap_info().ssid;
        self.radio.connect_station(&ssid, &put.passwd)?;
        conn.send_buf.append(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n");
        Ok(HandlerResult::DoneFinal)
    }

    /// `/rest/gpios`: every enabled pin's level plus the raw bitmask, so a
    /// client can render a panel without probing each pin one at a time.
    fn handle_gpios_collection(&self, req: &Request, conn: &mut Connection) -> FwResult<HandlerResult> {
        if !matches!(req.method, Method::Get | Method::Head) {
            return Ok(HandlerResult::DoneError(405));
        }
        let mask = self.gpio.enabled_mask();
        let pins = (0..GPIO_PIN_COUNT as u8)
            .filter(|pin| mask & (1u16 << pin) != 0)
            .map(|pin| GpioBody { pin, level: self.gpio.read(pin).unwrap_or(false) })
            .collect();
        let body = serde_json::to_string(&GpiosBody { enabled_mask: mask, pins })
            .expect("gpios body always serializes");
        self.write_json(conn, &body);
        Ok(HandlerResult::DoneFinal)
    }

    fn handle_gpio(&mut self, req: &Request, pin_str: &str, conn: &mut Connection) -> FwResult<HandlerResult> {
        // A pin outside the enabled mask is routed back through the chain
        // rather than answered directly, so it reads exactly like a URI no
        // handler recognized (no probing board wiring via response shape).
        let Ok(pin) = pin_str.parse::<u8>() else {
            return Ok(HandlerResult::DoneContinue);
        };
        if pin as usize >= GPIO_PIN_COUNT || self.gpio.enabled_mask() & (1u16 << pin) == 0 {
            return Ok(HandlerResult::DoneContinue);
        }
        match req.method {
            Method::Get | Method::Head => {
                let level = self.gpio.read(pin).unwrap_or(false);
                let body = serde_json::to_string(&GpioBody { pin, level })
                    .expect("gpio body always serializes");
                self.write_json(conn, &body);
                Ok(HandlerResult::DoneFinal)
            }
            Method::Put | Method::Post => {
                let Ok(put) = serde_json::from_slice::<GpioPut>(self.body_of(req)) else {
                    return Ok(HandlerResult::DoneError(400));
                };
                self.gpio.write(pin, put.level);
                let body = serde_json::to_string(&GpioBody { pin, level: put.level })
                    .expect("gpio body always serializes");
                self.write_json(conn, &body);
                Ok(HandlerResult::DoneFinal)
            }
            _ => Ok(HandlerResult::DoneError(405)),
        }
    }
}

/// SSIDs reported by `/rest/net/networks` are truncated to 32 bytes, the
/// same bound the original firmware's scan-result buffer enforced.
fn truncate_ssid(ssid: &str) -> String {
    if ssid.len() <= 32 {
        ssid.to_string()
    } else {
        let mut end = 32;
        while !ssid.is_char_boundary(end) {
            end -= 1;
        }
        ssid[..end].to_string()
    }
}

impl<W: WifiRadio, G: Gpio, C: ConfigStore> HttpHandler for RestHandler<W, G, C> {
    fn matches(&self, uri: &str) -> bool {
        uri.starts_with("/rest/")
    }

    fn handle(&mut self, _conn_id: ConnId, req: &Request, conn: &mut Connection) -> FwResult<HandlerResult> {
        let tail = req.uri.trim_start_matches("/rest/");
        match tail {
            "fw/version" => return self.handle_version(conn),
            "fw/mem" => return self.handle_mem(conn),
            "net/network" => {
                return match req.method {
                    Method::Get | Method::Head => self.handle_network_get(conn),
                    Method::Put => self.handle_network_put(req, conn),
                    _ => Ok(HandlerResult::DoneError(405)),
                };
            }
            "net/networks" => {
                return match req.method {
                    Method::Get | Method::Head => self.handle_networks(conn),
                    _ => Ok(HandlerResult::DoneError(405)),
                };
            }
            "net/password" => return self.handle_password(req, conn),
            "gpios" => return self.handle_gpios_collection(req, conn),
            _ => {}
        }
        if let Some(rest) = tail.strip_prefix("gpios/") {
            let pin_part = rest.split('/').next().unwrap_or(rest);
            return self.handle_gpio(req, pin_part, conn);
        }
        Ok(HandlerResult::DoneError(404))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntable::{Category, SendBuffer};
    use crate::http::pipeline::HttpState;
    use crate::platform::fakes::{FakeConfigStore, FakeGpio, FakeWifiRadio};
    use std::collections::HashMap;
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

    fn req(method: Method, uri: &str) -> Request {
        Request { method, uri: uri.to_string(), version_minor: 1, headers: HashMap::new(), header_len: 0, body: None }
    }

    fn req_with_body(method: Method, uri: &str, body: &[u8]) -> Request {
        let mut r = req(method, uri);
        r.body = Some(body.to_vec());
        r
    }

    fn handler() -> RestHandler<FakeWifiRadio, FakeGpio, FakeConfigStore> {
        RestHandler::new(FakeWifiRadio::new(), FakeGpio::new(0xffff), ConfigManager::new(FakeConfigStore::default()))
    }

    #[test]
    fn fw_version_returns_200_json_with_three_version_fields() {
        let mut handler = handler();
        let mut conn = test_conn();
        handler.handle(0, &req(Method::Get, "/rest/fw/version"), &mut conn).unwrap();
        let out = String::from_utf8(conn.send_buf.as_slice().to_vec()).unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK"));
        assert!(out.contains("\"fw_ver\""));
        assert!(out.contains("\"httpd_ver\""));
        assert!(out.contains("\"dbffs_ver\""));
    }

    #[test]
    fn fw_mem_returns_200_json() {
        let mut handler = handler();
        let mut conn = test_conn();
        let result = handler.handle(0, &req(Method::Get, "/rest/fw/mem"), &mut conn).unwrap();
        assert!(matches!(result, HandlerResult::DoneFinal));
        assert!(conn.send_buf.as_slice().starts_with(b"HTTP/1.1 200 OK"));
    }

    #[test]
    fn net_network_get_reports_mode_and_hostname() {
        let mut handler = handler();
        let mut conn = test_conn();
        handler.handle(0, &req(Method::Get, "/rest/net/network"), &mut conn).unwrap();
        let out = String::from_utf8(conn.send_buf.as_slice().to_vec()).unwrap();
        assert!(out.contains("\"mode\":\"ap\""));
        assert!(out.contains("\"hostname\":\"wifiswitch\""));
    }

    #[test]
    fn net_network_put_switches_mode_and_persists() {
        let mut handler = handler();
        let mut conn = test_conn();
        handler
            .handle(0, &req_with_body(Method::Put, "/rest/net/network", br#"{"mode":"station","hostname":"shed"}"#), &mut conn)
            .unwrap();
        assert_eq!(handler.radio.mode(), crate::platform::WifiMode::Station);
        assert_eq!(handler.config.load().unwrap().hostname, "shed");
    }

    #[test]
    fn net_networks_first_call_suspends_and_triggers_scan() {
        let mut handler = handler();
        let mut conn = test_conn();
        let result = handler.handle(0, &req(Method::Get, "/rest/net/networks"), &mut conn).unwrap();
        assert!(matches!(result, HandlerResult::DoneNoDealloc));
        assert!(conn.send_buf.as_slice().is_empty());
    }

    #[test]
    fn net_networks_resumes_once_scan_results_are_available() {
        let mut handler = handler();
        let mut conn = test_conn();
        handler.handle(0, &req(Method::Get, "/rest/net/networks"), &mut conn).unwrap();
        handler.radio.complete_scan(vec![crate::platform::ScanResult {
            ssid: "home".to_string(),
            rssi: -50,
            channel: 6,
            encrypted: true,
        }]);
        let result = handler.handle(0, &req(Method::Get, "/rest/net/networks"), &mut conn).unwrap();
        assert!(matches!(result, HandlerResult::DoneFinal));
        assert!(String::from_utf8(conn.send_buf.as_slice().to_vec()).unwrap().contains("\"home\""));
    }

    #[test]
    fn net_password_put_applies_then_returns_204() {
        let mut handler = handler();
        let mut conn = test_conn();
        let result = handler
            .handle(0, &req_with_body(Method::Put, "/rest/net/password", br#"{"passwd":"new-secret"}"#), &mut conn)
            .unwrap();
        assert!(matches!(result, HandlerResult::DoneFinal));
        assert!(conn.send_buf.as_slice().starts_with(b"HTTP/1.1 204"));
    }

    #[test]
    fn disabled_gpio_pin_falls_through_without_writing_a_body() {
        let mut handler = RestHandler::new(FakeWifiRadio::new(), FakeGpio::new(0b0000_0000_0000_0001), ConfigManager::new(FakeConfigStore::default()));
        let mut conn = test_conn();
        let result = handler.handle(0, &req(Method::Get, "/rest/gpios/42"), &mut conn).unwrap();
        assert!(matches!(result, HandlerResult::DoneContinue));
        assert!(conn.send_buf.as_slice().is_empty());
    }

    #[test]
    fn gpios_collection_reports_enabled_mask_and_pin_levels() {
        let mut handler = RestHandler::new(FakeWifiRadio::new(), FakeGpio::new(0b0000_0000_0000_0101), ConfigManager::new(FakeConfigStore::default()));
        let mut conn = test_conn();
        handler
            .handle(0, &req_with_body(Method::Put, "/rest/gpios/0", br#"{"level":true}"#), &mut conn)
            .unwrap();
        conn.send_buf.clear();
        let result = handler.handle(0, &req(Method::Get, "/rest/gpios"), &mut conn).unwrap();
        assert!(matches!(result, HandlerResult::DoneFinal));
        let out = String::from_utf8(conn.send_buf.as_slice().to_vec()).unwrap();
        assert!(out.contains("\"enabled_mask\":5"));
        assert!(out.contains("\"pin\":0"));
        assert!(out.contains("\"pin\":2"));
    }

    #[test]
    fn enabled_pin_round_trips_through_put_then_get() {
        let mut handler = RestHandler::new(FakeWifiRadio::new(), FakeGpio::new(0b0000_0000_0000_0001), ConfigManager::new(FakeConfigStore::default()));
        let mut conn = test_conn();
        handler
            .handle(0, &req_with_body(Method::Put, "/rest/gpios/0", br#"{"level":true}"#), &mut conn)
            .unwrap();
        let put_out = String::from_utf8(conn.send_buf.as_slice().to_vec()).unwrap();
        assert!(put_out.contains("\"level\":true"));

        conn.send_buf.clear();
        handler.handle(0, &req(Method::Get, "/rest/gpios/0"), &mut conn).unwrap();
        let get_out = String::from_utf8(conn.send_buf.as_slice().to_vec()).unwrap();
        assert!(get_out.contains("\"level\":true"));
    }

    #[test]
    fn gpio_put_with_malformed_body_is_a_400() {
        let mut handler = RestHandler::new(FakeWifiRadio::new(), FakeGpio::new(0b1), ConfigManager::new(FakeConfigStore::default()));
        let mut conn = test_conn();
        let result = handler
            .handle(0, &req_with_body(Method::Put, "/rest/gpios/0", b"not json"), &mut conn)
            .unwrap();
        assert!(matches!(result, HandlerResult::DoneError(400)));
    }

    #[test]
    fn gpios_collection_rejects_put() {
        let mut handler = handler();
        let mut conn = test_conn();
        let result = handler.handle(0, &req(Method::Put, "/rest/gpios"), &mut conn).unwrap();
        assert!(matches!(result, HandlerResult::DoneError(405)));
    }
}
