//! The `wifiswitch` WebSocket protocol: JSON control messages for firmware
//! info, WiFi scan/station/AP configuration, and GPIO control (§4.I).
//!
//! Grounded on `original_source` `src/handlers/websocket/wifiswitch.c`,
//! which dispatches each incoming frame by reading a 2-byte type prefix out
//! of the payload and switching on its integer value, a 2-byte prefix used
//! as a dispatch tag that invites silent misrouting when the two sides
//! disagree on the table. This is replaced with a tagged JSON
//! object (`{"type": "...", ...}`) decoded directly into a Rust enum via
//! `serde_json`, so an unrecognized `type` value is a decode error instead
//! of a wrong-handler dispatch.

use crate::config::{ConfigManager, NetworkMode};
use crate::conntable::{ConnId, Connection};
use crate::error::{FwError, FwResult};
use crate::platform::{ConfigStore, Gpio, ScanResult, WifiMode, WifiRadio, GPIO_PIN_COUNT};
use crate::ws::frame::{encode_text, WsFrame};
use crate::ws::registry::WsProtocolHandler;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A connection is considered part of an ongoing wifiswitch conversation as
/// long as frames keep arriving within this window (§4.I).
const WIFISWITCH_TIMEOUT: Duration = Duration::from_secs(240);

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Fw { mode: Option<String> },
    Networks,
    Station { ssid: Option<String>, passwd: Option<String>, hostname: Option<String> },
    Ap,
    Gpio(GpioPins),
}

/// Catches the dynamic `<pin>:<0|1>` pairs a `gpio` message carries instead
/// of a fixed field set; the `type` tag itself also lands in here (internally
/// tagged newtype variants see the whole object) but is harmless since it
/// never parses as a pin index below.
#[derive(Deserialize)]
struct GpioPins {
    #[serde(flatten)]
    pins: HashMap<String, serde_json::Value>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage {
    Fw { mode: String, ver: String },
    Networks { ssids: Vec<String> },
    Station { ssid: String, hostname: String, ip: String },
    Ap { ssid: String, channel: u8, hostname: String, ip: String },
    Gpio {
        gpios: Vec<u8>,
        #[serde(flatten)]
        pins: HashMap<String, u8>,
    },
    Error { reason: &'static str },
}

fn mode_str(mode: WifiMode) -> &'static str {
    match mode {
        WifiMode::Ap => "ap",
        WifiMode::Station => "station",
        WifiMode::ApStation => "apstation",
    }
}

fn parse_mode(s: &str) -> Option<WifiMode> {
    match s {
        "station" => Some(WifiMode::Station),
        "ap" => Some(WifiMode::Ap),
        _ => None,
    }
}

fn to_network_mode(mode: WifiMode) -> NetworkMode {
    match mode {
        WifiMode::Ap => NetworkMode::Ap,
        WifiMode::Station => NetworkMode::Station,
        WifiMode::ApStation => NetworkMode::ApStation,
    }
}

pub struct WifiswitchHandler<W: WifiRadio, G: Gpio, C: ConfigStore> {
    radio: W,
    gpio: G,
    config: ConfigManager<C>,
    /// True once a scan has been requested and not yet completed, so a
    /// second `networks` message while one is outstanding is dropped
    /// silently here rather than relying on the radio to enforce it (§4.I:
    /// "single outstanding scan").
    scan_outstanding: bool,
    /// The last SSID a `station` message named, reported back when a later
    /// `station` message omits it (querying current status without
    /// changing the target network).
    last_ssid: String,
}

impl<W: WifiRadio, G: Gpio, C: ConfigStore> WifiswitchHandler<W, G, C> {
    pub fn new(radio: W, gpio: G, config: ConfigManager<C>) -> Self {
        WifiswitchHandler { radio, gpio, config, scan_outstanding: false, last_ssid: String::new() }
    }

    fn send(&self, conn: &mut Connection, msg: &ServerMessage) -> FwResult<()> {
        let body = serde_json::to_string(msg).map_err(|_| FwError::Invariant("ws message serialize"))?;
        conn.send_buf.append(&encode_text(&body));
        Ok(())
    }

    fn handle_fw(&mut self, conn: &mut Connection, mode: Option<String>) -> FwResult<()> {
        if let Some(requested) = mode {
            let Some(new_mode) = parse_mode(&requested) else {
                return self.send(conn, &ServerMessage::Error { reason: "unknown mode" });
            };
            if new_mode != self.radio.mode() {
                self.radio.set_mode(new_mode);
                let mut record = self.config.load()?;
                record.network_mode = to_network_mode(new_mode);
                self.config.save(&record)?;
            }
        }
        self.send(
            conn,
            &ServerMessage::Fw { mode: mode_str(self.radio.mode()).to_string(), ver: crate::http::handlers::rest::FIRMWARE_VERSION.to_string() },
        )
    }

    fn handle_networks(&mut self) -> FwResult<()> {
        // §4.I: the response is always deferred to `notify_scan_complete`;
        // a concurrent request while one is outstanding returns silently.
        if self.scan_outstanding {
            return Ok(());
        }
        if self.radio.start_scan().is_ok() {
            self.scan_outstanding = true;
        }
        Ok(())
    }

    fn handle_station(
        &mut self,
        conn: &mut Connection,
        ssid: Option<String>,
        passwd: Option<String>,
        hostname: Option<String>,
    ) -> FwResult<()> {
        if let Some(ssid) = ssid {
            self.radio.connect_station(&ssid, passwd.as_deref().unwrap_or(""))?;
            self.last_ssid = ssid;
        }
        let mut record = self.config.load()?;
        if let Some(hostname) = hostname {
            record.hostname = hostname;
            self.config.save(&record)?;
        }
        let ip = self.radio.station_ip().map(|ip| ip.to_string()).unwrap_or_default();
        self.send(conn, &ServerMessage::Station { ssid: self.last_ssid.clone(), hostname: record.hostname, ip })
    }

    fn handle_ap(&mut self, conn: &mut Connection) -> FwResult<()> {
        let info = self.radio.ap_info();
        let record = self.config.load()?;
        self.send(
            conn,
            &ServerMessage::Ap { ssid: info.ssid, channel: info.channel, hostname: record.hostname, ip: info.ip.to_string() },
        )
    }

    fn handle_gpio(&mut self, conn: &mut Connection, pins: HashMap<String, serde_json::Value>) -> FwResult<()> {
        for (key, value) in &pins {
            let Ok(pin) = key.parse::<u8>() else { continue };
            if (pin as usize) >= GPIO_PIN_COUNT || self.gpio.enabled_mask() & (1u16 << pin) == 0 {
                continue;
            }
            let level = match value {
                serde_json::Value::Bool(b) => *b,
                serde_json::Value::Number(n) => n.as_u64().map(|v| v != 0).unwrap_or(false),
                _ => false,
            };
            self.gpio.write(pin, level);
        }

        let mask = self.gpio.enabled_mask();
        let mut gpios = Vec::new();
        let mut states = HashMap::new();
        for pin in 0..GPIO_PIN_COUNT as u8 {
            if mask & (1u16 << pin) != 0 {
                gpios.push(pin);
                states.insert(pin.to_string(), self.gpio.read(pin).unwrap_or(false) as u8);
            }
        }
        self.send(conn, &ServerMessage::Gpio { gpios, pins: states })
    }

    fn dispatch(&mut self, conn: &mut Connection, text: &str) -> FwResult<()> {
        let parsed: ClientMessage =
            serde_json::from_str(text).map_err(|_| FwError::Parse("malformed wifiswitch message"))?;
        match parsed {
            ClientMessage::Fw { mode } => self.handle_fw(conn, mode),
            ClientMessage::Networks => self.handle_networks(),
            ClientMessage::Station { ssid, passwd, hostname } => self.handle_station(conn, ssid, passwd, hostname),
            ClientMessage::Ap => self.handle_ap(conn),
            ClientMessage::Gpio(GpioPins { pins }) => self.handle_gpio(conn, pins),
        }
    }

    /// Called once a previously requested scan finishes, to push the
    /// results to the client without waiting for another `networks`
    /// request. A real board wires this to the radio's scan-complete
    /// notification; tests call it directly.
    pub fn notify_scan_complete(&mut self, conn: &mut Connection, results: Vec<ScanResult>) -> FwResult<()> {
        self.scan_outstanding = false;
        let ssids = results.into_iter().map(|r| truncate_ssid(&r.ssid)).collect();
        self.send(conn, &ServerMessage::Networks { ssids })
    }
}

/// SSIDs in scan responses are truncated to 32 bytes, the same bound the
/// original firmware's scan-result buffer enforced (§4.G net/networks).
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

impl<W: WifiRadio, G: Gpio, C: ConfigStore> WsProtocolHandler for WifiswitchHandler<W, G, C> {
    fn name(&self) -> &str {
        "wifiswitch"
    }

    fn on_connect(&mut self, _conn_id: ConnId, conn: &mut Connection) -> FwResult<()> {
        self.send(
            conn,
            &ServerMessage::Fw { mode: mode_str(self.radio.mode()).to_string(), ver: crate::http::handlers::rest::FIRMWARE_VERSION.to_string() },
        )
    }

    fn on_message(&mut self, _conn_id: ConnId, conn: &mut Connection, frame: &WsFrame) -> FwResult<()> {
        conn.timeout = WIFISWITCH_TIMEOUT;
        conn.last_activity = Instant::now();
        if !frame.is_text() {
            return Err(FwError::Parse("wifiswitch protocol only accepts text frames"));
        }
        let text = std::str::from_utf8(&frame.payload).map_err(|_| FwError::Parse("non-utf8 ws text frame"))?;
        self.dispatch(conn, text)
    }

    fn on_close(&mut self, _conn_id: ConnId) {
        // §4.I: close is a no-op for this protocol; the core handles framing.
        self.scan_outstanding = false;
    }
}
