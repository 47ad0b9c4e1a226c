//! Collaborator interfaces for everything outside this crate's scope: GPIO,
//! flash storage, the config store, the task scheduler, and the WiFi radio.
//! The firmware core depends only on these traits, never on a concrete
//! board; a real board wires in flash-backed/radio-backed implementations,
//! tests wire in the fakes below.

use crate::error::FwResult;
use std::net::Ipv4Addr;

/// Number of GPIO pins addressable by the REST handler (`original_source`
/// `user/handlers/rest/gpio.c`: `REST_GPIO_PINS`).
pub const GPIO_PIN_COUNT: usize = 16;

pub trait Gpio {
    /// Read the current level of `pin`. `None` if the pin is not enabled.
    fn read(&self, pin: u8) -> Option<bool>;

    /// Drive `pin` to `level`. No-op if the pin is not enabled.
    fn write(&mut self, pin: u8, level: bool);

    /// Bitmask of pins this board exposes to the REST API, bit N set for
    /// pin N (`REST_GPIO_ENABLED`). Disabled pins never appear in
    /// `/rest/gpios` responses regardless of their wiring.
    fn enabled_mask(&self) -> u16;
}

pub trait Clock {
    /// Milliseconds since an arbitrary epoch, monotonic for the process
    /// lifetime. Used for timeouts, DHCP lease expiry, and WS ping timers.
    fn now_ms(&self) -> u64;
}

pub trait ConfigStore {
    /// Load the persisted configuration record, if one is present.
    fn load(&self) -> FwResult<Option<Vec<u8>>>;

    /// Persist a configuration record, overwriting any prior one.
    fn save(&mut self, record: &[u8]) -> FwResult<()>;
}

/// A unit of deferred work submitted to the external scheduler (§6): used to
/// kick off a WiFi scan or station connect without blocking the reactor.
pub trait TaskRunner {
    fn spawn(&mut self, task: Box<dyn FnOnce() + Send>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub ssid: String,
    pub rssi: i8,
    pub channel: u8,
    pub encrypted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMode {
    Ap,
    Station,
    ApStation,
}

/// Snapshot of the radio's access-point identity, reported by the `ap`
/// wifiswitch message and never itself mutated by it (§4.I: `ap` takes no
/// inbound fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApInfo {
    pub ssid: String,
    pub channel: u8,
    pub ip: Ipv4Addr,
}

pub trait WifiRadio {
    fn mode(&self) -> WifiMode;
    fn set_mode(&mut self, mode: WifiMode);

    /// Begin an asynchronous scan. The spec allows at most one outstanding
    /// scan at a time; a second request while one is in flight is an error.
    fn start_scan(&mut self) -> FwResult<()>;
    fn scan_results(&self) -> Option<Vec<ScanResult>>;

    fn connect_station(&mut self, ssid: &str, psk: &str) -> FwResult<()>;
    fn station_status(&self) -> StationStatus;

    /// The station interface's current address, if associated.
    fn station_ip(&self) -> Option<Ipv4Addr>;

    /// The access-point interface's current identity.
    fn ap_info(&self) -> ApInfo;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationStatus {
    Idle,
    Connecting,
    Connected,
    Failed,
}

/// In-memory fakes for every collaborator trait above. Used by this crate's
/// own unit and integration tests and by the demo binary, which has no real
/// board to wire in; kept as a plain module (not `#[cfg(test)]`) so it is
/// visible from `tests/` and `demos/`, which link against the library
/// without test cfg active.
pub mod fakes {
    use super::*;
    use crate::error::FwError;

    pub struct FakeGpio {
        levels: [bool; GPIO_PIN_COUNT],
        enabled: u16,
    }

    impl FakeGpio {
        pub fn new(enabled: u16) -> Self {
            FakeGpio { levels: [false; GPIO_PIN_COUNT], enabled }
        }
    }

    impl Gpio for FakeGpio {
        fn read(&self, pin: u8) -> Option<bool> {
            if (pin as usize) < GPIO_PIN_COUNT && self.enabled & (1 << pin) != 0 {
                Some(self.levels[pin as usize])
            } else {
                None
            }
        }

        fn write(&mut self, pin: u8, level: bool) {
            if (pin as usize) < GPIO_PIN_COUNT && self.enabled & (1 << pin) != 0 {
                self.levels[pin as usize] = level;
            }
        }

        fn enabled_mask(&self) -> u16 {
            self.enabled
        }
    }

    pub struct FakeClock {
        pub ms: std::cell::Cell<u64>,
    }

    impl FakeClock {
        pub fn new() -> Self {
            FakeClock { ms: std::cell::Cell::new(0) }
        }

        pub fn advance(&self, ms: u64) {
            self.ms.set(self.ms.get() + ms);
        }
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.ms.get()
        }
    }

    #[derive(Default)]
    pub struct FakeConfigStore {
        record: Option<Vec<u8>>,
    }

    impl ConfigStore for FakeConfigStore {
        fn load(&self) -> FwResult<Option<Vec<u8>>> {
            Ok(self.record.clone())
        }

        fn save(&mut self, record: &[u8]) -> FwResult<()> {
            self.record = Some(record.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeTaskRunner {
        pub spawned: usize,
    }

    impl TaskRunner for FakeTaskRunner {
        fn spawn(&mut self, task: Box<dyn FnOnce() + Send>) {
            self.spawned += 1;
            task();
        }
    }

    pub struct FakeWifiRadio {
        mode: WifiMode,
        scanning: bool,
        results: Option<Vec<ScanResult>>,
        station: StationStatus,
        station_ip: Option<Ipv4Addr>,
        ap_info: ApInfo,
    }

    impl FakeWifiRadio {
        pub fn new() -> Self {
            FakeWifiRadio {
                mode: WifiMode::Ap,
                scanning: false,
                results: None,
                station: StationStatus::Idle,
                station_ip: None,
                ap_info: ApInfo {
                    ssid: "wifiswitch".to_string(),
                    channel: 6,
                    ip: Ipv4Addr::new(192, 168, 4, 1),
                },
            }
        }

        pub fn complete_scan(&mut self, results: Vec<ScanResult>) {
            self.scanning = false;
            self.results = Some(results);
        }

        pub fn set_station_ip(&mut self, ip: Option<Ipv4Addr>) {
            self.station_ip = ip;
            self.station = if ip.is_some() { StationStatus::Connected } else { self.station };
        }
    }

    impl WifiRadio for FakeWifiRadio {
        fn mode(&self) -> WifiMode {
            self.mode
        }

        fn set_mode(&mut self, mode: WifiMode) {
            self.mode = mode;
        }

        fn start_scan(&mut self) -> FwResult<()> {
            if self.scanning {
                return Err(FwError::Invariant("scan already in progress"));
            }
            self.scanning = true;
            self.results = None;
            Ok(())
        }

        fn scan_results(&self) -> Option<Vec<ScanResult>> {
            self.results.clone()
        }

        fn connect_station(&mut self, _ssid: &str, _psk: &str) -> FwResult<()> {
            self.station = StationStatus::Connecting;
            Ok(())
        }

        fn station_status(&self) -> StationStatus {
            self.station
        }

        fn station_ip(&self) -> Option<Ipv4Addr> {
            self.station_ip
        }

        fn ap_info(&self) -> ApInfo {
            self.ap_info.clone()
        }
    }

    #[test]
    fn gpio_mask_hides_disabled_pins() {
        let mut gpio = FakeGpio::new(0b0000_0000_0000_0011);
        gpio.write(0, true);
        gpio.write(2, true);
        assert_eq!(gpio.read(0), Some(true));
        assert_eq!(gpio.read(2), None);
    }

    #[test]
    fn second_scan_while_in_flight_is_rejected() {
        let mut radio = FakeWifiRadio::new();
        radio.start_scan().unwrap();
        assert!(radio.start_scan().is_err());
        radio.complete_scan(vec![]);
        assert!(radio.start_scan().is_ok());
    }
}
