//! Network runtime core for a WiFi-controlled switch.
//!
//! Cooperative, single-threaded, callback-driven: one reactor loop accepts
//! connections, serves HTTP and upgraded WebSocket traffic, answers DHCP
//! leases and captive-portal DNS queries, and serves the UI out of a
//! read-only packed filesystem image. GPIO, flash, the config store, the
//! task scheduler, and the WiFi radio itself are treated as external
//! collaborators reached only through the traits in [`platform`].

pub mod config;
pub mod conntable;
pub mod dbffs;
pub mod dhcp;
pub mod dns;
pub mod engine;
pub mod error;
pub mod http;
pub mod platform;
pub mod proto;
pub mod ring;
pub mod sendpump;
pub mod transport;
pub mod ws;

pub use engine::Engine;
pub use error::{FwError, FwResult};
