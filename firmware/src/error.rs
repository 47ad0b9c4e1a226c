//! Crate-wide error type. Each subsystem defines a small local error enum
//! and feeds it into `FwError` via `From`, so call sites can propagate with
//! `?` all the way up to the engine's dispatch loop without a stack of
//! `.map_err(...)` calls.

use std::fmt;

#[derive(Debug)]
pub enum FwError {
    /// A connection-table or send-pump slot was requested but none is free.
    ResourceExhausted(&'static str),
    /// Malformed input at a protocol boundary (HTTP, WebSocket, DHCP, DNS).
    Parse(&'static str),
    /// The underlying transport rejected an operation (closed socket, etc).
    Io(String),
    /// A flash/config-store read failed or returned corrupt data.
    Storage(&'static str),
    /// Programmer-visible invariant violation; never expected to occur at
    /// runtime on valid input, not propagated from parser paths.
    Invariant(&'static str),
}

impl fmt::Display for FwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FwError::ResourceExhausted(what) => write!(f, "resource exhausted: {what}"),
            FwError::Parse(what) => write!(f, "parse error: {what}"),
            FwError::Io(msg) => write!(f, "io error: {msg}"),
            FwError::Storage(what) => write!(f, "storage error: {what}"),
            FwError::Invariant(what) => write!(f, "invariant violated: {what}"),
        }
    }
}

impl std::error::Error for FwError {}

impl From<std::io::Error> for FwError {
    fn from(e: std::io::Error) -> Self {
        FwError::Io(e.to_string())
    }
}

pub type FwResult<T> = Result<T, FwError>;
