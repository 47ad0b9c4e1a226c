//! Global send pump: serializes every outbound send across all connections.
//!
//! §4.C: the underlying radio API faults when a second send is issued before
//! the previous one completes, so unlike a per-connection queue this is a
//! single process-wide "currently sending" flag plus one shared ring buffer
//! of `{data, connection}` entries. `net_send` submits directly when the
//! flag is clear; otherwise it copies the payload and queues it. The
//! transport's sent-completion clears the flag and, if the ring is
//! non-empty, pops the oldest entry and reports it for the caller to submit.
//! Ordering is FIFO on the shared ring; there is no per-connection fairness
//! (§5 "Ordering guarantees": "the send pump's FIFO is the sole ordering
//! authority" across connections).

use crate::conntable::ConnId;
use crate::error::{FwError, FwResult};
use crate::ring::RingBuffer;

/// Matches the depth of the original firmware's single shared send queue.
pub const QUEUE_DEPTH: usize = 8;

struct QueuedSend {
    conn: ConnId,
    data: Vec<u8>,
}

/// Single-slot "currently sending" flag plus the shared backlog ring
/// (§3 "Ring buffer", §4.C).
pub struct SendPump {
    sending: bool,
    queue: RingBuffer<QueuedSend, QUEUE_DEPTH>,
}

impl SendPump {
    pub fn new() -> Self {
        SendPump { sending: false, queue: RingBuffer::new() }
    }

    /// Submit `data` for `conn`. If nothing is in flight anywhere, returns
    /// the entry for the caller to hand to the transport immediately and
    /// marks the pump busy. Otherwise queues it and returns `Ok(None)`, or
    /// `Err(ResourceExhausted)` if the shared backlog is full (§7
    /// "Resource exhaustion": "log and fail the operation; never block").
    pub fn net_send(&mut self, conn: ConnId, data: Vec<u8>) -> FwResult<Option<(ConnId, Vec<u8>)>> {
        if !self.sending {
            self.sending = true;
            return Ok(Some((conn, data)));
        }
        self.queue
            .push_back(QueuedSend { conn, data })
            .map(|_| None)
            .map_err(|_| FwError::ResourceExhausted("send queue"))
    }

    /// The transport reported completion for whichever send was in flight.
    /// Clears the flag and, if the backlog holds more, pops the oldest
    /// entry and re-marks the pump busy with it (§4.C "On the lower
    /// layer's sent-completion the pump clears the flag and, if the ring is
    /// non-empty, pops one item and submits it").
    pub fn on_sent(&mut self) -> Option<(ConnId, Vec<u8>)> {
        self.sending = false;
        let next = self.queue.pop_front()?;
        self.sending = true;
        Some((next.conn, next.data))
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub fn is_idle(&self) -> bool {
        !self.sending && self.queue.is_empty()
    }
}

impl Default for SendPump {
    fn default() -> Self {
        Self::new()
    }
}
