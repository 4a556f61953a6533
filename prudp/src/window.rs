//! Congestion window: the bounded set of packets sent but not yet acknowledged.
//!
//! [`CongestionWindow`] holds up to `capacity` in-flight packets keyed by
//! sequence id.  Unlike a Go-Back-N window, acknowledgements are selective:
//! each ack removes exactly the entry with its sequence id, and every entry
//! owns its own retransmit timer.
//!
//! # Contract
//!
//! - The number of entries never exceeds `capacity`.
//! - A sequence id maps to at most one [`SentPacket`].
//! - Every entry holds exactly one live timer; removing or replacing it
//!   cancels the old one.
//!
//! This module only manages state; sending and rescheduling are the
//! connection's job.

use std::collections::HashMap;

use crate::packet::Packet;
use crate::timer::Cancel;

/// Number of unacknowledged packets allowed in flight by default.
pub const DEFAULT_WINDOW_SIZE: usize = 5;

// ---------------------------------------------------------------------------
// SentPacket
// ---------------------------------------------------------------------------

/// A transmitted packet and the timer that will resend it.
#[derive(Debug)]
pub struct SentPacket<H> {
    /// The packet as last transmitted.
    pub packet: Packet,
    /// Total number of times this packet has been transmitted.
    pub transmissions: u32,
    timer: H,
}

impl<H: Cancel> SentPacket<H> {
    pub fn new(packet: Packet, timer: H) -> Self {
        Self {
            packet,
            transmissions: 1,
            timer,
        }
    }

    pub fn timer(&self) -> &H {
        &self.timer
    }
}

// ---------------------------------------------------------------------------
// CongestionWindow
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CongestionWindow<H> {
    capacity: usize,
    entries: HashMap<u16, SentPacket<H>>,
}

impl<H: Cancel> CongestionWindow<H> {
    /// Create a window holding at most `capacity` packets (≥ 1).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "congestion window capacity must be at least 1");
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of packets currently awaiting acknowledgement.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    /// Track a just-transmitted packet.
    ///
    /// Returns `false` without touching the window when it is full or the
    /// sequence id is already tracked; the rejected record's timer is
    /// cancelled.
    pub fn add_sent_packet(&mut self, record: SentPacket<H>) -> bool {
        let sequence_id = record.packet.sequence_id;
        if self.is_full() || self.entries.contains_key(&sequence_id) {
            record.timer.cancel();
            return false;
        }
        self.entries.insert(sequence_id, record);
        true
    }

    /// Remove the entry acknowledged by `ack` and cancel its timer.
    ///
    /// Returns `false` for duplicate or unexpected acks, which are no-ops.
    pub fn acknowledge_packet(&mut self, ack: &Packet) -> bool {
        match self.entries.remove(&ack.sequence_id) {
            Some(record) => {
                record.timer.cancel();
                true
            }
            None => false,
        }
    }

    pub fn waiting_for(&self, sequence_id: u16) -> bool {
        self.entries.contains_key(&sequence_id)
    }

    pub fn get(&self, sequence_id: u16) -> Option<&SentPacket<H>> {
        self.entries.get(&sequence_id)
    }

    /// Swap in a freshly armed timer after a resend, cancelling the old one.
    ///
    /// Returns `false` (and cancels `timer`) when nothing is tracked under
    /// `sequence_id`.
    pub fn replace_timer(&mut self, sequence_id: u16, timer: H) -> bool {
        match self.entries.get_mut(&sequence_id) {
            Some(record) => {
                let old = std::mem::replace(&mut record.timer, timer);
                old.cancel();
                record.transmissions += 1;
                true
            }
            None => {
                timer.cancel();
                false
            }
        }
    }

    /// Drop every entry, cancelling all outstanding timers.
    pub fn clear(&mut self) {
        for (_, record) in self.entries.drain() {
            record.timer.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
