//! Retention ring of recently forwarded packets for one stream layer

use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::packet::RtpPacket;
use crate::seq::SeqUnwrapper;
use crate::types::SeqRange;

struct Entry {
    ext_seq: u64,
    stored_at: Instant,
    packet: RtpPacket,
}

struct Ring {
    slots: Vec<Option<Entry>>,
    mask: u64,
    unwrapper: SeqUnwrapper,
    len: usize,
}

impl Ring {
    fn slot(&self, ext: u64) -> Option<&Entry> {
        self.slots[(ext & self.mask) as usize]
            .as_ref()
            .filter(|e| e.ext_seq == ext)
    }

    fn oldest_fresh(&self, now: Instant, retention: Duration) -> Option<u64> {
        let highest = self.unwrapper.highest()?;
        let start = (highest + 1).saturating_sub(self.slots.len() as u64);
        (start..=highest).find(|&ext| {
            self.slot(ext)
                .is_some_and(|e| now.saturating_duration_since(e.stored_at) <= retention)
        })
    }
}

/// Count- and age-capped packet store keyed by incoming sequence number
///
/// Written by the forwarding path, read by loss recovery.
pub struct RecoveryWindow {
    ring: RwLock<Ring>,
    retention: Duration,
}

impl RecoveryWindow {
    #[must_use]
    pub fn new(capacity: usize, retention: Duration) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            ring: RwLock::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                mask: capacity as u64 - 1,
                unwrapper: SeqUnwrapper::new(),
                len: 0,
            }),
            retention,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.read().slots.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.read().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a packet in its slot. A packet older than the ring, or older
    /// than the one already in its slot, is not stored.
    pub fn push(&self, packet: RtpPacket, now: Instant) {
        let mut ring = self.ring.write();
        let ext = ring.unwrapper.unwrap(packet.header.sequence);
        let capacity = ring.slots.len() as u64;
        if ring.unwrapper.highest().is_some_and(|highest| ext + capacity <= highest) {
            return;
        }
        let index = (ext & ring.mask) as usize;
        match &ring.slots[index] {
            Some(entry) if entry.ext_seq > ext => return,
            Some(_) => {}
            None => ring.len += 1,
        }
        ring.slots[index] = Some(Entry {
            ext_seq: ext,
            stored_at: now,
            packet,
        });
    }

    /// Retained packet with this sequence number, if still fresh
    #[must_use]
    pub fn get(&self, seq: u16, now: Instant) -> Option<RtpPacket> {
        let ring = self.ring.read();
        let ext = ring.unwrapper.peek(seq)?;
        ring.slot(ext)
            .filter(|e| now.saturating_duration_since(e.stored_at) <= self.retention)
            .map(|e| e.packet.clone())
    }

    /// Whether `range` lies inside the retained horizon: no newer than the
    /// highest stored packet plus the ring size, and no older than the
    /// oldest packet still within retention
    #[must_use]
    pub fn covers(&self, range: SeqRange, now: Instant) -> bool {
        let ring = self.ring.read();
        let (Some(first), Some(oldest)) = (
            ring.unwrapper.peek(range.first),
            ring.oldest_fresh(now, self.retention),
        ) else {
            return false;
        };
        let last = first + u64::from(range.len()) - 1;
        first >= oldest && last < oldest + ring.slots.len() as u64
    }

    /// Drop entries older than the retention period
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut ring = self.ring.write();
        let mut evicted = 0;
        for slot in &mut ring.slots {
            if slot
                .as_ref()
                .is_some_and(|e| now.saturating_duration_since(e.stored_at) > self.retention)
            {
                *slot = None;
                evicted += 1;
            }
        }
        ring.len -= evicted;
        evicted
    }
}
