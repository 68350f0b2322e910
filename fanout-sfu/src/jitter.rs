//! Jitter & reorder buffer
//!
//! A fixed-capacity window keyed by the unwrapped sequence number. Packets
//! leave in sequence order, either because the next expected one is present
//! or because the packets waiting behind a hole have waited long enough, in
//! which case the hole is reported lost. Loss handling itself happens
//! elsewhere; this buffer never waits twice for the same hole.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::JitterConfig;
use crate::packet::RtpPacket;
use crate::seq::SeqUnwrapper;
use crate::types::SeqRange;

/// Anything with an RTP sequence number
pub trait Sequenced {
    fn sequence(&self) -> u16;
}

impl Sequenced for RtpPacket {
    fn sequence(&self) -> u16 {
        self.header.sequence
    }
}

/// What happened to an inserted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Buffered,
    /// Buffered, and it revealed missing sequence numbers before it
    Gap(SeqRange),
    /// Buffered into a hole behind the highest sequence seen
    Filled,
    /// Behind the release point: a late arrival or retransmission
    Late,
    Duplicate,
}

/// Output of a drain cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released<T> {
    Packet(T),
    /// Sequence numbers given up on
    Lost(SeqRange),
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub buffered: usize,
    pub released: u64,
    pub lost: u64,
    pub late: u64,
    pub duplicates: u64,
}

struct Slot<T> {
    ext_seq: u64,
    arrival: Instant,
    item: T,
}

pub struct JitterBuffer<T> {
    slots: Vec<Option<Slot<T>>>,
    mask: u64,
    max_wait: Duration,
    unwrapper: SeqUnwrapper,
    /// Next sequence number to release
    next: Option<u64>,
    highest: Option<u64>,
    /// Everything below this is released without waiting (window overrun)
    flush_before: u64,
    /// Released ahead of the slots by an overrun that collided with a
    /// buffered packet
    overflow: VecDeque<Released<T>>,
    stats: JitterStats,
}

impl<T: Sequenced> JitterBuffer<T> {
    /// `config.capacity` must be a power of two; it is rounded up otherwise
    #[must_use]
    pub fn new(config: &JitterConfig) -> Self {
        let capacity = config.capacity.max(2).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            mask: capacity as u64 - 1,
            max_wait: config.max_wait(),
            unwrapper: SeqUnwrapper::new(),
            next: None,
            highest: None,
            flush_before: 0,
            overflow: VecDeque::new(),
            stats: JitterStats::default(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.stats.buffered
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.buffered == 0 && self.overflow.is_empty()
    }

    /// Sequence number the next release will carry
    #[must_use]
    pub fn next_expected(&self) -> Option<u16> {
        self.next.map(|n| n as u16)
    }

    #[must_use]
    pub fn stats(&self) -> JitterStats {
        self.stats.clone()
    }

    pub fn insert(&mut self, item: T, now: Instant) -> InsertOutcome {
        let ext = self.unwrapper.unwrap(item.sequence());
        let next = *self.next.get_or_insert(ext);
        if ext < next {
            self.stats.late += 1;
            return InsertOutcome::Late;
        }

        let index = (ext & self.mask) as usize;
        if self.slots[index].as_ref().is_some_and(|slot| slot.ext_seq == ext) {
            self.stats.duplicates += 1;
            return InsertOutcome::Duplicate;
        }

        let capacity = self.slots.len() as u64;
        if ext >= next + capacity {
            // Whatever still sits in the way has to go out without waiting
            self.flush_before = self.flush_before.max(ext + 1 - capacity);
            if self.slots[index].is_some() {
                self.release_below(ext + 1 - capacity);
            }
        }

        let outcome = match self.highest {
            Some(highest) if ext > highest + 1 => {
                InsertOutcome::Gap(SeqRange::new((highest + 1) as u16, (ext - 1) as u16))
            }
            Some(highest) if ext < highest => InsertOutcome::Filled,
            _ => InsertOutcome::Buffered,
        };
        if self.highest.map_or(true, |highest| ext > highest) {
            self.highest = Some(ext);
        }

        self.slots[index] = Some(Slot {
            ext_seq: ext,
            arrival: now,
            item,
        });
        self.stats.buffered += 1;
        outcome
    }

    /// Move everything below `until` to the overflow queue in sequence
    /// order, reporting the holes between buffered packets as lost. Only
    /// reached when the window is overrun before a drain cycle could run.
    fn release_below(&mut self, until: u64) {
        let Some(mut next) = self.next else {
            return;
        };
        let mut held: Vec<u64> = self
            .slots
            .iter()
            .flatten()
            .map(|slot| slot.ext_seq)
            .filter(|&ext| ext >= next && ext < until)
            .collect();
        held.sort_unstable();

        for ext in held {
            if ext > next {
                self.push_lost(next, ext);
            }
            if let Some(item) = self.take_if_present(ext) {
                self.overflow.push_back(Released::Packet(item));
            }
            next = ext + 1;
        }
        if until > next {
            self.push_lost(next, until);
            next = until;
        }
        self.next = Some(next);
    }

    fn push_lost(&mut self, from: u64, to: u64) {
        self.stats.lost += to - from;
        self.overflow
            .push_back(Released::Lost(SeqRange::new(from as u16, (to - 1) as u16)));
    }

    /// Release everything that is ready at `now`
    pub fn drain(&mut self, now: Instant) -> Drain<'_, T> {
        Drain { buffer: self, now }
    }

    fn take_if_present(&mut self, ext: u64) -> Option<T> {
        let index = (ext & self.mask) as usize;
        if self.slots[index].as_ref().is_some_and(|slot| slot.ext_seq == ext) {
            let slot = self.slots[index].take()?;
            self.stats.buffered -= 1;
            self.stats.released += 1;
            return Some(slot.item);
        }
        None
    }

    /// Earliest buffered sequence after `from` and the oldest arrival among
    /// the packets waiting
    fn scan_waiting(&self, from: u64) -> Option<(u64, Instant)> {
        let highest = self.highest?;
        // Slots only ever hold the last `capacity` sequence numbers
        let start = from.max((highest + 1).saturating_sub(self.slots.len() as u64));
        let mut first = None;
        let mut oldest: Option<Instant> = None;
        for ext in start..=highest {
            if let Some(slot) = &self.slots[(ext & self.mask) as usize] {
                if slot.ext_seq == ext {
                    first.get_or_insert(ext);
                    oldest = Some(oldest.map_or(slot.arrival, |o| o.min(slot.arrival)));
                }
            }
        }
        first.zip(oldest)
    }

    fn next_release(&mut self, now: Instant) -> Option<Released<T>> {
        if let Some(released) = self.overflow.pop_front() {
            return Some(released);
        }
        if self.stats.buffered == 0 {
            return None;
        }
        let next = self.next?;
        if let Some(item) = self.take_if_present(next) {
            self.next = Some(next + 1);
            return Some(Released::Packet(item));
        }

        let (first, oldest) = self.scan_waiting(next + 1)?;
        let overrun = next < self.flush_before;
        if !overrun && now.saturating_duration_since(oldest) < self.max_wait {
            return None;
        }
        let hole = SeqRange::new(next as u16, (first - 1) as u16);
        self.stats.lost += first - next;
        self.next = Some(first);
        Some(Released::Lost(hole))
    }
}

/// Lazy, finite release sequence of one drain cycle
pub struct Drain<'a, T: Sequenced> {
    buffer: &'a mut JitterBuffer<T>,
    now: Instant,
}

impl<T: Sequenced> Iterator for Drain<'_, T> {
    type Item = Released<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buffer.next_release(self.now)
    }
}
