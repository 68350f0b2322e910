//! Modular arithmetic on 16-bit RTP sequence numbers

/// True when `a` comes after `b` in circular order.
///
/// Exactly half the sequence space is "newer"; the antipodal value
/// (distance 0x8000) counts as newer to keep the relation total.
#[inline]
#[must_use]
pub const fn is_newer(a: u16, b: u16) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff <= 0x8000
}

/// Signed distance from `b` to `a`, in the range -32768..=32767
#[inline]
#[must_use]
pub const fn distance(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

/// Extends 16-bit sequence numbers into a monotonic 64-bit space.
///
/// The first value seen anchors the space at `1 << 16` so early reordered
/// packets never underflow.
#[derive(Debug, Clone, Default)]
pub struct SeqUnwrapper {
    last: Option<u64>,
}

impl SeqUnwrapper {
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Unwrap `seq` relative to the highest value seen so far
    pub fn unwrap(&mut self, seq: u16) -> u64 {
        let Some(last) = self.last else {
            let value = (1u64 << 16) | u64::from(seq);
            self.last = Some(value);
            return value;
        };

        let delta = i64::from(distance(seq, last as u16));
        let value = (last as i64 + delta).max(0) as u64;
        if value > last {
            self.last = Some(value);
        }
        value
    }

    /// Unwrap without advancing the reference point
    #[must_use]
    pub fn peek(&self, seq: u16) -> Option<u64> {
        self.last.map(|last| {
            let delta = i64::from(distance(seq, last as u16));
            (last as i64 + delta).max(0) as u64
        })
    }

    /// Number of times the 16-bit space wrapped (the SRTP rollover counter)
    #[must_use]
    pub fn roc_of(value: u64) -> u32 {
        ((value >> 16) as u32).wrapping_sub(1)
    }

    #[must_use]
    pub const fn highest(&self) -> Option<u64> {
        self.last
    }
}
