//! RTCP compound packet reading and the few messages the SFU writes
//!
//! Reading is a lazy iterator over the compound datagram. Writers produce
//! `Bytes` since they only run on the control plane.

use bytes::{BufMut, Bytes, BytesMut};

use super::ParseError;

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_RTPFB: u8 = 205;
pub const PT_PSFB: u8 = 206;

const FMT_NACK: u8 = 1;
const FMT_TWCC: u8 = 15;
const FMT_PLI: u8 = 1;
const FMT_FIR: u8 = 4;

/// One reception report block (RFC 3550 §6.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    fn parse(data: &[u8]) -> Self {
        let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Self {
            ssrc: word(0),
            fraction_lost: data[4],
            cumulative_lost: word(4) & 0x00FF_FFFF,
            highest_seq: word(8),
            jitter: word(12),
            last_sr: word(16),
            delay_since_last_sr: word(20),
        }
    }

    /// Fraction lost as a ratio in [0, 1]
    #[must_use]
    pub fn loss_ratio(&self) -> f64 {
        f64::from(self.fraction_lost) / 256.0
    }
}

/// Report blocks of an SR or RR, read lazily
#[derive(Debug, Clone, Copy)]
pub struct ReportBlocks<'a> {
    data: &'a [u8],
}

impl Iterator for ReportBlocks<'_> {
    type Item = ReportBlock;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 24 {
            return None;
        }
        let (block, rest) = self.data.split_at(24);
        self.data = rest;
        Some(ReportBlock::parse(block))
    }
}

/// Sequence numbers listed by a generic NACK, expanded from PID/BLP pairs
#[derive(Debug, Clone, Copy)]
pub struct NackSeqs<'a> {
    pairs: &'a [u8],
    pid: u16,
    blp: u16,
    bit: u8,
}

impl<'a> NackSeqs<'a> {
    fn new(pairs: &'a [u8]) -> Self {
        Self {
            pairs,
            pid: 0,
            blp: 0,
            bit: 17,
        }
    }
}

impl Iterator for NackSeqs<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        loop {
            if self.bit <= 16 {
                let bit = self.bit;
                self.bit += 1;
                if bit == 0 {
                    return Some(self.pid);
                }
                if self.blp & (1 << (bit - 1)) != 0 {
                    return Some(self.pid.wrapping_add(u16::from(bit)));
                }
                continue;
            }
            if self.pairs.len() < 4 {
                return None;
            }
            self.pid = u16::from_be_bytes([self.pairs[0], self.pairs[1]]);
            self.blp = u16::from_be_bytes([self.pairs[2], self.pairs[3]]);
            self.pairs = &self.pairs[4..];
            self.bit = 0;
        }
    }
}

/// Per-packet result of a transport-wide feedback message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwccResult {
    pub transport_seq: u16,
    /// Arrival time in microseconds on the receiver's clock, if received
    pub arrival_us: Option<i64>,
}

/// Transport-wide congestion control feedback (RTPFB FMT 15)
#[derive(Debug, Clone)]
pub struct TransportFeedback {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub base_seq: u16,
    pub feedback_count: u8,
    pub results: Vec<TwccResult>,
}

impl TransportFeedback {
    fn parse(sender_ssrc: u32, media_ssrc: u32, fci: &[u8]) -> Result<Self, ParseError> {
        if fci.len() < 8 {
            return Err(ParseError::TooShort);
        }
        let base_seq = u16::from_be_bytes([fci[0], fci[1]]);
        let status_count = usize::from(u16::from_be_bytes([fci[2], fci[3]]));
        // 24-bit signed reference time in multiples of 64 ms
        let raw_ref = i32::from_be_bytes([fci[4], fci[5], fci[6], 0]) >> 8;
        let feedback_count = fci[7];

        let mut statuses = Vec::with_capacity(status_count);
        let mut at = 8;
        while statuses.len() < status_count {
            let chunk = fci.get(at..at + 2).ok_or(ParseError::TooShort)?;
            let chunk = u16::from_be_bytes([chunk[0], chunk[1]]);
            at += 2;
            let remaining = status_count - statuses.len();
            if chunk & 0x8000 == 0 {
                let symbol = ((chunk >> 13) & 0x03) as u8;
                let run = usize::from(chunk & 0x1FFF).min(remaining);
                statuses.resize(statuses.len() + run, symbol);
            } else if chunk & 0x4000 == 0 {
                for i in 0..14.min(remaining) {
                    statuses.push(((chunk >> (13 - i)) & 0x01) as u8);
                }
            } else {
                for i in 0..7.min(remaining) {
                    statuses.push(((chunk >> (12 - 2 * i)) & 0x03) as u8);
                }
            }
        }

        let mut arrival = i64::from(raw_ref) * 64_000;
        let mut results = Vec::with_capacity(status_count);
        for (i, symbol) in statuses.into_iter().enumerate() {
            let transport_seq = base_seq.wrapping_add(i as u16);
            let arrival_us = match symbol {
                1 => {
                    let delta = *fci.get(at).ok_or(ParseError::TooShort)?;
                    at += 1;
                    arrival += i64::from(delta) * 250;
                    Some(arrival)
                }
                2 => {
                    let bytes = fci.get(at..at + 2).ok_or(ParseError::TooShort)?;
                    at += 2;
                    arrival += i64::from(i16::from_be_bytes([bytes[0], bytes[1]])) * 250;
                    Some(arrival)
                }
                _ => None,
            };
            results.push(TwccResult {
                transport_seq,
                arrival_us,
            });
        }

        Ok(Self {
            sender_ssrc,
            media_ssrc,
            base_seq,
            feedback_count,
            results,
        })
    }
}

/// One packet of a compound RTCP datagram
#[derive(Debug, Clone)]
pub enum RtcpItem<'a> {
    SenderReport {
        ssrc: u32,
        reports: ReportBlocks<'a>,
    },
    ReceiverReport {
        ssrc: u32,
        reports: ReportBlocks<'a>,
    },
    Nack {
        sender_ssrc: u32,
        media_ssrc: u32,
        seqs: NackSeqs<'a>,
    },
    Pli {
        sender_ssrc: u32,
        media_ssrc: u32,
    },
    Fir {
        sender_ssrc: u32,
        media_ssrc: u32,
    },
    TransportFeedback(TransportFeedback),
    Other {
        packet_type: u8,
    },
}

/// Lazy iterator over a (decrypted) compound RTCP datagram.
///
/// A malformed packet yields one `Err` and ends the iteration.
#[derive(Debug, Clone)]
pub struct RtcpIter<'a> {
    data: &'a [u8],
}

impl<'a> RtcpIter<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn parse_one(&mut self) -> Result<RtcpItem<'a>, ParseError> {
        let data = self.data;
        if data.len() < 4 {
            return Err(ParseError::TooShort);
        }
        if data[0] >> 6 != 2 {
            return Err(ParseError::BadVersion);
        }
        let count = data[0] & 0x1F;
        let packet_type = data[1];
        let len = (usize::from(u16::from_be_bytes([data[2], data[3]])) + 1) * 4;
        let packet = data.get(..len).ok_or(ParseError::TooShort)?;
        self.data = &data[len..];

        let mut body = &packet[4..];
        if data[0] & 0x20 != 0 {
            let pad = usize::from(*body.last().ok_or(ParseError::BadPadding)?);
            if pad == 0 || pad > body.len() {
                return Err(ParseError::BadPadding);
            }
            body = &body[..body.len() - pad];
        }
        let word = |b: &[u8], i: usize| -> Result<u32, ParseError> {
            b.get(i..i + 4)
                .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
                .ok_or(ParseError::TooShort)
        };

        let item = match packet_type {
            PT_SR => {
                let ssrc = word(body, 0)?;
                let blocks = body.get(24..).ok_or(ParseError::TooShort)?;
                let blocks = blocks.get(..usize::from(count) * 24).ok_or(ParseError::TooShort)?;
                RtcpItem::SenderReport {
                    ssrc,
                    reports: ReportBlocks { data: blocks },
                }
            }
            PT_RR => {
                let ssrc = word(body, 0)?;
                let blocks = body.get(4..4 + usize::from(count) * 24).ok_or(ParseError::TooShort)?;
                RtcpItem::ReceiverReport {
                    ssrc,
                    reports: ReportBlocks { data: blocks },
                }
            }
            PT_RTPFB | PT_PSFB => {
                let sender_ssrc = word(body, 0)?;
                let media_ssrc = word(body, 4)?;
                let fci = &body[8..];
                match (packet_type, count) {
                    (PT_RTPFB, FMT_NACK) => RtcpItem::Nack {
                        sender_ssrc,
                        media_ssrc,
                        seqs: NackSeqs::new(fci),
                    },
                    (PT_RTPFB, FMT_TWCC) => RtcpItem::TransportFeedback(TransportFeedback::parse(
                        sender_ssrc,
                        media_ssrc,
                        fci,
                    )?),
                    (PT_PSFB, FMT_PLI) => RtcpItem::Pli {
                        sender_ssrc,
                        media_ssrc,
                    },
                    // FIR names the target SSRC inside its FCI
                    (PT_PSFB, FMT_FIR) => RtcpItem::Fir {
                        sender_ssrc,
                        media_ssrc: word(fci, 0)?,
                    },
                    _ => RtcpItem::Other { packet_type },
                }
            }
            _ => RtcpItem::Other { packet_type },
        };
        Ok(item)
    }
}

impl<'a> Iterator for RtcpIter<'a> {
    type Item = Result<RtcpItem<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let item = self.parse_one();
        if item.is_err() {
            self.data = &[];
        }
        Some(item)
    }
}

/// SSRC of the first packet of a compound RTCP datagram
#[must_use]
pub fn first_ssrc(data: &[u8]) -> Option<u32> {
    data.get(4..8).map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
}

fn put_header(buf: &mut BytesMut, count: u8, packet_type: u8, words_after_header: usize) {
    buf.put_u8(0x80 | (count & 0x1F));
    buf.put_u8(packet_type);
    buf.put_u16(words_after_header as u16);
}

/// Generic NACK for `seqs`, which must be sorted in modular order
#[must_use]
pub fn write_nack(sender_ssrc: u32, media_ssrc: u32, seqs: impl IntoIterator<Item = u16>) -> Bytes {
    let mut pairs: Vec<(u16, u16)> = Vec::new();
    for seq in seqs {
        match pairs.last_mut() {
            Some((pid, blp)) if (1..=16).contains(&seq.wrapping_sub(*pid)) => {
                *blp |= 1 << (seq.wrapping_sub(*pid) - 1);
            }
            Some((pid, _)) if *pid == seq => {}
            _ => pairs.push((seq, 0)),
        }
    }

    let mut buf = BytesMut::with_capacity(12 + pairs.len() * 4);
    put_header(&mut buf, FMT_NACK, PT_RTPFB, 2 + pairs.len());
    buf.put_u32(sender_ssrc);
    buf.put_u32(media_ssrc);
    for (pid, blp) in pairs {
        buf.put_u16(pid);
        buf.put_u16(blp);
    }
    buf.freeze()
}

/// Picture loss indication, the keyframe request
#[must_use]
pub fn write_pli(sender_ssrc: u32, media_ssrc: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    put_header(&mut buf, FMT_PLI, PT_PSFB, 2);
    buf.put_u32(sender_ssrc);
    buf.put_u32(media_ssrc);
    buf.freeze()
}

/// Receiver report with a single block, used in tests and by the keepalive path
#[must_use]
pub fn write_receiver_report(ssrc: u32, block: &ReportBlock) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    put_header(&mut buf, 1, PT_RR, 7);
    buf.put_u32(ssrc);
    buf.put_u32(block.ssrc);
    buf.put_u32((u32::from(block.fraction_lost) << 24) | (block.cumulative_lost & 0x00FF_FFFF));
    buf.put_u32(block.highest_seq);
    buf.put_u32(block.jitter);
    buf.put_u32(block.last_sr);
    buf.put_u32(block.delay_since_last_sr);
    buf.freeze()
}
