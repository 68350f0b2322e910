//! RTP header parsing and in-place rewriting (RFC 3550, RFC 8285)
//!
//! Parsing never allocates: every accessor reads from the borrowed datagram
//! and the result is a small `Copy` summary the rest of the pipeline passes
//! around next to the packet bytes.

use super::ParseError;
use crate::config::RtpExtensionConfig;

pub const RTP_VERSION: u8 = 2;
pub const RTP_FIXED_HEADER_LEN: usize = 12;

const ONE_BYTE_PROFILE: u16 = 0xBEDE;

/// Frame marking header extension (one-byte form)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMarking {
    pub start_of_frame: bool,
    pub end_of_frame: bool,
    /// Frame decodable without references (keyframe)
    pub independent: bool,
    pub discardable: bool,
    pub base_layer_sync: bool,
    pub temporal_id: u8,
    pub layer_id: Option<u8>,
}

impl FrameMarking {
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        let first = *data.first()?;
        Some(Self {
            start_of_frame: first & 0x80 != 0,
            end_of_frame: first & 0x40 != 0,
            independent: first & 0x20 != 0,
            discardable: first & 0x10 != 0,
            base_layer_sync: first & 0x08 != 0,
            temporal_id: first & 0x07,
            layer_id: data.get(1).copied(),
        })
    }

    /// First packet of a keyframe: the only point where a decoder can join
    #[must_use]
    pub const fn is_keyframe_start(&self) -> bool {
        self.independent && self.start_of_frame
    }

    #[must_use]
    pub const fn to_byte(&self) -> u8 {
        (self.start_of_frame as u8) << 7
            | (self.end_of_frame as u8) << 6
            | (self.independent as u8) << 5
            | (self.discardable as u8) << 4
            | (self.base_layer_sync as u8) << 3
            | (self.temporal_id & 0x07)
    }
}

/// Parsed view of an RTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Offset of the payload (end of fixed header, CSRCs and extensions)
    pub header_len: usize,
    /// Payload length, padding excluded
    pub payload_len: usize,
    pub has_extension: bool,
    pub frame_marking: Option<FrameMarking>,
    /// 24-bit 6.18 fixed-point seconds
    pub abs_send_time: Option<u32>,
    pub transport_seq: Option<u16>,
    /// Offset of the transport-wide sequence number bytes, for rewriting
    pub transport_seq_offset: Option<usize>,
}

impl RtpHeader {
    /// Parse the header of a (decrypted) RTP packet
    pub fn parse(data: &[u8], extensions: &RtpExtensionConfig) -> Result<Self, ParseError> {
        if data.len() < RTP_FIXED_HEADER_LEN {
            return Err(ParseError::TooShort);
        }
        let first = data[0];
        if first >> 6 != RTP_VERSION {
            return Err(ParseError::BadVersion);
        }
        let padding = first & 0x20 != 0;
        let has_extension = first & 0x10 != 0;
        let csrc_count = usize::from(first & 0x0F);

        let mut header = Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            header_len: RTP_FIXED_HEADER_LEN + csrc_count * 4,
            payload_len: 0,
            has_extension,
            frame_marking: None,
            abs_send_time: None,
            transport_seq: None,
            transport_seq_offset: None,
        };
        if data.len() < header.header_len {
            return Err(ParseError::TooShort);
        }

        if has_extension {
            let at = header.header_len;
            let ext_header = data.get(at..at + 4).ok_or(ParseError::TooShort)?;
            let profile = u16::from_be_bytes([ext_header[0], ext_header[1]]);
            let words = usize::from(u16::from_be_bytes([ext_header[2], ext_header[3]]));
            let body_start = at + 4;
            let body_end = body_start + words * 4;
            let body = data.get(body_start..body_end).ok_or(ParseError::BadExtension)?;
            if profile == ONE_BYTE_PROFILE {
                header.parse_one_byte_elements(body, body_start, extensions)?;
            }
            header.header_len = body_end;
        }

        let mut end = data.len();
        if padding {
            let pad = usize::from(data[end - 1]);
            if pad == 0 || pad > end - header.header_len {
                return Err(ParseError::BadPadding);
            }
            end -= pad;
        }
        header.payload_len = end - header.header_len;
        Ok(header)
    }

    fn parse_one_byte_elements(
        &mut self,
        body: &[u8],
        body_offset: usize,
        extensions: &RtpExtensionConfig,
    ) -> Result<(), ParseError> {
        let mut i = 0;
        while i < body.len() {
            let id = body[i] >> 4;
            if id == 0 {
                i += 1;
                continue;
            }
            if id == 15 {
                break;
            }
            let len = usize::from(body[i] & 0x0F) + 1;
            let value = body.get(i + 1..i + 1 + len).ok_or(ParseError::BadExtension)?;

            if id == extensions.frame_marking_id {
                self.frame_marking = FrameMarking::parse(value);
            } else if id == extensions.abs_send_time_id && len == 3 {
                self.abs_send_time = Some(u32::from_be_bytes([0, value[0], value[1], value[2]]));
            } else if id == extensions.transport_cc_id && len == 2 {
                self.transport_seq = Some(u16::from_be_bytes([value[0], value[1]]));
                self.transport_seq_offset = Some(body_offset + i + 1);
            }
            i += 1 + len;
        }
        Ok(())
    }

    /// Keyframe boundary, judged from frame marking
    #[must_use]
    pub fn is_keyframe_start(&self) -> bool {
        self.frame_marking.is_some_and(|fm| fm.is_keyframe_start())
    }
}

/// Length of the RTP header (fixed part, CSRCs, extension block) without
/// looking at the payload, which may still be encrypted
pub fn header_len(data: &[u8]) -> Result<usize, ParseError> {
    if data.len() < RTP_FIXED_HEADER_LEN {
        return Err(ParseError::TooShort);
    }
    let mut len = RTP_FIXED_HEADER_LEN + usize::from(data[0] & 0x0F) * 4;
    if data[0] & 0x10 != 0 {
        let ext = data.get(len..len + 4).ok_or(ParseError::TooShort)?;
        len += 4 + usize::from(u16::from_be_bytes([ext[2], ext[3]])) * 4;
    }
    if len > data.len() {
        return Err(ParseError::TooShort);
    }
    Ok(len)
}

/// Convert an abs-send-time value to microseconds within its 64 s cycle
#[must_use]
pub fn abs_send_time_to_micros(value: u32) -> u64 {
    (u64::from(value & 0x00FF_FFFF) * 1_000_000) >> 18
}

/// Rewrites the per-receiver fields of an RTP header in `buf`.
///
/// `buf` holds a copy of the original packet. When the original carried no
/// header extension at all a one-byte extension block carrying only the
/// transport-wide sequence number is inserted after the CSRC list; the
/// returned length accounts for it.
pub struct HeaderRewrite {
    pub ssrc: u32,
    pub sequence: u16,
    pub timestamp: u32,
    pub transport_seq: Option<(u8, u16)>,
}

impl HeaderRewrite {
    /// Write `original` into `out` with rewritten header fields.
    ///
    /// Returns the number of bytes written, or `None` if `out` is too small.
    #[must_use]
    pub fn apply(&self, original: &[u8], header: &RtpHeader, out: &mut [u8]) -> Option<usize> {
        let insert_ext = !header.has_extension && self.transport_seq.is_some();
        let extra = if insert_ext { 8 } else { 0 };
        let total = original.len() + extra;
        if out.len() < total {
            return None;
        }

        if insert_ext {
            let fixed = header.header_len;
            out[..fixed].copy_from_slice(&original[..fixed]);
            out[0] |= 0x10;
            let (id, seq) = self.transport_seq?;
            let seq = seq.to_be_bytes();
            out[fixed..fixed + 8].copy_from_slice(&[
                0xBE,
                0xDE,
                0x00,
                0x01,
                (id << 4) | 0x01,
                seq[0],
                seq[1],
                0x00,
            ]);
            out[fixed + 8..total].copy_from_slice(&original[fixed..]);
        } else {
            out[..total].copy_from_slice(original);
            if let (Some((_, seq)), Some(offset)) = (self.transport_seq, header.transport_seq_offset) {
                out[offset..offset + 2].copy_from_slice(&seq.to_be_bytes());
            }
        }

        out[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        Some(total)
    }
}

/// Minimal RTP packet writer used by tests and tools
#[derive(Debug, Clone, Default)]
pub struct RtpBuilder {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// One-byte extension elements as (id, value)
    pub extensions: Vec<(u8, Vec<u8>)>,
}

impl RtpBuilder {
    #[must_use]
    pub fn new(ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            payload_type: 96,
            ssrc,
            sequence,
            timestamp,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn extension(mut self, id: u8, value: &[u8]) -> Self {
        self.extensions.push((id, value.to_vec()));
        self
    }

    #[must_use]
    pub fn frame_marking(self, id: u8, marking: FrameMarking) -> Self {
        self.extension(id, &[marking.to_byte()])
    }

    #[must_use]
    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(RTP_FIXED_HEADER_LEN + 16 + payload.len());
        let x = if self.extensions.is_empty() { 0 } else { 0x10 };
        out.push(0x80 | x);
        out.push((u8::from(self.marker) << 7) | (self.payload_type & 0x7F));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());

        if !self.extensions.is_empty() {
            let mut body = Vec::new();
            for (id, value) in &self.extensions {
                body.push((id << 4) | ((value.len() as u8).saturating_sub(1) & 0x0F));
                body.extend_from_slice(value);
            }
            while body.len() % 4 != 0 {
                body.push(0);
            }
            out.extend_from_slice(&ONE_BYTE_PROFILE.to_be_bytes());
            out.extend_from_slice(&((body.len() / 4) as u16).to_be_bytes());
            out.extend_from_slice(&body);
        }

        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext() -> RtpExtensionConfig {
        RtpExtensionConfig::default()
    }

    #[test]
    fn test_parse_plain_header() {
        let data = RtpBuilder::new(0x1234_5678, 4242, 90_000).build(&[1, 2, 3]);
        let header = RtpHeader::parse(&data, &ext()).unwrap();
        assert_eq!(header.ssrc, 0x1234_5678);
        assert_eq!(header.sequence, 4242);
        assert_eq!(header.timestamp, 90_000);
        assert_eq!(header.header_len, 12);
        assert_eq!(header.payload_len, 3);
        assert!(header.frame_marking.is_none());
    }

    #[test]
    fn test_parse_extensions() {
        let config = ext();
        let marking = FrameMarking {
            start_of_frame: true,
            independent: true,
            temporal_id: 2,
            ..Default::default()
        };
        let data = RtpBuilder::new(1, 7, 0)
            .frame_marking(config.frame_marking_id, marking)
            .extension(config.abs_send_time_id, &[0x04, 0x00, 0x00])
            .extension(config.transport_cc_id, &[0x01, 0x02])
            .build(&[0xAA; 10]);

        let header = RtpHeader::parse(&data, &config).unwrap();
        assert!(header.is_keyframe_start());
        assert_eq!(header.frame_marking.unwrap().temporal_id, 2);
        assert_eq!(header.abs_send_time, Some(0x04_0000));
        assert_eq!(abs_send_time_to_micros(0x04_0000), 1_000_000);
        assert_eq!(header.transport_seq, Some(0x0102));
        assert_eq!(header.payload_len, 10);
        let offset = header.transport_seq_offset.unwrap();
        assert_eq!(&data[offset..offset + 2], &[0x01, 0x02]);
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(RtpHeader::parse(&[0x80; 8], &ext()), Err(ParseError::TooShort));

        let mut data = RtpBuilder::new(1, 1, 1).build(&[0; 4]);
        data[0] = 0x40;
        assert_eq!(RtpHeader::parse(&data, &ext()), Err(ParseError::BadVersion));

        // Extension flag set but no extension header present
        let mut data = RtpBuilder::new(1, 1, 1).build(&[]);
        data[0] |= 0x10;
        assert_eq!(RtpHeader::parse(&data, &ext()), Err(ParseError::TooShort));
    }

    #[test]
    fn test_padding_is_excluded() {
        let mut data = RtpBuilder::new(1, 1, 1).build(&[9, 9, 0, 0, 3]);
        data[0] |= 0x20;
        let header = RtpHeader::parse(&data, &ext()).unwrap();
        assert_eq!(header.payload_len, 2);
    }

    #[test]
    fn test_rewrite_inserts_transport_seq() {
        let config = ext();
        let original = RtpBuilder::new(1, 100, 5000).build(&[7, 8, 9]);
        let header = RtpHeader::parse(&original, &config).unwrap();

        let rewrite = HeaderRewrite {
            ssrc: 0xDEAD_BEEF,
            sequence: 1,
            timestamp: 42,
            transport_seq: Some((config.transport_cc_id, 777)),
        };
        let mut out = [0u8; 64];
        let len = rewrite.apply(&original, &header, &mut out).unwrap();
        assert_eq!(len, original.len() + 8);

        let rewritten = RtpHeader::parse(&out[..len], &config).unwrap();
        assert_eq!(rewritten.ssrc, 0xDEAD_BEEF);
        assert_eq!(rewritten.sequence, 1);
        assert_eq!(rewritten.timestamp, 42);
        assert_eq!(rewritten.transport_seq, Some(777));
        assert_eq!(&out[rewritten.header_len..len], &[7, 8, 9]);
    }

    #[test]
    fn test_rewrite_overwrites_existing_transport_seq() {
        let config = ext();
        let original = RtpBuilder::new(1, 100, 5000)
            .extension(config.transport_cc_id, &[0, 5])
            .build(&[1]);
        let header = RtpHeader::parse(&original, &config).unwrap();
        let rewrite = HeaderRewrite {
            ssrc: 2,
            sequence: 3,
            timestamp: 4,
            transport_seq: Some((config.transport_cc_id, 300)),
        };
        let mut out = [0u8; 64];
        let len = rewrite.apply(&original, &header, &mut out).unwrap();
        assert_eq!(len, original.len());
        let rewritten = RtpHeader::parse(&out[..len], &config).unwrap();
        assert_eq!(rewritten.transport_seq, Some(300));
    }
}
