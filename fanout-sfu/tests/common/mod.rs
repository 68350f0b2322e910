//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use bytes::Bytes;
use fanout_sfu::config::RtpExtensionConfig;
use fanout_sfu::packet::{FrameMarking, RtpBuilder, RtpHeader, RtpPacket};
use fanout_sfu::{LayerDescriptor, LayerId, MediaSink, SendError, SessionId};
use parking_lot::Mutex;

/// Records plaintext packets instead of sending them
#[derive(Default)]
pub struct CaptureSink {
    pub id: SessionId,
    pub sent: Mutex<Vec<Vec<u8>>>,
    transport_seq: AtomicU32,
}

impl CaptureSink {
    pub fn headers(&self) -> Vec<RtpHeader> {
        self.sent
            .lock()
            .iter()
            .map(|p| RtpHeader::parse(p, &RtpExtensionConfig::default()).unwrap())
            .collect()
    }

    pub fn sequences(&self) -> Vec<u16> {
        self.headers().iter().map(|h| h.sequence).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl MediaSink for CaptureSink {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn next_transport_seq(&self) -> u16 {
        self.transport_seq.fetch_add(1, Ordering::Relaxed) as u16
    }

    fn record_sent(&self, _transport_seq: u16, _size: usize, _now: Instant) {}

    fn send_rtp_in_place(&self, buf: &mut [u8], len: usize) -> Result<(), SendError> {
        self.sent.lock().push(buf[..len].to_vec());
        Ok(())
    }
}

/// A frame-marked video packet; the payload's first byte names its layer
pub fn video(layer: u8, seq: u16, ts: u32, keyframe: bool) -> RtpPacket {
    let ext = RtpExtensionConfig::default();
    let data = RtpBuilder::new(100 + u32::from(layer), seq, ts)
        .frame_marking(
            ext.frame_marking_id,
            FrameMarking {
                start_of_frame: true,
                end_of_frame: true,
                independent: keyframe,
                ..Default::default()
            },
        )
        .extension(ext.transport_cc_id, &[0, 0])
        .build(&[layer; 32]);
    RtpPacket {
        header: RtpHeader::parse(&data, &ext).unwrap(),
        data: Bytes::from(data),
    }
}

/// Three spatial layers at 100, 400 and 1200 kbps on SSRCs 100..=102
pub fn simulcast() -> Vec<LayerDescriptor> {
    [100_000, 400_000, 1_200_000]
        .into_iter()
        .enumerate()
        .map(|(i, bps)| LayerDescriptor {
            layer_id: LayerId::new(i as u8),
            ssrc: 100 + i as u32,
            target_bitrate_bps: bps,
            spatial_rank: i as u8,
            temporal_rank: 0,
        })
        .collect()
}

/// Layer a captured packet came from, read back from its payload
pub fn payload_layer(packet: &[u8]) -> u8 {
    let header = RtpHeader::parse(packet, &RtpExtensionConfig::default()).unwrap();
    packet[header.header_len]
}
