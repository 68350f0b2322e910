//! Forwarding router
//!
//! Replicates each released packet of a stream layer to every subscriber
//! forwarding that layer. Payload bytes are shared; each receiver gets its
//! own header written into a stack buffer:
//!
//! - SSRC, stable for the lifetime of the subscription
//! - Sequence number, contiguous within a layer epoch and continuing across
//!   layer switches
//! - Timestamp, continuing across switches by the wall time elapsed
//! - Transport-wide sequence number for downlink congestion feedback
//!
//! A forwarder switches layers only at the target layer's keyframe start.
//! Subscriber lists are copy-on-write snapshots, so replication never holds
//! a lock while other subscriptions are added or removed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::{RecoveryConfig, RtpExtensionConfig};
use crate::error::{SendError, SfuError, SfuResult, StaleRef};
use crate::packet::{HeaderRewrite, RtpHeader, RtpPacket};
use crate::recovery::RecoveryWindow;
use crate::seq::is_newer;
use crate::transport::srtp::SRTP_TAG_LEN;
use crate::transport::Session;
use crate::types::{LayerDescriptor, LayerId, MediaKind, SeqRange, SessionId, StreamId, SubscriptionId};
use crate::MAX_DATAGRAM;

const NO_LAYER: u16 = u16::MAX;
/// Previous layer epochs kept per forwarder for resolving NACKs
const EPOCH_HISTORY: usize = 8;
const AUDIO_CLOCK_RATE: u32 = 48_000;

/// Where a forwarder's packets go
pub trait MediaSink: Send + Sync {
    fn session_id(&self) -> SessionId;

    /// Allocate the transport-wide sequence number of the next packet
    fn next_transport_seq(&self) -> u16;

    /// Remember a stamped packet for congestion feedback matching
    fn record_sent(&self, transport_seq: u16, size: usize, now: Instant);

    /// Protect and send the plaintext packet in `buf[..len]`; `buf` has room
    /// for the authentication tag
    fn send_rtp_in_place(&self, buf: &mut [u8], len: usize) -> Result<(), SendError>;
}

impl MediaSink for Session {
    fn session_id(&self) -> SessionId {
        self.id()
    }

    fn next_transport_seq(&self) -> u16 {
        Session::next_transport_seq(self)
    }

    fn record_sent(&self, transport_seq: u16, size: usize, now: Instant) {
        self.send_history()
            .record(transport_seq, size, self.micros_since_epoch(now));
    }

    fn send_rtp_in_place(&self, buf: &mut [u8], len: usize) -> Result<(), SendError> {
        Session::send_rtp_in_place(self, buf, len)
    }
}

fn encode_layer(layer: Option<LayerId>) -> u16 {
    layer.map_or(NO_LAYER, |l| u16::from(l.as_u8()))
}

fn decode_layer(value: u16) -> Option<LayerId> {
    (value != NO_LAYER).then(|| LayerId::new(value as u8))
}

/// A contiguous run of packets forwarded from one layer
#[derive(Debug, Clone, Copy)]
struct Epoch {
    id: u32,
    layer: LayerId,
    /// outgoing = incoming + offset
    seq_offset: u16,
    ts_offset: u32,
    first_out: u16,
    last_out: u16,
    last_in: u16,
}

impl Epoch {
    fn contains_out(&self, out_seq: u16) -> bool {
        SeqRange::new(self.first_out, self.last_out).contains(out_seq)
    }
}

#[derive(Default)]
struct ForwardState {
    epoch: Option<Epoch>,
    history: VecDeque<Epoch>,
    last_out_ts: u32,
    last_sent_at: Option<Instant>,
    next_epoch_id: u32,
}

/// What happened to a packet offered to a forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Sent { switched: bool },
    /// Not the layer being forwarded
    Skipped,
    /// At or behind the last forwarded sequence number
    Stale,
    SendFailed,
}

/// An outgoing sequence number mapped back to its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSeq {
    pub layer: LayerId,
    pub in_seq: u16,
    pub out_seq: u16,
    /// Whether it belongs to the layer epoch currently forwarded
    pub current_epoch: bool,
    ts_offset: u32,
}

/// Forwarder statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForwarderStats {
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
    pub packets_skipped: u64,
    pub packets_stale: u64,
    pub send_failures: u64,
    pub layer_switches: u64,
    pub retransmissions: u64,
}

#[derive(Default)]
struct ForwarderStatsInner {
    packets_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    packets_skipped: AtomicU64,
    packets_stale: AtomicU64,
    send_failures: AtomicU64,
    layer_switches: AtomicU64,
    retransmissions: AtomicU64,
}

/// Per-subscription forwarding state
pub struct Forwarder {
    subscription_id: SubscriptionId,
    stream_id: StreamId,
    sink: Arc<dyn MediaSink>,
    out_ssrc: u32,
    clock_rate: u32,
    transport_cc_id: u8,
    /// Every packet is a switch point (audio, or an unmarked single layer)
    switch_anywhere: bool,

    /// Set by the control plane, cleared when the switch commits
    target: AtomicU16,
    /// Mirror of the current epoch's layer for lock-free reads
    current: AtomicU16,
    state: Mutex<ForwardState>,
    stats: ForwarderStatsInner,
}

impl Forwarder {
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.sink.session_id()
    }

    #[must_use]
    pub const fn out_ssrc(&self) -> u32 {
        self.out_ssrc
    }

    /// Layer being forwarded, `None` until the first switch commits
    #[must_use]
    pub fn current_layer(&self) -> Option<LayerId> {
        decode_layer(self.current.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn target_layer(&self) -> Option<LayerId> {
        decode_layer(self.target.load(Ordering::Acquire))
    }

    /// Arm (or withdraw) the layer to switch to at its next keyframe
    pub fn set_target(&self, layer: Option<LayerId>) {
        self.target.store(encode_layer(layer), Ordering::Release);
    }

    fn is_switch_point(&self, header: &RtpHeader) -> bool {
        header.is_keyframe_start() || (self.switch_anywhere && header.frame_marking.is_none())
    }

    fn elapsed_ticks(&self, since: Instant, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(since);
        (elapsed.as_micros() * u128::from(self.clock_rate) / 1_000_000).min(u128::from(u32::MAX))
            as u32
    }

    fn begin_epoch(&self, state: &mut ForwardState, layer: LayerId, header: &RtpHeader, now: Instant) {
        let out_seq = state
            .epoch
            .map_or(header.sequence, |e| e.last_out.wrapping_add(1));
        let out_ts = match state.last_sent_at {
            Some(at) => state
                .last_out_ts
                .wrapping_add(self.elapsed_ticks(at, now).max(1)),
            None => header.timestamp,
        };
        let epoch = Epoch {
            id: state.next_epoch_id,
            layer,
            seq_offset: out_seq.wrapping_sub(header.sequence),
            ts_offset: out_ts.wrapping_sub(header.timestamp),
            first_out: out_seq,
            last_out: out_seq,
            last_in: header.sequence,
        };
        state.next_epoch_id = state.next_epoch_id.wrapping_add(1);

        let previous = state.epoch.replace(epoch);
        if let Some(old) = previous {
            state.history.push_front(old);
            state.history.truncate(EPOCH_HISTORY);
        }
        self.current.store(encode_layer(Some(layer)), Ordering::Release);
        let _ = self.target.compare_exchange(
            encode_layer(Some(layer)),
            NO_LAYER,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        self.stats.layer_switches.fetch_add(1, Ordering::Relaxed);
        debug!(
            subscription_id = %self.subscription_id,
            stream_id = %self.stream_id,
            from = ?previous.map(|e| e.layer),
            to = %layer,
            first_out_seq = out_seq,
            "Layer switch committed"
        );
    }

    /// Offer one released packet of `layer`
    pub fn forward(&self, layer: LayerId, packet: &RtpPacket, now: Instant) -> ForwardOutcome {
        let header = &packet.header;
        let mut state = self.state.lock();

        let on_layer = state.epoch.is_some_and(|e| e.layer == layer);
        let switched = if on_layer {
            false
        } else if self.target.load(Ordering::Acquire) == encode_layer(Some(layer))
            && self.is_switch_point(header)
        {
            self.begin_epoch(&mut state, layer, header, now);
            true
        } else {
            self.stats.packets_skipped.fetch_add(1, Ordering::Relaxed);
            return ForwardOutcome::Skipped;
        };

        let Some(epoch) = state.epoch.as_mut() else {
            return ForwardOutcome::Skipped;
        };
        if !switched && !is_newer(header.sequence, epoch.last_in) {
            self.stats.packets_stale.fetch_add(1, Ordering::Relaxed);
            return ForwardOutcome::Stale;
        }
        let out_seq = header.sequence.wrapping_add(epoch.seq_offset);
        let out_ts = header.timestamp.wrapping_add(epoch.ts_offset);
        epoch.last_in = header.sequence;
        epoch.last_out = out_seq;
        state.last_out_ts = out_ts;
        state.last_sent_at = Some(now);

        // Sent under the lock so the wire order matches the numbering
        if self.send(packet, out_seq, out_ts, now) {
            ForwardOutcome::Sent { switched }
        } else {
            ForwardOutcome::SendFailed
        }
    }

    fn send(&self, packet: &RtpPacket, out_seq: u16, out_ts: u32, now: Instant) -> bool {
        let mut buf = [0u8; MAX_DATAGRAM];
        let transport_seq = self.sink.next_transport_seq();
        let rewrite = HeaderRewrite {
            ssrc: self.out_ssrc,
            sequence: out_seq,
            timestamp: out_ts,
            transport_seq: (self.transport_cc_id != 0).then_some((self.transport_cc_id, transport_seq)),
        };
        let Some(len) = rewrite.apply(&packet.data, &packet.header, &mut buf[..MAX_DATAGRAM - SRTP_TAG_LEN])
        else {
            self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        self.sink.record_sent(transport_seq, len, now);

        match self.sink.send_rtp_in_place(&mut buf, len) {
            Ok(()) => {
                self.stats.packets_forwarded.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_forwarded.fetch_add(len as u64, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                trace!(subscription_id = %self.subscription_id, error = %e, "Forward failed");
                false
            }
        }
    }

    /// Map an outgoing sequence number the receiver reported missing back to
    /// the layer and incoming sequence number it was forwarded from
    #[must_use]
    pub fn resolve(&self, out_seq: u16) -> Option<ResolvedSeq> {
        let state = self.state.lock();
        let current = state.epoch.map(|e| e.id);
        state
            .epoch
            .iter()
            .chain(state.history.iter())
            .find(|e| e.contains_out(out_seq))
            .map(|e| ResolvedSeq {
                layer: e.layer,
                in_seq: out_seq.wrapping_sub(e.seq_offset),
                out_seq,
                current_epoch: Some(e.id) == current,
                ts_offset: e.ts_offset,
            })
    }

    /// Resend a retained packet with the numbering it was first sent with
    pub fn retransmit(&self, resolved: &ResolvedSeq, packet: &RtpPacket, now: Instant) -> bool {
        let out_ts = packet.header.timestamp.wrapping_add(resolved.ts_offset);
        let sent = self.send(packet, resolved.out_seq, out_ts, now);
        if sent {
            self.stats.retransmissions.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    #[must_use]
    pub fn get_stats(&self) -> ForwarderStats {
        ForwarderStats {
            packets_forwarded: self.stats.packets_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.stats.bytes_forwarded.load(Ordering::Relaxed),
            packets_skipped: self.stats.packets_skipped.load(Ordering::Relaxed),
            packets_stale: self.stats.packets_stale.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
            layer_switches: self.stats.layer_switches.load(Ordering::Relaxed),
            retransmissions: self.stats.retransmissions.load(Ordering::Relaxed),
        }
    }
}

/// Routing state of one inbound stream
pub struct StreamRoute {
    stream_id: StreamId,
    kind: MediaKind,
    layers: Vec<(LayerId, Arc<RecoveryWindow>)>,
    subscribers: RwLock<Arc<Vec<Arc<Forwarder>>>>,
}

impl StreamRoute {
    #[must_use]
    pub const fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn window(&self, layer: LayerId) -> Option<&Arc<RecoveryWindow>> {
        self.layers.iter().find(|(id, _)| *id == layer).map(|(_, w)| w)
    }

    /// Current subscriber snapshot
    #[must_use]
    pub fn subscribers(&self) -> Arc<Vec<Arc<Forwarder>>> {
        Arc::clone(&self.subscribers.read())
    }

    fn update_subscribers(&self, f: impl FnOnce(&mut Vec<Arc<Forwarder>>)) {
        let mut guard = self.subscribers.write();
        let mut list = Vec::clone(&guard);
        f(&mut list);
        *guard = Arc::new(list);
    }
}

/// Router statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterStats {
    pub streams: usize,
    pub forwarders: usize,
    pub packets_routed: u64,
    pub packets_replicated: u64,
    pub send_failures: u64,
    pub unknown_stream: u64,
}

#[derive(Default)]
struct RouterStatsInner {
    packets_routed: AtomicU64,
    packets_replicated: AtomicU64,
    send_failures: AtomicU64,
    unknown_stream: AtomicU64,
}

/// Fan-out of released packets to subscriptions
pub struct Router {
    extensions: RtpExtensionConfig,
    recovery: RecoveryConfig,
    streams: DashMap<StreamId, Arc<StreamRoute>>,
    forwarders: DashMap<SubscriptionId, Arc<Forwarder>>,
    out_ssrcs: DashMap<u32, SubscriptionId>,
    stats: RouterStatsInner,
}

impl Router {
    #[must_use]
    pub fn new(extensions: RtpExtensionConfig, recovery: RecoveryConfig) -> Self {
        Self {
            extensions,
            recovery,
            streams: DashMap::new(),
            forwarders: DashMap::new(),
            out_ssrcs: DashMap::new(),
            stats: RouterStatsInner::default(),
        }
    }

    /// Start routing a stream. Each layer gets its own recovery window.
    pub fn add_stream(
        &self,
        stream_id: StreamId,
        kind: MediaKind,
        layers: &[LayerDescriptor],
    ) -> SfuResult<()> {
        match self.streams.entry(stream_id) {
            Entry::Occupied(_) => Err(SfuError::Protocol(format!(
                "stream {stream_id} is already routed"
            ))),
            Entry::Vacant(slot) => {
                let layers = layers
                    .iter()
                    .map(|l| {
                        (
                            l.layer_id,
                            Arc::new(RecoveryWindow::new(
                                self.recovery.window_capacity,
                                self.recovery.retention(),
                            )),
                        )
                    })
                    .collect();
                slot.insert(Arc::new(StreamRoute {
                    stream_id,
                    kind,
                    layers,
                    subscribers: RwLock::new(Arc::new(Vec::new())),
                }));
                Ok(())
            }
        }
    }

    /// Stop routing a stream; returns the subscriptions that were detached
    pub fn remove_stream(&self, stream_id: StreamId) -> Vec<SubscriptionId> {
        let Some((_, route)) = self.streams.remove(&stream_id) else {
            return Vec::new();
        };
        let detached: Vec<SubscriptionId> = route
            .subscribers()
            .iter()
            .map(|f| f.subscription_id())
            .collect();
        for id in &detached {
            if let Some((_, forwarder)) = self.forwarders.remove(id) {
                self.out_ssrcs.remove(&forwarder.out_ssrc());
            }
        }
        route.update_subscribers(Vec::clear);
        detached
    }

    #[must_use]
    pub fn stream(&self, stream_id: StreamId) -> Option<Arc<StreamRoute>> {
        self.streams.get(&stream_id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn window(&self, stream_id: StreamId, layer: LayerId) -> Option<Arc<RecoveryWindow>> {
        self.stream(stream_id)
            .and_then(|route| route.window(layer).cloned())
    }

    /// Create the forwarder of a new subscription
    pub fn subscribe(
        &self,
        subscription_id: SubscriptionId,
        stream_id: StreamId,
        sink: Arc<dyn MediaSink>,
    ) -> SfuResult<Arc<Forwarder>> {
        let route = self
            .stream(stream_id)
            .ok_or(SfuError::StaleState(StaleRef::Stream(stream_id)))?;

        let out_ssrc = loop {
            let candidate: u32 = rand::random();
            if candidate == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.out_ssrcs.entry(candidate) {
                slot.insert(subscription_id);
                break candidate;
            }
        };

        let (clock_rate, switch_anywhere) = match route.kind() {
            MediaKind::Audio => (AUDIO_CLOCK_RATE, true),
            MediaKind::Video => (self.extensions.video_clock_rate, route.layers.len() == 1),
        };
        let forwarder = Arc::new(Forwarder {
            subscription_id,
            stream_id,
            sink,
            out_ssrc,
            clock_rate,
            transport_cc_id: self.extensions.transport_cc_id,
            switch_anywhere,
            target: AtomicU16::new(NO_LAYER),
            current: AtomicU16::new(NO_LAYER),
            state: Mutex::new(ForwardState::default()),
            stats: ForwarderStatsInner::default(),
        });

        self.forwarders
            .insert(subscription_id, Arc::clone(&forwarder));
        route.update_subscribers(|list| list.push(Arc::clone(&forwarder)));
        debug!(
            subscription_id = %subscription_id,
            stream_id = %stream_id,
            out_ssrc,
            "Forwarder created"
        );
        Ok(forwarder)
    }

    /// Remove a subscription's forwarder. Idempotent.
    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        let Some((_, forwarder)) = self.forwarders.remove(&subscription_id) else {
            return false;
        };
        self.out_ssrcs.remove(&forwarder.out_ssrc());
        if let Some(route) = self.stream(forwarder.stream_id()) {
            route.update_subscribers(|list| list.retain(|f| f.subscription_id() != subscription_id));
        }
        true
    }

    #[must_use]
    pub fn forwarder(&self, subscription_id: SubscriptionId) -> Option<Arc<Forwarder>> {
        self.forwarders
            .get(&subscription_id)
            .map(|f| Arc::clone(f.value()))
    }

    /// Forwarder owning an outgoing SSRC, for RTCP from receivers
    #[must_use]
    pub fn forwarder_by_ssrc(&self, out_ssrc: u32) -> Option<Arc<Forwarder>> {
        let subscription_id = *self.out_ssrcs.get(&out_ssrc)?.value();
        self.forwarder(subscription_id)
    }

    /// Forwarders whose packets go to `session_id`
    #[must_use]
    pub fn forwarders_of(&self, session_id: SessionId) -> Vec<Arc<Forwarder>> {
        self.forwarders
            .iter()
            .filter(|f| f.session_id() == session_id)
            .map(|f| Arc::clone(f.value()))
            .collect()
    }

    /// Replicate one released packet of a stream layer to its subscribers.
    /// Returns how many receivers it was sent to.
    pub fn on_ready_packet(
        &self,
        stream_id: StreamId,
        layer: LayerId,
        packet: &RtpPacket,
        now: Instant,
    ) -> usize {
        let Some(route) = self.stream(stream_id) else {
            self.stats.unknown_stream.fetch_add(1, Ordering::Relaxed);
            return 0;
        };
        if let Some(window) = route.window(layer) {
            window.push(packet.clone(), now);
        }

        let subscribers = route.subscribers();
        let mut sent = 0;
        for forwarder in subscribers.iter() {
            match forwarder.forward(layer, packet, now) {
                ForwardOutcome::Sent { .. } => sent += 1,
                ForwardOutcome::SendFailed => {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                }
                ForwardOutcome::Skipped | ForwardOutcome::Stale => {}
            }
        }
        self.stats.packets_routed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .packets_replicated
            .fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Age out retained packets in every window
    pub fn evict_expired(&self, now: Instant) -> usize {
        let routes: Vec<Arc<StreamRoute>> = self.streams.iter().map(|r| Arc::clone(r.value())).collect();
        routes
            .iter()
            .flat_map(|route| route.layers.iter())
            .map(|(_, window)| window.evict_expired(now))
            .sum()
    }

    #[must_use]
    pub fn get_stats(&self) -> RouterStats {
        RouterStats {
            streams: self.streams.len(),
            forwarders: self.forwarders.len(),
            packets_routed: self.stats.packets_routed.load(Ordering::Relaxed),
            packets_replicated: self.stats.packets_replicated.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
            unknown_stream: self.stats.unknown_stream.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::packet::{FrameMarking, RtpBuilder};

    /// Captures plaintext packets instead of sending them
    #[derive(Default)]
    pub(crate) struct CaptureSink {
        pub(crate) id: SessionId,
        pub(crate) sent: Mutex<Vec<Vec<u8>>>,
        transport_seq: AtomicU32,
    }

    impl CaptureSink {
        pub(crate) fn headers(&self) -> Vec<RtpHeader> {
            self.sent
                .lock()
                .iter()
                .map(|p| RtpHeader::parse(p, &RtpExtensionConfig::default()).unwrap())
                .collect()
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

    pub(crate) fn media(ssrc: u32, seq: u16, ts: u32, keyframe: bool) -> RtpPacket {
        let ext = RtpExtensionConfig::default();
        let data = RtpBuilder::new(ssrc, seq, ts)
            .frame_marking(
                ext.frame_marking_id,
                FrameMarking {
                    start_of_frame: true,
                    independent: keyframe,
                    ..Default::default()
                },
            )
            .extension(ext.transport_cc_id, &[0, 0])
            .build(&[0xAB; 40]);
        RtpPacket {
            header: RtpHeader::parse(&data, &ext).unwrap(),
            data: Bytes::from(data),
        }
    }

    pub(crate) fn simulcast() -> Vec<LayerDescriptor> {
        (0..3u8)
            .map(|i| LayerDescriptor {
                layer_id: LayerId::new(i),
                ssrc: 100 + u32::from(i),
                target_bitrate_bps: [100_000, 400_000, 1_200_000][usize::from(i)],
                spatial_rank: i,
                temporal_rank: 0,
            })
            .collect()
    }

    fn setup() -> (Router, Arc<CaptureSink>, Arc<Forwarder>) {
        let router = Router::new(RtpExtensionConfig::default(), RecoveryConfig::default());
        let stream = StreamId::new(1);
        router.add_stream(stream, MediaKind::Video, &simulcast()).unwrap();
        let sink = Arc::new(CaptureSink::default());
        let forwarder = router
            .subscribe(SubscriptionId::new(), stream, sink.clone())
            .unwrap();
        (router, sink, forwarder)
    }

    #[test]
    fn test_nothing_forwarded_before_first_keyframe() {
        let (router, sink, forwarder) = setup();
        let now = Instant::now();
        let l0 = LayerId::new(0);
        forwarder.set_target(Some(l0));

        assert_eq!(router.on_ready_packet(StreamId::new(1), l0, &media(100, 10, 0, false), now), 0);
        assert_eq!(forwarder.current_layer(), None);
        assert_eq!(router.on_ready_packet(StreamId::new(1), l0, &media(100, 11, 0, true), now), 1);
        assert_eq!(forwarder.current_layer(), Some(l0));
        assert_eq!(forwarder.target_layer(), None);

        let headers = sink.headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].ssrc, forwarder.out_ssrc());
        assert_eq!(headers[0].transport_seq, Some(0));
    }

    #[test]
    fn test_switch_waits_for_target_keyframe() {
        let (router, sink, forwarder) = setup();
        let stream = StreamId::new(1);
        let (l0, l1) = (LayerId::new(0), LayerId::new(1));
        let t0 = Instant::now();
        forwarder.set_target(Some(l0));
        router.on_ready_packet(stream, l0, &media(100, 500, 9000, true), t0);
        router.on_ready_packet(stream, l0, &media(100, 501, 9000, false), t0);

        forwarder.set_target(Some(l1));
        // Not a keyframe: L1 stays dark, L0 keeps flowing
        router.on_ready_packet(stream, l1, &media(101, 7000, 50_000, false), t0);
        router.on_ready_packet(stream, l0, &media(100, 502, 12_000, false), t0);
        assert_eq!(forwarder.current_layer(), Some(l0));

        let t1 = t0 + Duration::from_millis(100);
        router.on_ready_packet(stream, l1, &media(101, 7001, 53_000, true), t1);
        router.on_ready_packet(stream, l0, &media(100, 503, 15_000, false), t1);
        router.on_ready_packet(stream, l1, &media(101, 7002, 53_000, false), t1);
        assert_eq!(forwarder.current_layer(), Some(l1));

        let headers = sink.headers();
        let seqs: Vec<u16> = headers.iter().map(|h| h.sequence).collect();
        assert_eq!(seqs, vec![500, 501, 502, 503, 504]);
        assert!(headers.iter().all(|h| h.ssrc == forwarder.out_ssrc()));
        // Timestamp moves on by the elapsed 100 ms at 90 kHz
        assert_eq!(headers[3].timestamp, 12_000 + 9_000);
        assert_eq!(headers[4].timestamp, headers[3].timestamp);
        assert_eq!(forwarder.get_stats().layer_switches, 2);
    }

    #[test]
    fn test_stale_packets_dropped() {
        let (router, sink, forwarder) = setup();
        let stream = StreamId::new(1);
        let l0 = LayerId::new(0);
        let now = Instant::now();
        forwarder.set_target(Some(l0));
        router.on_ready_packet(stream, l0, &media(100, 1, 0, true), now);
        router.on_ready_packet(stream, l0, &media(100, 2, 0, false), now);
        assert_eq!(forwarder.forward(l0, &media(100, 2, 0, false), now), ForwardOutcome::Stale);
        assert_eq!(forwarder.forward(l0, &media(100, 1, 0, false), now), ForwardOutcome::Stale);
        assert_eq!(sink.sent.lock().len(), 2);
    }

    #[test]
    fn test_resolve_across_epochs() {
        let (router, _sink, forwarder) = setup();
        let stream = StreamId::new(1);
        let (l0, l1) = (LayerId::new(0), LayerId::new(1));
        let now = Instant::now();
        forwarder.set_target(Some(l0));
        for seq in 10..15 {
            router.on_ready_packet(stream, l0, &media(100, seq, 0, seq == 10), now);
        }
        forwarder.set_target(Some(l1));
        router.on_ready_packet(stream, l1, &media(101, 900, 0, true), now);
        router.on_ready_packet(stream, l1, &media(101, 901, 0, false), now);

        let old = forwarder.resolve(12).unwrap();
        assert_eq!((old.layer, old.in_seq, old.current_epoch), (l0, 12, false));
        let new = forwarder.resolve(16).unwrap();
        assert_eq!((new.layer, new.in_seq, new.current_epoch), (l1, 901, true));
        assert!(forwarder.resolve(40).is_none());
    }

    #[test]
    fn test_retransmit_keeps_outgoing_numbering() {
        let (router, sink, forwarder) = setup();
        let stream = StreamId::new(1);
        let l0 = LayerId::new(0);
        let now = Instant::now();
        forwarder.set_target(Some(l0));
        for seq in 20..24 {
            router.on_ready_packet(stream, l0, &media(100, seq, 3000, seq == 20), now);
        }
        let resolved = forwarder.resolve(22).unwrap();
        let packet = router.window(stream, l0).unwrap().get(resolved.in_seq, now).unwrap();
        assert!(forwarder.retransmit(&resolved, &packet, now));

        let last = *sink.headers().last().unwrap();
        assert_eq!(last.sequence, 22);
        assert_eq!(last.ssrc, forwarder.out_ssrc());
        assert_eq!(forwarder.get_stats().retransmissions, 1);
    }

    #[test]
    fn test_unsubscribe_and_remove_stream() {
        let (router, sink, forwarder) = setup();
        let stream = StreamId::new(1);
        let ssrc = forwarder.out_ssrc();
        assert!(router.forwarder_by_ssrc(ssrc).is_some());
        assert_eq!(router.forwarders_of(sink.id).len(), 1);

        assert!(router.unsubscribe(forwarder.subscription_id()));
        assert!(!router.unsubscribe(forwarder.subscription_id()));
        assert!(router.forwarder_by_ssrc(ssrc).is_none());
        assert!(router.stream(stream).unwrap().subscribers().is_empty());

        let again = router.subscribe(SubscriptionId::new(), stream, sink).unwrap();
        assert_eq!(router.remove_stream(stream), vec![again.subscription_id()]);
        assert!(router.forwarder(again.subscription_id()).is_none());
        assert!(matches!(
            router.subscribe(SubscriptionId::new(), stream, Arc::new(CaptureSink::default())),
            Err(SfuError::StaleState(StaleRef::Stream(_)))
        ));
    }

    #[test]
    fn test_audio_switches_on_any_packet() {
        let router = Router::new(RtpExtensionConfig::default(), RecoveryConfig::default());
        let stream = StreamId::new(2);
        let layer = LayerDescriptor {
            layer_id: LayerId::new(0),
            ssrc: 7,
            target_bitrate_bps: 32_000,
            spatial_rank: 0,
            temporal_rank: 0,
        };
        router.add_stream(stream, MediaKind::Audio, &[layer]).unwrap();
        let sink = Arc::new(CaptureSink::default());
        let forwarder = router.subscribe(SubscriptionId::new(), stream, sink.clone()).unwrap();
        forwarder.set_target(Some(LayerId::new(0)));

        let data = RtpBuilder::new(7, 40, 960).build(&[1; 20]);
        let packet = RtpPacket {
            header: RtpHeader::parse(&data, &RtpExtensionConfig::default()).unwrap(),
            data: Bytes::from(data),
        };
        assert_eq!(router.on_ready_packet(stream, LayerId::new(0), &packet, Instant::now()), 1);
        // A transport-wide sequence block was inserted
        assert_eq!(sink.headers()[0].transport_seq, Some(0));
    }
}
