//! SFU engine - top-level orchestration on one media socket
//!
//! This module provides:
//! - The receive pipeline, run inline by the transport's receive workers:
//!   classify, reorder, route
//! - A flush task releasing jitter-buffer holes when a stream goes quiet
//! - The control task: estimation, layer allocation, recovery deadlines,
//!   keepalive, liveness and telemetry
//! - Global statistics
//!
//! The hot path talks to the control plane only through a bounded queue;
//! when it is full, events are dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bwe::BandwidthEstimator;
use crate::config::{JitterConfig, SfuConfig};
use crate::demux::{Classified, ControlPacket, DropReason, Demuxer, MediaPacket};
use crate::error::{SfuError, SfuResult};
use crate::jitter::{InsertOutcome, JitterBuffer, Released};
use crate::packet::rtcp::{write_nack, write_pli};
use crate::packet::{RtcpItem, RtcpIter, RtpPacket};
use crate::recovery::{RecoveryAction, RecoveryCoordinator, RecoveryStats};
use crate::registry::{Components, Registry, RegistryStats};
use crate::router::{Forwarder, Router, RouterStats};
use crate::telemetry::{KeyframeReason, SessionSnapshot, TelemetryEvent, TelemetrySink};
use crate::transport::{ReceiveHandler, Session, TransportManager, TransportStats};
use crate::types::{LayerId, SeqRange, StreamId};

type LayerKey = (StreamId, LayerId);

/// Hot-path counters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineStats {
    pub media_packets: u64,
    pub rtcp_packets: u64,
    pub dropped_malformed: u64,
    pub dropped_unsupported: u64,
    /// SSRC not mapped; expected briefly around teardown
    pub dropped_unknown_stream: u64,
    /// Media on an SSRC announced by a different session
    pub dropped_foreign_session: u64,
    pub gaps: u64,
    pub late_packets: u64,
    pub duplicates: u64,
    pub packets_lost: u64,
    pub packets_released: u64,
    pub rtcp_malformed: u64,
    /// Control events dropped because the queue was full
    pub control_queue_full: u64,
    pub jitter_buffers: usize,
}

#[derive(Default)]
struct PipelineStatsInner {
    media_packets: AtomicU64,
    rtcp_packets: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_unsupported: AtomicU64,
    dropped_unknown_stream: AtomicU64,
    dropped_foreign_session: AtomicU64,
    gaps: AtomicU64,
    late_packets: AtomicU64,
    duplicates: AtomicU64,
    packets_lost: AtomicU64,
    packets_released: AtomicU64,
    rtcp_malformed: AtomicU64,
    control_queue_full: AtomicU64,
}

/// Observation handed from the hot path to the control plane
#[derive(Debug)]
enum ControlEvent {
    Gap {
        stream_id: StreamId,
        layer: LayerId,
        range: SeqRange,
    },
    Recovered {
        stream_id: StreamId,
        layer: LayerId,
        seq: u16,
    },
    Rtcp {
        session: Arc<Session>,
        packet: Bytes,
    },
}

/// Receive side of the forwarding path
struct Pipeline {
    demux: Arc<Demuxer>,
    router: Arc<Router>,
    jitter: JitterConfig,
    buffers: DashMap<LayerKey, Arc<Mutex<JitterBuffer<RtpPacket>>>>,
    control: mpsc::Sender<ControlEvent>,
    stats: PipelineStatsInner,
}

impl Pipeline {
    fn buffer(&self, key: LayerKey) -> Arc<Mutex<JitterBuffer<RtpPacket>>> {
        if let Some(buffer) = self.buffers.get(&key) {
            return Arc::clone(buffer.value());
        }
        let entry = self
            .buffers
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(JitterBuffer::new(&self.jitter))));
        Arc::clone(entry.value())
    }

    fn enqueue(&self, event: ControlEvent) {
        if self.control.try_send(event).is_err() {
            self.stats.control_queue_full.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_media(&self, media: MediaPacket, data: Bytes, now: Instant) {
        self.stats.media_packets.fetch_add(1, Ordering::Relaxed);
        let key = (media.stream_id, media.layer_id);
        let packet = RtpPacket {
            header: media.header,
            data,
        };
        let seq = packet.header.sequence;

        let buffer = self.buffer(key);
        let mut buffer = buffer.lock();
        match buffer.insert(packet.clone(), now) {
            InsertOutcome::Buffered => {}
            InsertOutcome::Gap(range) => {
                self.stats.gaps.fetch_add(1, Ordering::Relaxed);
                self.enqueue(ControlEvent::Gap {
                    stream_id: key.0,
                    layer: key.1,
                    range,
                });
            }
            InsertOutcome::Filled => self.enqueue(ControlEvent::Recovered {
                stream_id: key.0,
                layer: key.1,
                seq,
            }),
            InsertOutcome::Late => {
                // Too late to forward, still good for answering receiver NACKs
                self.stats.late_packets.fetch_add(1, Ordering::Relaxed);
                if let Some(window) = self.router.window(key.0, key.1) {
                    window.push(packet, now);
                }
                self.enqueue(ControlEvent::Recovered {
                    stream_id: key.0,
                    layer: key.1,
                    seq,
                });
            }
            InsertOutcome::Duplicate => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.release(key, &mut buffer, now);
    }

    /// Route whatever the buffer lets go of. Runs under the buffer's lock,
    /// which keeps one layer's packets in order through the router.
    fn release(&self, key: LayerKey, buffer: &mut JitterBuffer<RtpPacket>, now: Instant) {
        for released in buffer.drain(now) {
            match released {
                Released::Packet(packet) => {
                    self.stats.packets_released.fetch_add(1, Ordering::Relaxed);
                    self.router.on_ready_packet(key.0, key.1, &packet, now);
                }
                Released::Lost(range) => {
                    self.stats
                        .packets_lost
                        .fetch_add(u64::from(range.len()), Ordering::Relaxed);
                    trace!(stream_id = %key.0, layer = %key.1, lost = %range, "Hole released");
                }
            }
        }
    }

    /// Drain every buffer
    fn flush(&self, now: Instant) {
        let buffers: Vec<(LayerKey, Arc<Mutex<JitterBuffer<RtpPacket>>>)> = self
            .buffers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        for (key, buffer) in buffers {
            let mut buffer = buffer.lock();
            if !buffer.is_empty() {
                self.release(key, &mut buffer, now);
            }
        }
    }

    /// Forget buffers of streams that are no longer routed
    fn prune(&self) -> usize {
        let before = self.buffers.len();
        self.buffers
            .retain(|(stream_id, _), _| self.router.stream(*stream_id).is_some());
        before - self.buffers.len()
    }

    fn get_stats(&self) -> PipelineStats {
        PipelineStats {
            media_packets: self.stats.media_packets.load(Ordering::Relaxed),
            rtcp_packets: self.stats.rtcp_packets.load(Ordering::Relaxed),
            dropped_malformed: self.stats.dropped_malformed.load(Ordering::Relaxed),
            dropped_unsupported: self.stats.dropped_unsupported.load(Ordering::Relaxed),
            dropped_unknown_stream: self.stats.dropped_unknown_stream.load(Ordering::Relaxed),
            dropped_foreign_session: self.stats.dropped_foreign_session.load(Ordering::Relaxed),
            gaps: self.stats.gaps.load(Ordering::Relaxed),
            late_packets: self.stats.late_packets.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            packets_lost: self.stats.packets_lost.load(Ordering::Relaxed),
            packets_released: self.stats.packets_released.load(Ordering::Relaxed),
            rtcp_malformed: self.stats.rtcp_malformed.load(Ordering::Relaxed),
            control_queue_full: self.stats.control_queue_full.load(Ordering::Relaxed),
            jitter_buffers: self.buffers.len(),
        }
    }
}

impl ReceiveHandler for Pipeline {
    fn on_receive(&self, session: &Arc<Session>, packet: Bytes, now: Instant) {
        match self.demux.classify(&packet) {
            Classified::Media(media) if media.is_from(session.id()) => self.on_media(media, packet, now),
            Classified::Media(media) => {
                self.stats.dropped_foreign_session.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session_id = %session.id(),
                    owner = %media.owner,
                    stream_id = %media.stream_id,
                    ssrc = media.header.ssrc,
                    reason = DropReason::ForeignSession.as_str(),
                    "Dropped media from a session that does not own the stream"
                );
            }
            Classified::Control(ControlPacket::Rtcp(_)) => {
                self.stats.rtcp_packets.fetch_add(1, Ordering::Relaxed);
                self.enqueue(ControlEvent::Rtcp {
                    session: Arc::clone(session),
                    packet,
                });
            }
            // STUN never makes it past the transport
            Classified::Control(ControlPacket::Stun(_)) => {
                self.stats.dropped_unsupported.fetch_add(1, Ordering::Relaxed);
            }
            Classified::Unknown(reason) => {
                let counter = match reason {
                    DropReason::Malformed => &self.stats.dropped_malformed,
                    DropReason::Unsupported => &self.stats.dropped_unsupported,
                    DropReason::UnknownStream => &self.stats.dropped_unknown_stream,
                    DropReason::ForeignSession => &self.stats.dropped_foreign_session,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                trace!(session_id = %session.id(), reason = reason.as_str(), "Dropped datagram");
            }
        }
    }
}

/// Global statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SfuStats {
    pub transport: TransportStats,
    pub pipeline: PipelineStats,
    pub router: RouterStats,
    pub recovery: RecoveryStats,
    pub registry: RegistryStats,
    pub estimators: usize,
}

/// Next due times of the control plane's slower duties
struct Schedule {
    evaluation: Instant,
    keepalive: Instant,
    maintenance: Instant,
    snapshot: Instant,
}

impl Schedule {
    fn new(now: Instant) -> Self {
        Self {
            evaluation: now,
            keepalive: now,
            maintenance: now,
            snapshot: now,
        }
    }

    fn due(next: &mut Instant, every: Duration, now: Instant) -> bool {
        if now < *next {
            return false;
        }
        *next = now + every;
        true
    }
}

/// The forwarding core bound to one media socket
pub struct Sfu {
    config: SfuConfig,
    transport: Arc<TransportManager>,
    demux: Arc<Demuxer>,
    router: Arc<Router>,
    recovery: Arc<RecoveryCoordinator>,
    bwe: Arc<BandwidthEstimator>,
    registry: Arc<Registry>,
    telemetry: Arc<dyn TelemetrySink>,
    pipeline: Arc<Pipeline>,
    /// Sender SSRC of the RTCP feedback the SFU originates
    rtcp_ssrc: u32,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sfu {
    /// Bind the media socket and start the receive workers and background
    /// tasks
    pub async fn start(
        config: SfuConfig,
        telemetry: Arc<dyn TelemetrySink>,
        cancel: CancellationToken,
    ) -> SfuResult<Arc<Self>> {
        let (sfu, control) = Self::build(config, telemetry, cancel).await?;

        let mut tasks = sfu.transport.spawn_receivers(sfu.config.runtime.io_workers);
        let flush = Arc::clone(&sfu);
        tasks.push(tokio::spawn(async move { flush.flush_task().await }));
        let control_plane = Arc::clone(&sfu);
        tasks.push(tokio::spawn(async move { control_plane.control_task(control).await }));
        *sfu.tasks.lock() = tasks;

        info!(
            local_addr = %sfu.transport.local_addr(),
            io_workers = sfu.config.runtime.io_workers,
            control_interval_ms = sfu.config.runtime.control_interval_ms,
            "SFU started"
        );
        Ok(sfu)
    }

    async fn build(
        config: SfuConfig,
        telemetry: Arc<dyn TelemetrySink>,
        cancel: CancellationToken,
    ) -> SfuResult<(Arc<Self>, mpsc::Receiver<ControlEvent>)> {
        config
            .validate()
            .map_err(|errors| SfuError::Config(errors.join("; ")))?;

        let transport = TransportManager::bind(config.transport.clone(), cancel.child_token()).await?;
        let demux = Arc::new(Demuxer::new(config.rtp));
        let router = Arc::new(Router::new(config.rtp, config.recovery.clone()));
        let recovery = Arc::new(RecoveryCoordinator::new(
            config.recovery.clone(),
            Arc::clone(&router),
        ));
        let bwe = Arc::new(BandwidthEstimator::new(config.bwe.clone()));
        let registry = Arc::new(Registry::new(
            config.limits.clone(),
            config.selector.clone(),
            Components {
                transport: Arc::clone(&transport),
                demux: Arc::clone(&demux),
                router: Arc::clone(&router),
                recovery: Arc::clone(&recovery),
                bwe: Arc::clone(&bwe),
                telemetry: Arc::clone(&telemetry),
            },
        ));

        let (control_tx, control_rx) = mpsc::channel(config.runtime.control_queue_capacity);
        let pipeline = Arc::new(Pipeline {
            demux: Arc::clone(&demux),
            router: Arc::clone(&router),
            jitter: config.jitter.clone(),
            buffers: DashMap::new(),
            control: control_tx,
            stats: PipelineStatsInner::default(),
        });
        transport.on_receive(Arc::clone(&pipeline) as Arc<dyn ReceiveHandler>);

        let sfu = Arc::new(Self {
            config,
            transport,
            demux,
            router,
            recovery,
            bwe,
            registry,
            telemetry,
            pipeline,
            rtcp_ssrc: rand::random::<u32>().max(1),
            cancel,
            tasks: Mutex::new(Vec::new()),
        });
        Ok((sfu, control_rx))
    }

    #[must_use]
    pub const fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub const fn transport(&self) -> &Arc<TransportManager> {
        &self.transport
    }

    #[must_use]
    pub const fn router(&self) -> &Arc<Router> {
        &self.router
    }

    #[must_use]
    pub const fn estimator(&self) -> &Arc<BandwidthEstimator> {
        &self.bwe
    }

    #[must_use]
    pub const fn demux(&self) -> &Arc<Demuxer> {
        &self.demux
    }

    #[must_use]
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.transport.local_addr()
    }

    /// Cancel every task and wait for them to finish
    pub async fn shutdown(&self) {
        info!("Shutting down SFU");
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "SFU task ended abnormally");
            }
        }
        for session in self.registry.sessions() {
            if let Err(e) = self.registry.teardown_session(session.id()) {
                debug!(session_id = %session.id(), error = %e, "Teardown during shutdown failed");
            }
        }
        info!("SFU stopped");
    }

    async fn flush_task(self: Arc<Self>) {
        let mut ticker = interval(self.config.runtime.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(
            interval_ms = self.config.runtime.flush_interval_ms,
            "Starting jitter flush task"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.pipeline.flush(Instant::now()),
            }
        }
    }

    async fn control_task(self: Arc<Self>, mut events: mpsc::Receiver<ControlEvent>) {
        let mut ticker = interval(self.config.runtime.control_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut schedule = Schedule::new(Instant::now());
        info!(
            interval_ms = self.config.runtime.control_interval_ms,
            "Starting control task"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.control_tick(&mut schedule, Instant::now()),
                Some(event) = events.recv() => self.handle_event(event, Instant::now()),
            }
        }
        debug!("Control task stopped");
    }

    fn control_tick(&self, schedule: &mut Schedule, now: Instant) {
        if Schedule::due(&mut schedule.evaluation, self.config.bwe.evaluation_interval(), now) {
            self.bwe.evaluate(now);
        }

        for need in self.registry.allocate(now) {
            if self
                .recovery
                .request_keyframe(need.stream_id, need.layer, now)
                .is_keyframe_request()
            {
                self.send_keyframe_request(need.stream_id, need.layer, need.reason);
            }
        }

        for action in self.recovery.tick(now) {
            self.apply_recovery(action, KeyframeReason::RetransmitTimeout, now);
        }

        if Schedule::due(
            &mut schedule.keepalive,
            self.config.transport.keepalive_interval(),
            now,
        ) {
            self.transport.keepalive(now);
        }

        let liveness = self.transport.check_liveness(now);
        for session_id in liveness.expired {
            warn!(session_id = %session_id, "Tearing down unresponsive session");
            if let Err(e) = self.registry.teardown_session(session_id) {
                warn!(session_id = %session_id, error = %e, "Teardown failed");
            }
        }

        if Schedule::due(
            &mut schedule.maintenance,
            self.config.recovery.retention(),
            now,
        ) {
            let evicted = self.router.evict_expired(now);
            let pruned = self.pipeline.prune();
            if evicted > 0 || pruned > 0 {
                trace!(evicted, pruned, "Maintenance pass");
            }
        }

        if Schedule::due(
            &mut schedule.snapshot,
            self.config.runtime.telemetry_interval(),
            now,
        ) {
            self.emit_snapshots();
        }
    }

    fn handle_event(&self, event: ControlEvent, now: Instant) {
        match event {
            ControlEvent::Gap {
                stream_id,
                layer,
                range,
            } => {
                let action = self.recovery.on_gap_detected(stream_id, layer, range, now);
                self.apply_recovery(action, KeyframeReason::UnrecoverableGap, now);
            }
            ControlEvent::Recovered {
                stream_id,
                layer,
                seq,
            } => {
                self.recovery.on_packet_recovered(stream_id, layer, seq);
            }
            ControlEvent::Rtcp { session, packet } => self.handle_rtcp(&session, &packet, now),
        }
    }

    /// Forwarder sending `media_ssrc` to this session
    fn forwarder_for(&self, session: &Session, media_ssrc: u32) -> Option<Arc<Forwarder>> {
        self.router
            .forwarder_by_ssrc(media_ssrc)
            .filter(|f| f.session_id() == session.id())
    }

    fn handle_rtcp(&self, session: &Session, packet: &[u8], now: Instant) {
        for item in RtcpIter::new(packet) {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    self.pipeline.stats.rtcp_malformed.fetch_add(1, Ordering::Relaxed);
                    debug!(session_id = %session.id(), error = %e, "Malformed RTCP");
                    break;
                }
            };
            match item {
                RtcpItem::ReceiverReport { reports, .. } | RtcpItem::SenderReport { reports, .. } => {
                    let loss = reports
                        .filter(|block| self.forwarder_for(session, block.ssrc).is_some())
                        .map(|block| block.loss_ratio())
                        .reduce(f64::max);
                    if let Some(loss) = loss {
                        self.bwe.on_loss_signal(&session.id(), loss, now);
                    }
                }
                RtcpItem::Nack { media_ssrc, seqs, .. } => {
                    let Some(forwarder) = self.forwarder_for(session, media_ssrc) else {
                        continue;
                    };
                    let seqs: Vec<u16> = seqs.collect();
                    for action in self.recovery.on_recovery_request_received(
                        session.id(),
                        forwarder.subscription_id(),
                        &seqs,
                        now,
                    ) {
                        self.apply_recovery(action, KeyframeReason::ReceiverRequest, now);
                    }
                }
                RtcpItem::Pli { media_ssrc, .. } | RtcpItem::Fir { media_ssrc, .. } => {
                    let Some(forwarder) = self.forwarder_for(session, media_ssrc) else {
                        continue;
                    };
                    let action = self.recovery.on_keyframe_request_received(
                        session.id(),
                        forwarder.subscription_id(),
                        now,
                    );
                    self.apply_recovery(action, KeyframeReason::ReceiverRequest, now);
                }
                RtcpItem::TransportFeedback(feedback) => {
                    self.bwe
                        .on_transport_feedback(&session.id(), session.send_history(), &feedback, now);
                }
                RtcpItem::Other { packet_type } => {
                    trace!(session_id = %session.id(), packet_type, "Ignored RTCP packet");
                }
            }
        }
    }

    fn apply_recovery(&self, action: RecoveryAction, reason: KeyframeReason, now: Instant) {
        match action {
            RecoveryAction::Nack {
                stream_id,
                layer,
                seqs,
            } => {
                let sent = self.send_to_source(stream_id, layer, |ssrc| {
                    write_nack(self.rtcp_ssrc, ssrc, seqs.iter())
                });
                if sent {
                    debug!(stream_id = %stream_id, layer = %layer, missing = %seqs, "NACK sent");
                }
            }
            RecoveryAction::KeyframeRequest { stream_id, layer } => {
                self.send_keyframe_request(stream_id, layer, reason);
            }
            RecoveryAction::Retransmit {
                subscription_id,
                resolved,
                packet,
            } => {
                let sent = self
                    .router
                    .forwarder(subscription_id)
                    .is_some_and(|forwarder| forwarder.retransmit(&resolved, &packet, now));
                if sent {
                    self.recovery.record_retransmission();
                }
            }
            RecoveryAction::Nothing => {}
        }
    }

    fn send_keyframe_request(&self, stream_id: StreamId, layer: LayerId, reason: KeyframeReason) {
        self.send_to_source(stream_id, layer, |ssrc| write_pli(self.rtcp_ssrc, ssrc));
        self.telemetry.event(&TelemetryEvent::KeyframeRequest {
            stream_id,
            layer,
            reason,
        });
    }

    /// Send RTCP about one layer to the stream's sender
    fn send_to_source(&self, stream_id: StreamId, layer: LayerId, build: impl FnOnce(u32) -> Bytes) -> bool {
        let Some((session, ssrc)) = self.registry.layer_source(stream_id, layer) else {
            return false;
        };
        match session.send_rtcp(&build(ssrc)) {
            Ok(()) => true,
            Err(e) => {
                debug!(session_id = %session.id(), stream_id = %stream_id, error = %e, "Feedback not sent");
                false
            }
        }
    }

    fn emit_snapshots(&self) {
        for session in self.registry.sessions() {
            let estimate = self.bwe.current_estimate(&session.id());
            self.telemetry.snapshot(&SessionSnapshot {
                session_id: session.id(),
                state: session.state(),
                estimate,
                loss_ratio: estimate.map_or(0.0, |e| e.loss_ratio),
                rtt_ms: session.rtt().map(|rtt| rtt.as_secs_f64() * 1000.0),
            });
        }
    }

    #[must_use]
    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.get_stats()
    }

    #[must_use]
    pub fn get_stats(&self) -> SfuStats {
        SfuStats {
            transport: self.transport.get_stats(),
            pipeline: self.pipeline.get_stats(),
            router: self.router.get_stats(),
            recovery: self.recovery.get_stats(),
            registry: self.registry.get_stats(),
            estimators: self.bwe.session_count(),
        }
    }
}
