//! Loss recovery coordinator
//!
//! Decides between targeted retransmission and asking the sender for a
//! fresh keyframe:
//!
//! - Inbound gaps still inside the retention horizon are NACKed toward the
//!   sender; if the hole is not filled by `retransmit_wait` it escalates to a
//!   keyframe request
//! - Receiver NACKs are answered from the recovery window with the original
//!   outgoing numbering; misses and requests reaching into a previous layer
//!   escalate to a keyframe request
//! - Keyframe requests toward one stream layer are throttled

mod window;

pub use window::RecoveryWindow;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::RecoveryConfig;
use crate::error::SfuError;
use crate::packet::RtpPacket;
use crate::router::{Forwarder, ResolvedSeq, Router};
use crate::types::{LayerId, SeqRange, SessionId, StreamId, SubscriptionId};

/// What recovery wants done
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// Ask the stream's sender to retransmit
    Nack {
        stream_id: StreamId,
        layer: LayerId,
        seqs: SeqRange,
    },
    /// Ask the stream's sender for a keyframe on the layer
    KeyframeRequest { stream_id: StreamId, layer: LayerId },
    /// Resend a retained packet to a subscriber
    Retransmit {
        subscription_id: SubscriptionId,
        resolved: ResolvedSeq,
        packet: RtpPacket,
    },
    /// Throttled, already pending, or nothing to recover
    Nothing,
}

impl RecoveryAction {
    #[must_use]
    pub const fn is_keyframe_request(&self) -> bool {
        matches!(self, Self::KeyframeRequest { .. })
    }
}

type LayerKey = (StreamId, LayerId);

#[derive(Debug)]
struct PendingNack {
    range: SeqRange,
    /// Bit `i` set while `range.first + i` is still missing
    outstanding: u64,
    requested_at: Instant,
    deadline: Instant,
}

/// Recovery statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecoveryStats {
    pub nacks_sent: u64,
    pub packets_recovered: u64,
    pub retransmissions: u64,
    pub keyframe_requests: u64,
    pub keyframe_requests_throttled: u64,
    pub escalations: u64,
    pub pending_nacks: usize,
}

#[derive(Default)]
struct StatsInner {
    nacks_sent: AtomicU64,
    packets_recovered: AtomicU64,
    retransmissions: AtomicU64,
    keyframe_requests: AtomicU64,
    keyframe_requests_throttled: AtomicU64,
    escalations: AtomicU64,
}

pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    router: Arc<Router>,
    pending: Mutex<HashMap<LayerKey, Vec<PendingNack>>>,
    last_keyframe_request: DashMap<LayerKey, Instant>,
    stats: StatsInner,
}

impl RecoveryCoordinator {
    #[must_use]
    pub fn new(config: RecoveryConfig, router: Arc<Router>) -> Self {
        Self {
            config,
            router,
            pending: Mutex::new(HashMap::new()),
            last_keyframe_request: DashMap::new(),
            stats: StatsInner::default(),
        }
    }

    /// Throttled keyframe request toward a stream layer
    pub fn request_keyframe(&self, stream_id: StreamId, layer: LayerId, now: Instant) -> RecoveryAction {
        match self.last_keyframe_request.entry((stream_id, layer)) {
            Entry::Occupied(last)
                if now.saturating_duration_since(*last.get()) < self.config.keyframe_min_interval() =>
            {
                self.stats
                    .keyframe_requests_throttled
                    .fetch_add(1, Ordering::Relaxed);
                trace!(stream_id = %stream_id, layer = %layer, "Keyframe request throttled");
                return RecoveryAction::Nothing;
            }
            Entry::Occupied(mut last) => {
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        self.stats.keyframe_requests.fetch_add(1, Ordering::Relaxed);
        RecoveryAction::KeyframeRequest { stream_id, layer }
    }

    /// A hole in an inbound layer
    pub fn on_gap_detected(
        &self,
        stream_id: StreamId,
        layer: LayerId,
        range: SeqRange,
        now: Instant,
    ) -> RecoveryAction {
        let retransmittable = range.len() <= self.config.max_nack_range.min(64)
            && self
                .router
                .window(stream_id, layer)
                .is_some_and(|window| window.covers(range, now));
        if !retransmittable {
            debug!(
                stream_id = %stream_id,
                layer = %layer,
                missing = %range,
                "Gap beyond recovery horizon"
            );
            return self.request_keyframe(stream_id, layer, now);
        }

        let mut pending = self.pending.lock();
        let entries = pending.entry((stream_id, layer)).or_default();
        if entries
            .iter()
            .any(|p| p.range.contains(range.first) && p.range.contains(range.last))
        {
            return RecoveryAction::Nothing;
        }
        entries.push(PendingNack {
            range,
            outstanding: if range.len() == 64 {
                u64::MAX
            } else {
                (1u64 << range.len()) - 1
            },
            requested_at: now,
            deadline: now + self.config.retransmit_wait(),
        });
        self.stats.nacks_sent.fetch_add(1, Ordering::Relaxed);
        RecoveryAction::Nack {
            stream_id,
            layer,
            seqs: range,
        }
    }

    /// A late inbound packet; clears it from pending NACKs
    pub fn on_packet_recovered(&self, stream_id: StreamId, layer: LayerId, seq: u16) -> bool {
        let mut pending = self.pending.lock();
        let Some(entries) = pending.get_mut(&(stream_id, layer)) else {
            return false;
        };
        let mut hit = false;
        for entry in entries.iter_mut() {
            if entry.range.contains(seq) {
                entry.outstanding &= !(1u64 << seq.wrapping_sub(entry.range.first));
                hit = true;
            }
        }
        entries.retain(|p| p.outstanding != 0);
        if entries.is_empty() {
            pending.remove(&(stream_id, layer));
        }
        if hit {
            self.stats.packets_recovered.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// A receiver reported outgoing sequence numbers missing
    pub fn on_recovery_request_received(
        &self,
        receiver: SessionId,
        subscription_id: SubscriptionId,
        seqs: &[u16],
        now: Instant,
    ) -> Vec<RecoveryAction> {
        let Some(forwarder) = self
            .router
            .forwarder(subscription_id)
            .filter(|f| f.session_id() == receiver)
        else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        let mut escalate = false;
        for &out_seq in seqs {
            match self.retransmission(&forwarder, out_seq, now) {
                Some(action) => actions.push(action),
                None => escalate = true,
            }
        }
        if escalate {
            if let Some(layer) = forwarder.current_layer() {
                let action = self.request_keyframe(forwarder.stream_id(), layer, now);
                if action.is_keyframe_request() {
                    actions.push(action);
                }
            }
        }
        actions
    }

    /// A `Retransmit` action reached the receiver
    pub fn record_retransmission(&self) {
        self.stats.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    fn retransmission(&self, forwarder: &Forwarder, out_seq: u16, now: Instant) -> Option<RecoveryAction> {
        let resolved = forwarder.resolve(out_seq)?;
        if !resolved.current_epoch {
            // Would mix layers inside one coding unit
            return None;
        }
        let packet = self
            .router
            .window(forwarder.stream_id(), resolved.layer)?
            .get(resolved.in_seq, now)?;
        Some(RecoveryAction::Retransmit {
            subscription_id: forwarder.subscription_id(),
            resolved,
            packet,
        })
    }

    /// A receiver asked for a keyframe (PLI/FIR)
    pub fn on_keyframe_request_received(
        &self,
        receiver: SessionId,
        subscription_id: SubscriptionId,
        now: Instant,
    ) -> RecoveryAction {
        let Some(forwarder) = self
            .router
            .forwarder(subscription_id)
            .filter(|f| f.session_id() == receiver)
        else {
            return RecoveryAction::Nothing;
        };
        match forwarder.target_layer().or_else(|| forwarder.current_layer()) {
            Some(layer) => self.request_keyframe(forwarder.stream_id(), layer, now),
            None => RecoveryAction::Nothing,
        }
    }

    /// Escalate NACKs whose deadline passed
    pub fn tick(&self, now: Instant) -> Vec<RecoveryAction> {
        let mut expired: Vec<LayerKey> = Vec::new();
        {
            let mut pending = self.pending.lock();
            pending.retain(|key, entries| {
                entries.retain(|p| {
                    if now < p.deadline {
                        return true;
                    }
                    let error = SfuError::Timeout {
                        operation: "retransmit_wait",
                        elapsed: now.saturating_duration_since(p.requested_at),
                    };
                    debug!(
                        stream_id = %key.0,
                        layer = %key.1,
                        missing = %p.range,
                        error = %error,
                        "Retransmission did not arrive"
                    );
                    if !expired.contains(key) {
                        expired.push(*key);
                    }
                    false
                });
                !entries.is_empty()
            });
        }
        self.stats
            .escalations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired
            .into_iter()
            .map(|(stream_id, layer)| self.request_keyframe(stream_id, layer, now))
            .filter(RecoveryAction::is_keyframe_request)
            .collect()
    }

    /// Drop all pending work for a stream being torn down
    pub fn cancel_stream(&self, stream_id: StreamId) -> usize {
        let mut cancelled = 0;
        self.pending.lock().retain(|(stream, _), entries| {
            if *stream == stream_id {
                cancelled += entries.len();
                false
            } else {
                true
            }
        });
        self.last_keyframe_request
            .retain(|(stream, _), _| *stream != stream_id);
        if cancelled > 0 {
            debug!(stream_id = %stream_id, cancelled, "Pending recovery cancelled");
        }
        cancelled
    }

    #[must_use]
    pub fn get_stats(&self) -> RecoveryStats {
        RecoveryStats {
            nacks_sent: self.stats.nacks_sent.load(Ordering::Relaxed),
            packets_recovered: self.stats.packets_recovered.load(Ordering::Relaxed),
            retransmissions: self.stats.retransmissions.load(Ordering::Relaxed),
            keyframe_requests: self.stats.keyframe_requests.load(Ordering::Relaxed),
            keyframe_requests_throttled: self
                .stats
                .keyframe_requests_throttled
                .load(Ordering::Relaxed),
            escalations: self.stats.escalations.load(Ordering::Relaxed),
            pending_nacks: self.pending.lock().values().map(Vec::len).sum(),
        }
    }
}
