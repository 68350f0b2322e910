//! Per-receiver downlink bandwidth estimation
//!
//! Every forwarded packet carries a transport-wide sequence number; its send
//! time and size go into the session's [`SendHistory`]. Transport feedback
//! from the receiver yields arrival times, which are matched against the
//! history and fed to a delay-gradient detector:
//!
//! - Packets sent within a short burst form one group
//! - The inter-group delay variation is smoothed (EWMA) and fitted (trendline)
//! - The result, together with receiver-reported loss, drives an asymmetric
//!   controller: capped multiplicative increase, immediate larger decrease
//!
//! Committed estimates are published through an [`EstimateCell`] so the
//! media path can read them without taking a lock.

use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::BweConfig;
use crate::packet::TransportFeedback;
use crate::types::SessionId;

/// Direction the estimate is moving in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Trend {
    Increase = 0,
    Hold = 1,
    Decrease = 2,
}

impl Trend {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Increase,
            1 => Self::Hold,
            _ => Self::Decrease,
        }
    }
}

/// A committed bandwidth estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandwidthEstimate {
    pub bitrate_bps: u64,
    pub trend: Trend,
    /// Smoothed queuing delay growth per packet group
    pub delay_gradient_ms: f64,
    pub loss_ratio: f64,
    /// Time since the estimator was created, at commit
    #[serde(with = "duration_micros")]
    pub updated_after: Duration,
}

mod duration_micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_micros)
    }
}

// ------------------------------------------------------------------
// Send history
// ------------------------------------------------------------------

const SLOT_VALID: u64 = 1 << 63;
const SEQ_SHIFT: u32 = 47;
const SIZE_SHIFT: u32 = 35;
const SIZE_MASK: u64 = (1 << 12) - 1;
const TIME_MASK: u64 = (1 << 35) - 1;
/// Send times are stored in units of 100 microseconds
const TIME_UNIT_US: u64 = 100;

/// A packet found in the send history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentPacket {
    pub size: usize,
    /// Microseconds since the owning session's epoch
    pub sent_at_us: u64,
}

/// Lock-free ring of recently sent packets, keyed by transport-wide sequence
///
/// Each slot packs `valid | seq:16 | size:12 | time:35` into one word, so a
/// reader sees either the old entry or the new one, never a mix.
pub struct SendHistory {
    slots: Box<[AtomicU64]>,
    mask: usize,
}

impl SendHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(16, 1 << 16).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            mask: capacity - 1,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn record(&self, seq: u16, size: usize, sent_at_us: u64) {
        let word = SLOT_VALID
            | (u64::from(seq) << SEQ_SHIFT)
            | ((size as u64).min(SIZE_MASK) << SIZE_SHIFT)
            | ((sent_at_us / TIME_UNIT_US) & TIME_MASK);
        self.slots[usize::from(seq) & self.mask].store(word, Ordering::Release);
    }

    #[must_use]
    pub fn lookup(&self, seq: u16) -> Option<SentPacket> {
        let word = self.slots[usize::from(seq) & self.mask].load(Ordering::Acquire);
        if word & SLOT_VALID == 0 || ((word >> SEQ_SHIFT) & 0xFFFF) as u16 != seq {
            return None;
        }
        Some(SentPacket {
            size: ((word >> SIZE_SHIFT) & SIZE_MASK) as usize,
            sent_at_us: (word & TIME_MASK) * TIME_UNIT_US,
        })
    }
}

// ------------------------------------------------------------------
// Published estimate
// ------------------------------------------------------------------

/// Single-writer, many-reader snapshot of the latest estimate
///
/// A sequence counter brackets every write; readers retry when the counter
/// is odd or changed under them.
pub struct EstimateCell {
    version: AtomicU64,
    bitrate: AtomicU64,
    trend: AtomicU8,
    gradient: AtomicU64,
    loss: AtomicU64,
    updated_us: AtomicU64,
}

impl EstimateCell {
    #[must_use]
    pub fn new(initial: BandwidthEstimate) -> Self {
        let cell = Self {
            version: AtomicU64::new(0),
            bitrate: AtomicU64::new(0),
            trend: AtomicU8::new(0),
            gradient: AtomicU64::new(0),
            loss: AtomicU64::new(0),
            updated_us: AtomicU64::new(0),
        };
        cell.store(initial);
        cell
    }

    /// Callers must not store concurrently
    pub fn store(&self, estimate: BandwidthEstimate) {
        let version = self.version.load(Ordering::Relaxed);
        self.version.store(version.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.bitrate.store(estimate.bitrate_bps, Ordering::Relaxed);
        self.trend.store(estimate.trend as u8, Ordering::Relaxed);
        self.gradient
            .store(estimate.delay_gradient_ms.to_bits(), Ordering::Relaxed);
        self.loss.store(estimate.loss_ratio.to_bits(), Ordering::Relaxed);
        self.updated_us
            .store(estimate.updated_after.as_micros() as u64, Ordering::Relaxed);
        self.version.store(version.wrapping_add(2), Ordering::Release);
    }

    #[must_use]
    pub fn load(&self) -> BandwidthEstimate {
        loop {
            let before = self.version.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let estimate = BandwidthEstimate {
                bitrate_bps: self.bitrate.load(Ordering::Relaxed),
                trend: Trend::from_u8(self.trend.load(Ordering::Relaxed)),
                delay_gradient_ms: f64::from_bits(self.gradient.load(Ordering::Relaxed)),
                loss_ratio: f64::from_bits(self.loss.load(Ordering::Relaxed)),
                updated_after: Duration::from_micros(self.updated_us.load(Ordering::Relaxed)),
            };
            fence(Ordering::Acquire);
            if self.version.load(Ordering::Relaxed) == before {
                return estimate;
            }
        }
    }
}

// ------------------------------------------------------------------
// Delay detector and rate controller
// ------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct PacketGroup {
    first_send_us: i64,
    last_send_us: i64,
    last_arrival_us: i64,
}

struct EstimatorState {
    created_at: Instant,
    bitrate: f64,
    trend: Trend,
    current: Option<PacketGroup>,
    previous: Option<PacketGroup>,
    gradient_ms: f64,
    accumulated_ms: f64,
    smoothed_accumulated_ms: f64,
    /// (group index, smoothed accumulated delay)
    trendline: VecDeque<(f64, f64)>,
    group_count: u64,
    loss_ratio: f64,
    /// The latest loss report has not yet driven a decrease
    loss_unapplied: bool,
    last_sample_at: Option<Instant>,
    last_evaluation: Option<Instant>,
    last_decrease: Option<Instant>,
}

impl EstimatorState {
    fn new(config: &BweConfig, now: Instant) -> Self {
        Self {
            created_at: now,
            bitrate: config.initial_bitrate_bps as f64,
            trend: Trend::Hold,
            current: None,
            previous: None,
            gradient_ms: 0.0,
            accumulated_ms: 0.0,
            smoothed_accumulated_ms: 0.0,
            trendline: VecDeque::with_capacity(config.trendline_window),
            group_count: 0,
            loss_ratio: 0.0,
            loss_unapplied: false,
            last_sample_at: None,
            last_evaluation: None,
            last_decrease: None,
        }
    }

    fn on_arrival(&mut self, config: &BweConfig, send_us: i64, arrival_us: i64, now: Instant) {
        self.last_sample_at = Some(now);
        let burst_us = config.burst_interval().as_micros() as i64;

        match self.current.as_mut() {
            None => {
                self.current = Some(PacketGroup {
                    first_send_us: send_us,
                    last_send_us: send_us,
                    last_arrival_us: arrival_us,
                });
            }
            // Reordered behind the current group
            Some(group) if send_us < group.first_send_us => {}
            Some(group) if send_us - group.first_send_us <= burst_us => {
                group.last_send_us = group.last_send_us.max(send_us);
                group.last_arrival_us = group.last_arrival_us.max(arrival_us);
            }
            Some(group) => {
                let completed = *group;
                *group = PacketGroup {
                    first_send_us: send_us,
                    last_send_us: send_us,
                    last_arrival_us: arrival_us,
                };
                if let Some(previous) = self.previous.replace(completed) {
                    let send_delta = completed.last_send_us - previous.last_send_us;
                    let arrival_delta = completed.last_arrival_us - previous.last_arrival_us;
                    self.on_group_delta(config, (arrival_delta - send_delta) as f64 / 1000.0);
                }
            }
        }
    }

    fn on_group_delta(&mut self, config: &BweConfig, variation_ms: f64) {
        let alpha = config.smoothing;
        self.gradient_ms = alpha * self.gradient_ms + (1.0 - alpha) * variation_ms;
        self.accumulated_ms += variation_ms;
        self.smoothed_accumulated_ms =
            alpha * self.smoothed_accumulated_ms + (1.0 - alpha) * self.accumulated_ms;

        self.group_count += 1;
        if self.trendline.len() == config.trendline_window.max(2) {
            self.trendline.pop_front();
        }
        self.trendline
            .push_back((self.group_count as f64, self.smoothed_accumulated_ms));
    }

    /// Least-squares slope of the accumulated delay, in ms per group
    fn trend_slope(&self) -> Option<f64> {
        if self.trendline.len() < 2 {
            return None;
        }
        let n = self.trendline.len() as f64;
        let mean_x = self.trendline.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = self.trendline.iter().map(|(_, y)| y).sum::<f64>() / n;
        let (mut num, mut den) = (0.0, 0.0);
        for (x, y) in &self.trendline {
            num += (x - mean_x) * (y - mean_y);
            den += (x - mean_x) * (x - mean_x);
        }
        (den > 0.0).then(|| num / den)
    }

    fn delay_signal(&self) -> f64 {
        self.trend_slope()
            .map_or(self.gradient_ms, |slope| slope.max(self.gradient_ms))
    }

    fn can_decrease(&self, config: &BweConfig, now: Instant) -> bool {
        self.last_decrease.map_or(true, |at| {
            now.saturating_duration_since(at) >= config.min_decrease_interval()
        })
    }

    fn evaluate(&mut self, config: &BweConfig, now: Instant) -> BandwidthEstimate {
        let elapsed = self
            .last_evaluation
            .map_or(config.evaluation_interval(), |at| now.saturating_duration_since(at));
        self.last_evaluation = Some(now);

        let last_input = self.last_sample_at.unwrap_or(self.created_at);
        let starved = now.saturating_duration_since(last_input) >= config.sample_timeout();
        let signal = self.delay_signal();

        // Each loss report cuts the estimate at most once
        let heavy_loss = self.loss_unapplied && self.loss_ratio > config.loss_decrease_threshold;

        if starved {
            self.bitrate *= config.stale_decay_factor;
            self.trend = Trend::Decrease;
        } else if heavy_loss || signal > config.overuse_threshold_ms {
            if self.can_decrease(config, now) {
                let factor = if heavy_loss {
                    self.loss_unapplied = false;
                    config.decrease_factor.min(1.0 - self.loss_ratio / 2.0)
                } else {
                    config.decrease_factor
                };
                self.bitrate *= factor;
                self.last_decrease = Some(now);
            }
            self.trend = Trend::Decrease;
        } else if signal > config.hold_threshold_ms || self.loss_ratio > config.loss_increase_max {
            self.trend = Trend::Hold;
        } else {
            let intervals = (elapsed.as_secs_f64()
                / config.evaluation_interval().as_secs_f64().max(f64::EPSILON))
            .min(1.0);
            self.bitrate *= 1.0 + config.max_increase_ratio * intervals;
            self.trend = Trend::Increase;
        }

        self.bitrate = self.bitrate.clamp(
            config.min_bitrate_bps as f64,
            config.max_bitrate_bps as f64,
        );
        self.snapshot(now)
    }

    fn snapshot(&self, now: Instant) -> BandwidthEstimate {
        BandwidthEstimate {
            bitrate_bps: self.bitrate as u64,
            trend: self.trend,
            delay_gradient_ms: self.gradient_ms,
            loss_ratio: self.loss_ratio,
            updated_after: now.saturating_duration_since(self.created_at),
        }
    }
}

struct SessionEstimator {
    state: Mutex<EstimatorState>,
    published: EstimateCell,
}

/// Bandwidth estimators for all receiving sessions
///
/// Samples and evaluation come from the control plane; the media path only
/// reads published estimates.
pub struct BandwidthEstimator {
    config: BweConfig,
    sessions: DashMap<SessionId, Arc<SessionEstimator>>,
}

impl BandwidthEstimator {
    #[must_use]
    pub fn new(config: BweConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BweConfig {
        &self.config
    }

    /// Start estimating for a session. Idempotent.
    pub fn register(&self, session_id: SessionId, now: Instant) {
        self.sessions.entry(session_id).or_insert_with(|| {
            let state = EstimatorState::new(&self.config, now);
            let published = EstimateCell::new(state.snapshot(now));
            Arc::new(SessionEstimator {
                state: Mutex::new(state),
                published,
            })
        });
    }

    pub fn remove(&self, session_id: &SessionId) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn get(&self, session_id: &SessionId) -> Option<Arc<SessionEstimator>> {
        self.sessions.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    /// One packet's send and arrival times, in microseconds on the sender's
    /// and the receiver's clock respectively
    pub fn on_packet_arrival(
        &self,
        session_id: &SessionId,
        send_us: i64,
        arrival_us: i64,
        now: Instant,
    ) {
        if let Some(estimator) = self.get(session_id) {
            estimator
                .state
                .lock()
                .on_arrival(&self.config, send_us, arrival_us, now);
        }
    }

    /// Receiver-reported loss ratio in `[0, 1]`
    pub fn on_loss_signal(&self, session_id: &SessionId, loss_ratio: f64, now: Instant) {
        if let Some(estimator) = self.get(session_id) {
            let mut state = estimator.state.lock();
            state.loss_ratio = loss_ratio.clamp(0.0, 1.0);
            state.loss_unapplied = true;
            state.last_sample_at = Some(now);
        }
    }

    /// Match transport feedback against the session's send history.
    /// Returns the number of samples fed to the detector.
    pub fn on_transport_feedback(
        &self,
        session_id: &SessionId,
        history: &SendHistory,
        feedback: &TransportFeedback,
        now: Instant,
    ) -> usize {
        let Some(estimator) = self.get(session_id) else {
            return 0;
        };
        let mut state = estimator.state.lock();
        let mut matched = 0;
        for result in &feedback.results {
            let Some(arrival_us) = result.arrival_us else {
                continue;
            };
            if let Some(sent) = history.lookup(result.transport_seq) {
                state.on_arrival(&self.config, sent.sent_at_us as i64, arrival_us, now);
                matched += 1;
            }
        }
        trace!(
            session_id = %session_id,
            results = feedback.results.len(),
            matched,
            "Transport feedback"
        );
        matched
    }

    /// Latest committed estimate, lock-free
    #[must_use]
    pub fn current_estimate(&self, session_id: &SessionId) -> Option<BandwidthEstimate> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().published.load())
    }

    /// Run one control step for every session and publish the results
    pub fn evaluate(&self, now: Instant) -> Vec<(SessionId, BandwidthEstimate)> {
        let estimators: Vec<(SessionId, Arc<SessionEstimator>)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        estimators
            .into_iter()
            .map(|(session_id, estimator)| {
                let estimate = estimator.state.lock().evaluate(&self.config, now);
                let previous = estimator.published.load();
                estimator.published.store(estimate);
                if previous.trend != estimate.trend {
                    debug!(
                        session_id = %session_id,
                        bitrate_bps = estimate.bitrate_bps,
                        trend = ?estimate.trend,
                        gradient_ms = estimate.delay_gradient_ms,
                        loss = estimate.loss_ratio,
                        "Bandwidth trend changed"
                    );
                }
                (session_id, estimate)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> (BandwidthEstimator, SessionId, Instant) {
        let bwe = BandwidthEstimator::new(BweConfig::default());
        let session = SessionId::new();
        let now = Instant::now();
        bwe.register(session, now);
        (bwe, session, now)
    }

    /// Packets every 10 ms; `extra_delay_us` of queuing added per group
    fn feed(
        bwe: &BandwidthEstimator,
        session: &SessionId,
        start_us: i64,
        groups: i64,
        extra_delay_us: i64,
        now: Instant,
    ) {
        for i in 0..groups {
            let send = start_us + i * 10_000;
            let arrival = send + 20_000 + i * extra_delay_us;
            bwe.on_packet_arrival(session, send, arrival, now);
        }
    }

    #[test]
    fn test_send_history_lookup() {
        let history = SendHistory::new(64);
        history.record(10, 1200, 123_456);
        let sent = history.lookup(10).unwrap();
        assert_eq!(sent.size, 1200);
        assert_eq!(sent.sent_at_us, 123_400);
        assert!(history.lookup(11).is_none());

        // Same slot, newer sequence number
        history.record(74, 300, 200_000);
        assert!(history.lookup(10).is_none());
        assert_eq!(history.lookup(74).unwrap().size, 300);
    }

    #[test]
    fn test_estimate_cell_round_trip() {
        let estimate = BandwidthEstimate {
            bitrate_bps: 1_500_000,
            trend: Trend::Decrease,
            delay_gradient_ms: 1.25,
            loss_ratio: 0.03,
            updated_after: Duration::from_millis(250),
        };
        let cell = EstimateCell::new(estimate);
        assert_eq!(cell.load(), estimate);
    }

    #[test]
    fn test_estimate_cell_never_torn() {
        let cell = Arc::new(EstimateCell::new(BandwidthEstimate {
            bitrate_bps: 0,
            trend: Trend::Hold,
            delay_gradient_ms: 0.0,
            loss_ratio: 0.0,
            updated_after: Duration::ZERO,
        }));
        let writer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                for i in 1..20_000u64 {
                    cell.store(BandwidthEstimate {
                        bitrate_bps: i,
                        trend: Trend::Increase,
                        delay_gradient_ms: i as f64,
                        loss_ratio: 0.0,
                        updated_after: Duration::from_micros(i),
                    });
                }
            })
        };
        for _ in 0..20_000 {
            let seen = cell.load();
            assert_eq!(seen.bitrate_bps as f64, seen.delay_gradient_ms);
            assert_eq!(seen.updated_after.as_micros() as u64, seen.bitrate_bps);
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_increase_is_capped() {
        let (bwe, session, t0) = estimator();
        let initial = bwe.current_estimate(&session).unwrap().bitrate_bps;
        feed(&bwe, &session, 0, 30, 0, t0);

        let (_, estimate) = bwe.evaluate(t0 + Duration::from_millis(100))[0];
        assert_eq!(estimate.trend, Trend::Increase);
        assert!(estimate.bitrate_bps > initial);
        assert!(estimate.bitrate_bps as f64 <= initial as f64 * 1.08 + 1.0);
    }

    #[test]
    fn test_loss_forces_strict_decrease() {
        let (bwe, session, t0) = estimator();
        feed(&bwe, &session, 0, 30, 0, t0);
        let mut last = bwe.current_estimate(&session).unwrap().bitrate_bps;
        let mut decreased = 0;
        for step in 1..=6u64 {
            let now = t0 + Duration::from_millis(100 * step);
            bwe.on_loss_signal(&session, 0.10, now);
            let (_, estimate) = bwe.evaluate(now)[0];
            assert_eq!(estimate.trend, Trend::Decrease);
            assert!(estimate.bitrate_bps <= last);
            if estimate.bitrate_bps < last {
                decreased += 1;
            }
            last = estimate.bitrate_bps;
        }
        // Rate-limited to one decrease per 200 ms
        assert_eq!(decreased, 3);
    }

    #[test]
    fn test_rising_delay_decreases() {
        let (bwe, session, t0) = estimator();
        let initial = bwe.current_estimate(&session).unwrap().bitrate_bps;
        // 5 ms of additional queuing per group
        feed(&bwe, &session, 0, 40, 5_000, t0);
        let (_, estimate) = bwe.evaluate(t0 + Duration::from_millis(100))[0];
        assert_eq!(estimate.trend, Trend::Decrease);
        assert!(estimate.delay_gradient_ms > 0.0);
        assert_eq!(estimate.bitrate_bps, (initial as f64 * 0.85) as u64);
    }

    #[test]
    fn test_single_loss_report_cuts_once() {
        let (bwe, session, t0) = estimator();
        let initial = bwe.current_estimate(&session).unwrap().bitrate_bps;
        bwe.on_loss_signal(&session, 0.10, t0);

        let (_, first) = bwe.evaluate(t0 + Duration::from_millis(100))[0];
        assert_eq!(first.trend, Trend::Decrease);
        assert!(first.bitrate_bps < initial);

        // The same report keeps the estimate from growing but does not cut again
        for ms in [300, 500, 700] {
            let (_, estimate) = bwe.evaluate(t0 + Duration::from_millis(ms))[0];
            assert_eq!(estimate.trend, Trend::Hold);
            assert_eq!(estimate.bitrate_bps, first.bitrate_bps);
        }
    }

    #[test]
    fn test_moderate_loss_holds() {
        let (bwe, session, t0) = estimator();
        feed(&bwe, &session, 0, 30, 0, t0);
        bwe.on_loss_signal(&session, 0.01, t0);
        let initial = bwe.current_estimate(&session).unwrap().bitrate_bps;
        let (_, estimate) = bwe.evaluate(t0 + Duration::from_millis(100))[0];
        assert_eq!(estimate.trend, Trend::Hold);
        assert_eq!(estimate.bitrate_bps, initial);
    }

    #[test]
    fn test_starved_estimate_decays_to_floor() {
        let (bwe, session, t0) = estimator();
        let config = BweConfig::default();
        let mut now = t0 + config.sample_timeout();
        let mut last = u64::MAX;
        for _ in 0..200 {
            let (_, estimate) = bwe.evaluate(now)[0];
            assert!(estimate.bitrate_bps <= last);
            last = estimate.bitrate_bps;
            now += config.evaluation_interval();
        }
        assert_eq!(last, config.min_bitrate_bps);
    }

    #[test]
    fn test_transport_feedback_matches_history() {
        use crate::packet::TwccResult;

        let (bwe, session, t0) = estimator();
        let history = SendHistory::new(256);
        for seq in 0..10u16 {
            history.record(seq, 1000, u64::from(seq) * 10_000);
        }
        let feedback = TransportFeedback {
            sender_ssrc: 1,
            media_ssrc: 2,
            base_seq: 0,
            feedback_count: 0,
            results: (0..12u16)
                .map(|seq| TwccResult {
                    transport_seq: seq,
                    arrival_us: (seq != 3).then(|| i64::from(seq) * 10_000 + 5_000),
                })
                .collect(),
        };
        // 3 was lost, 10 and 11 were never sent
        assert_eq!(bwe.on_transport_feedback(&session, &history, &feedback, t0), 9);
    }

    #[test]
    fn test_unknown_session_is_ignored() {
        let (bwe, _, t0) = estimator();
        let other = SessionId::new();
        bwe.on_loss_signal(&other, 0.5, t0);
        assert!(bwe.current_estimate(&other).is_none());
        assert!(!bwe.remove(&other));
        assert_eq!(bwe.session_count(), 1);
    }
}
