//! SFU Configuration
//!
//! Every numeric policy of the forwarding core lives here. The estimator's
//! thresholds in particular are tuning knobs rather than fixed behaviour.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SFU configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    pub limits: LimitsConfig,
    pub transport: TransportConfig,
    pub jitter: JitterConfig,
    pub bwe: BweConfig,
    pub selector: SelectorConfig,
    pub recovery: RecoveryConfig,
    pub runtime: RuntimeConfig,
    pub rtp: RtpExtensionConfig,
}

/// Resource limits enforced by the session registry (0 = unlimited)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of concurrent rooms
    pub max_rooms: usize,
    /// Maximum participants per room
    pub max_participants_per_room: usize,
    /// Maximum subscriptions to a single stream
    pub max_subscriptions_per_stream: usize,
    /// Maximum layers a stream may announce
    pub max_layers_per_stream: usize,
    /// Transport establishment attempts made by the registry per connect
    pub connect_attempts: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_participants_per_room: 50,
            max_subscriptions_per_stream: 64,
            max_layers_per_stream: 4,
            connect_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// UDP bind address for media
    pub bind_addr: String,
    /// Maximum datagram size accepted or produced
    pub max_datagram_size: usize,
    /// Wall-clock budget for connectivity establishment
    pub connect_timeout_ms: u64,
    /// Timeout of a single candidate-pair check
    pub check_timeout_ms: u64,
    /// Upper bound on candidate pairs tried per establishment
    pub max_candidate_attempts: usize,
    /// Interval between consent/keepalive binding requests
    pub keepalive_interval_ms: u64,
    /// Silence after which a session becomes stale
    pub stale_after_ms: u64,
    /// How long a stale session lingers before the registry tears it down
    pub stale_teardown_after_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:40000".to_string(),
            max_datagram_size: 1500,
            connect_timeout_ms: 5_000,
            check_timeout_ms: 400,
            max_candidate_attempts: 8,
            keepalive_interval_ms: 2_500,
            stale_after_ms: 10_000,
            stale_teardown_after_ms: 20_000,
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    #[must_use]
    pub const fn stale_teardown_after(&self) -> Duration {
        Duration::from_millis(self.stale_teardown_after_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Slots in the reorder window; must be a power of two
    pub capacity: usize,
    /// Longest a packet waits behind a hole before the hole is declared lost
    pub max_wait_ms: u64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            max_wait_ms: 15,
        }
    }
}

impl JitterConfig {
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Delay-gradient estimator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BweConfig {
    pub initial_bitrate_bps: u64,
    pub min_bitrate_bps: u64,
    pub max_bitrate_bps: u64,
    /// Packets sent within this span form one group
    pub burst_interval_ms: u64,
    /// Groups kept for the trendline fit
    pub trendline_window: usize,
    /// EWMA weight of the previous smoothed gradient
    pub smoothing: f64,
    /// Gradient (ms per group) above which the link is considered over-used
    pub overuse_threshold_ms: f64,
    /// Gradient above which the estimate holds instead of climbing
    pub hold_threshold_ms: f64,
    /// Loss ratio above which the estimate decreases
    pub loss_decrease_threshold: f64,
    /// Loss ratio below which increase is still allowed
    pub loss_increase_max: f64,
    /// Multiplicative increase cap per evaluation interval
    pub max_increase_ratio: f64,
    /// Multiplier applied on delay-based decrease
    pub decrease_factor: f64,
    /// Minimum spacing between two decreases
    pub min_decrease_interval_ms: u64,
    /// Evaluation interval of the control loop
    pub evaluation_interval_ms: u64,
    /// No samples for this long and the estimate starts decaying
    pub sample_timeout_ms: u64,
    /// Multiplier applied per evaluation while starved of samples
    pub stale_decay_factor: f64,
}

impl Default for BweConfig {
    fn default() -> Self {
        Self {
            initial_bitrate_bps: 300_000,
            min_bitrate_bps: 30_000,
            max_bitrate_bps: 20_000_000,
            burst_interval_ms: 5,
            trendline_window: 20,
            smoothing: 0.9,
            overuse_threshold_ms: 2.0,
            hold_threshold_ms: 0.5,
            loss_decrease_threshold: 0.02,
            loss_increase_max: 0.005,
            max_increase_ratio: 0.08,
            decrease_factor: 0.85,
            min_decrease_interval_ms: 200,
            evaluation_interval_ms: 100,
            sample_timeout_ms: 1_000,
            stale_decay_factor: 0.9,
        }
    }
}

impl BweConfig {
    #[must_use]
    pub const fn burst_interval(&self) -> Duration {
        Duration::from_millis(self.burst_interval_ms)
    }

    #[must_use]
    pub const fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    #[must_use]
    pub const fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    #[must_use]
    pub const fn min_decrease_interval(&self) -> Duration {
        Duration::from_millis(self.min_decrease_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Upgrades requested within this span of the last switch are coalesced
    pub switch_cooldown_ms: u64,
    /// Deadline for the keyframe that resolves a pending switch
    pub keyframe_wait_ms: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            switch_cooldown_ms: 1_000,
            keyframe_wait_ms: 2_000,
        }
    }
}

impl SelectorConfig {
    #[must_use]
    pub const fn switch_cooldown(&self) -> Duration {
        Duration::from_millis(self.switch_cooldown_ms)
    }

    #[must_use]
    pub const fn keyframe_wait(&self) -> Duration {
        Duration::from_millis(self.keyframe_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Packets retained per stream layer; must be a power of two
    pub window_capacity: usize,
    /// Age after which retained packets are evicted
    pub retention_ms: u64,
    /// Minimum interval between keyframe requests toward one stream layer
    pub keyframe_min_interval_ms: u64,
    /// Deadline for a requested retransmission before escalating
    pub retransmit_wait_ms: u64,
    /// Largest gap answered with a retransmission request
    pub max_nack_range: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            window_capacity: 1024,
            retention_ms: 1_000,
            keyframe_min_interval_ms: 500,
            retransmit_wait_ms: 250,
            max_nack_range: 64,
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    #[must_use]
    pub const fn keyframe_min_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_min_interval_ms)
    }

    #[must_use]
    pub const fn retransmit_wait(&self) -> Duration {
        Duration::from_millis(self.retransmit_wait_ms)
    }
}

/// Scheduling of the hot path and the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Receive/forward tasks sharing the media socket
    pub io_workers: usize,
    /// Control-plane tick
    pub control_interval_ms: u64,
    /// Jitter-buffer flush tick
    pub flush_interval_ms: u64,
    /// Bounded queue between the hot path and the control plane
    pub control_queue_capacity: usize,
    /// Interval between telemetry snapshots
    pub telemetry_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            io_workers: 2,
            control_interval_ms: 20,
            flush_interval_ms: 5,
            control_queue_capacity: 4096,
            telemetry_interval_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub const fn control_interval(&self) -> Duration {
        Duration::from_millis(self.control_interval_ms)
    }

    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub const fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }
}

/// Negotiated one-byte RTP header extension ids (0 = not negotiated)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RtpExtensionConfig {
    pub frame_marking_id: u8,
    pub abs_send_time_id: u8,
    pub transport_cc_id: u8,
    /// RTP clock rate assumed for video timestamps
    pub video_clock_rate: u32,
}

impl Default for RtpExtensionConfig {
    fn default() -> Self {
        Self {
            frame_marking_id: 9,
            abs_send_time_id: 3,
            transport_cc_id: 5,
            video_clock_rate: 90_000,
        }
    }
}

impl SfuConfig {
    /// Validate configuration, collecting every problem rather than the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.jitter.capacity.is_power_of_two() {
            errors.push(format!(
                "jitter.capacity must be a power of two, got {}",
                self.jitter.capacity
            ));
        }
        if !self.recovery.window_capacity.is_power_of_two() {
            errors.push(format!(
                "recovery.window_capacity must be a power of two, got {}",
                self.recovery.window_capacity
            ));
        }
        if self.bwe.min_bitrate_bps == 0 || self.bwe.min_bitrate_bps > self.bwe.max_bitrate_bps {
            errors.push("bwe.min_bitrate_bps must be non-zero and <= bwe.max_bitrate_bps".to_string());
        }
        if !(self.bwe.min_bitrate_bps..=self.bwe.max_bitrate_bps).contains(&self.bwe.initial_bitrate_bps) {
            errors.push("bwe.initial_bitrate_bps must lie within [min, max]".to_string());
        }
        if !(0.0..1.0).contains(&self.bwe.decrease_factor) {
            errors.push("bwe.decrease_factor must be in [0, 1)".to_string());
        }
        if self.bwe.max_increase_ratio <= 0.0 || self.bwe.max_increase_ratio >= 1.0 - self.bwe.decrease_factor {
            // Slow climb, fast drop: the increase step must stay below the decrease step.
            errors.push("bwe.max_increase_ratio must be positive and smaller than 1 - decrease_factor".to_string());
        }
        if self.bwe.hold_threshold_ms >= self.bwe.overuse_threshold_ms {
            errors.push("bwe.hold_threshold_ms must be below bwe.overuse_threshold_ms".to_string());
        }
        if self.bwe.trendline_window < 2 {
            errors.push("bwe.trendline_window must be at least 2".to_string());
        }
        if self.runtime.io_workers == 0 {
            errors.push("runtime.io_workers must be at least 1".to_string());
        }
        if self.runtime.control_queue_capacity == 0 {
            errors.push("runtime.control_queue_capacity must be at least 1".to_string());
        }
        if self.transport.max_datagram_size < 256 || self.transport.max_datagram_size > crate::MAX_DATAGRAM {
            errors.push(format!(
                "transport.max_datagram_size must be within 256..={}",
                crate::MAX_DATAGRAM
            ));
        }
        if self.transport.check_timeout_ms == 0 || self.transport.check_timeout_ms > self.transport.connect_timeout_ms {
            errors.push("transport.check_timeout_ms must be non-zero and <= connect_timeout_ms".to_string());
        }
        let ids = [self.rtp.frame_marking_id, self.rtp.abs_send_time_id, self.rtp.transport_cc_id];
        if ids.iter().any(|id| *id > 14) {
            errors.push("rtp extension ids must be within 0..=14".to_string());
        }
        if self.rtp.transport_cc_id == 0 {
            errors.push("rtp.transport_cc_id is required for bandwidth estimation".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
