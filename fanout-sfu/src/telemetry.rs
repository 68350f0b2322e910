//! Telemetry hooks
//!
//! The core reports periodic per-session snapshots and discrete events to a
//! [`TelemetrySink`]. [`TracingTelemetry`] writes them as structured log
//! records; other sinks (metrics exporters) live with the embedding process.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bwe::BandwidthEstimate;
use crate::transport::SessionState;
use crate::types::{LayerId, SessionId, StreamId, SubscriptionId};

/// Periodic per-session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub estimate: Option<BandwidthEstimate>,
    pub loss_ratio: f64,
    pub rtt_ms: Option<f64>,
}

impl SessionSnapshot {
    #[must_use]
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt_ms.map(|ms| Duration::from_micros((ms * 1000.0) as u64))
    }
}

/// Why a keyframe was requested from a sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyframeReason {
    LayerSwitch,
    SwitchTimeout,
    UnrecoverableGap,
    RetransmitTimeout,
    ReceiverRequest,
}

impl KeyframeReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LayerSwitch => "layer_switch",
            Self::SwitchTimeout => "switch_timeout",
            Self::UnrecoverableGap => "unrecoverable_gap",
            Self::RetransmitTimeout => "retransmit_timeout",
            Self::ReceiverRequest => "receiver_request",
        }
    }
}

/// Discrete occurrence worth reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    LayerSwitch {
        subscription_id: SubscriptionId,
        stream_id: StreamId,
        from: Option<LayerId>,
        to: LayerId,
    },
    KeyframeRequest {
        stream_id: StreamId,
        layer: LayerId,
        reason: KeyframeReason,
    },
    SessionTeardown {
        session_id: SessionId,
        subscriptions_closed: usize,
        streams_removed: usize,
    },
}

/// Receiver of telemetry
pub trait TelemetrySink: Send + Sync {
    fn snapshot(&self, snapshot: &SessionSnapshot);
    fn event(&self, event: &TelemetryEvent);
}

/// Writes telemetry as `tracing` records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn snapshot(&self, snapshot: &SessionSnapshot) {
        debug!(
            session_id = %snapshot.session_id,
            state = ?snapshot.state,
            estimate_bps = snapshot.estimate.map(|e| e.bitrate_bps),
            trend = ?snapshot.estimate.map(|e| e.trend),
            loss_ratio = snapshot.loss_ratio,
            rtt_ms = snapshot.rtt_ms,
            "Session snapshot"
        );
    }

    fn event(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::LayerSwitch {
                subscription_id,
                stream_id,
                from,
                to,
            } => info!(
                subscription_id = %subscription_id,
                stream_id = %stream_id,
                from = ?from,
                to = %to,
                "Layer switch"
            ),
            TelemetryEvent::KeyframeRequest { stream_id, layer, reason } => debug!(
                stream_id = %stream_id,
                layer = %layer,
                reason = reason.as_str(),
                "Keyframe requested"
            ),
            TelemetryEvent::SessionTeardown {
                session_id,
                subscriptions_closed,
                streams_removed,
            } => info!(
                session_id = %session_id,
                subscriptions_closed,
                streams_removed,
                "Session torn down"
            ),
        }
    }
}

/// Forwards to several sinks
#[derive(Default, Clone)]
pub struct TelemetryFanout {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl TelemetryFanout {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetrySink for TelemetryFanout {
    fn snapshot(&self, snapshot: &SessionSnapshot) {
        for sink in &self.sinks {
            sink.snapshot(snapshot);
        }
    }

    fn event(&self, event: &TelemetryEvent) {
        for sink in &self.sinks {
            sink.event(event);
        }
    }
}
