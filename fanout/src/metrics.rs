//! Prometheus metrics
//!
//! This module provides:
//! - A [`TelemetrySink`] turning SFU events and snapshots into metrics
//! - Gauges refreshed from [`SfuStats`] on every scrape
//! - Text exposition for the `/metrics` endpoint

use fanout_sfu::{
    SessionSnapshot, SfuStats, SubscriptionEvent, SubscriptionState,
    TelemetryEvent, TelemetrySink,
};
use prometheus::{
    exponential_buckets, register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry, Histogram,
    IntCounter, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};

pub struct SfuMetrics {
    registry: Registry,
    layer_switches: IntCounter,
    keyframe_requests: IntCounterVec,
    session_teardowns: IntCounter,
    subscription_events: IntCounterVec,
    estimate_bps: Histogram,
    loss_ratio: Histogram,
    rtt_seconds: Histogram,
    pipeline: IntGaugeVec,
    entities: IntGaugeVec,
    recovery: IntGaugeVec,
}

impl SfuMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            layer_switches: register_int_counter_with_registry!(
                "fanout_layer_switches_total",
                "Layer switches committed on forwarders",
                registry
            )?,
            keyframe_requests: register_int_counter_vec_with_registry!(
                "fanout_keyframe_requests_total",
                "Keyframe requests sent to stream senders",
                &["reason"],
                registry
            )?,
            session_teardowns: register_int_counter_with_registry!(
                "fanout_session_teardowns_total",
                "Sessions torn down",
                registry
            )?,
            subscription_events: register_int_counter_vec_with_registry!(
                "fanout_subscription_events_total",
                "Subscription status changes",
                &["status"],
                registry
            )?,
            estimate_bps: register_histogram_with_registry!(
                "fanout_session_estimate_bps",
                "Downlink bandwidth estimates at snapshot time",
                exponential_buckets(50_000.0, 2.0, 10)?,
                registry
            )?,
            loss_ratio: register_histogram_with_registry!(
                "fanout_session_loss_ratio",
                "Receiver-reported loss ratio at snapshot time",
                vec![0.0, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0],
                registry
            )?,
            rtt_seconds: register_histogram_with_registry!(
                "fanout_session_rtt_seconds",
                "Connectivity check round-trip time at snapshot time",
                exponential_buckets(0.005, 2.0, 10)?,
                registry
            )?,
            pipeline: register_int_gauge_vec_with_registry!(
                "fanout_pipeline_packets",
                "Inbound media pipeline counters",
                &["kind"],
                registry
            )?,
            entities: register_int_gauge_vec_with_registry!(
                "fanout_entities",
                "Live rooms, participants, streams and subscriptions",
                &["entity"],
                registry
            )?,
            recovery: register_int_gauge_vec_with_registry!(
                "fanout_recovery",
                "Loss recovery counters",
                &["kind"],
                registry
            )?,
            registry,
        })
    }

    pub fn observe_subscription_event(&self, event: &SubscriptionEvent) {
        let status = match event.status {
            SubscriptionState::Pending => "pending",
            SubscriptionState::Active => "active",
            SubscriptionState::Closed => "closed",
        };
        self.subscription_events.with_label_values(&[status]).inc();
    }

    /// Refresh the gauges mirrored from engine statistics
    pub fn observe_stats(&self, stats: &SfuStats) {
        let p = &stats.pipeline;
        for (kind, value) in [
            ("media", p.media_packets),
            ("rtcp", p.rtcp_packets),
            ("dropped_malformed", p.dropped_malformed),
            ("dropped_unsupported", p.dropped_unsupported),
            ("dropped_unknown_stream", p.dropped_unknown_stream),
            ("dropped_foreign_session", p.dropped_foreign_session),
            ("gaps", p.gaps),
            ("late", p.late_packets),
            ("duplicates", p.duplicates),
            ("lost", p.packets_lost),
            ("released", p.packets_released),
            ("replicated", stats.router.packets_replicated),
            ("send_failures", stats.router.send_failures),
        ] {
            self.pipeline.with_label_values(&[kind]).set(value as i64);
        }

        let r = &stats.registry;
        for (entity, value) in [
            ("rooms", r.rooms),
            ("participants", r.participants),
            ("streams", r.streams),
            ("subscriptions", r.subscriptions),
            ("pending_subscriptions", r.pending_subscriptions),
            ("transport_sessions", stats.transport.sessions),
            ("estimators", stats.estimators),
        ] {
            self.entities.with_label_values(&[entity]).set(value as i64);
        }

        let rec = &stats.recovery;
        for (kind, value) in [
            ("nacks_sent", rec.nacks_sent),
            ("packets_recovered", rec.packets_recovered),
            ("retransmissions", rec.retransmissions),
            ("escalations", rec.escalations),
            ("keyframe_requests_throttled", rec.keyframe_requests_throttled),
            ("pending_nacks", rec.pending_nacks as u64),
        ] {
            self.recovery.with_label_values(&[kind]).set(value as i64);
        }
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

impl TelemetrySink for SfuMetrics {
    fn snapshot(&self, snapshot: &SessionSnapshot) {
        if let Some(estimate) = snapshot.estimate {
            self.estimate_bps.observe(estimate.bitrate_bps as f64);
        }
        self.loss_ratio.observe(snapshot.loss_ratio);
        if let Some(rtt) = snapshot.rtt() {
            self.rtt_seconds.observe(rtt.as_secs_f64());
        }
    }

    fn event(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::LayerSwitch { .. } => self.layer_switches.inc(),
            TelemetryEvent::KeyframeRequest { reason, .. } => self
                .keyframe_requests
                .with_label_values(&[reason.as_str()])
                .inc(),
            TelemetryEvent::SessionTeardown { .. } => self.session_teardowns.inc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use fanout_sfu::{KeyframeReason, LayerId, SessionId, StreamId, SubscriptionId};

    use super::*;

    #[test]
    fn test_events_become_counters() {
        let metrics = SfuMetrics::new().unwrap();
        metrics.event(&TelemetryEvent::KeyframeRequest {
            stream_id: StreamId::new(1),
            layer: LayerId::new(0),
            reason: KeyframeReason::UnrecoverableGap,
        });
        metrics.event(&TelemetryEvent::LayerSwitch {
            subscription_id: SubscriptionId::new(),
            stream_id: StreamId::new(1),
            from: None,
            to: LayerId::new(0),
        });
        metrics.observe_subscription_event(&SubscriptionEvent {
            subscription_id: SubscriptionId::new(),
            status: SubscriptionState::Active,
            layer: Some(LayerId::new(0)),
        });

        let text = metrics.render().unwrap();
        assert!(text.contains("fanout_keyframe_requests_total{reason=\"unrecoverable_gap\"} 1"));
        assert!(text.contains("fanout_layer_switches_total 1"));
        assert!(text.contains("fanout_subscription_events_total{status=\"active\"} 1"));
    }

    #[test]
    fn test_stats_refresh_gauges() {
        let metrics = SfuMetrics::new().unwrap();
        let mut stats = SfuStats::default();
        stats.pipeline.media_packets = 42;
        stats.registry.rooms = 3;
        metrics.observe_stats(&stats);

        let text = metrics.render().unwrap();
        assert!(text.contains("fanout_pipeline_packets{kind=\"media\"} 42"));
        assert!(text.contains("fanout_entities{entity=\"rooms\"} 3"));
    }

    #[test]
    fn test_snapshot_without_estimate() {
        let metrics = SfuMetrics::new().unwrap();
        metrics.snapshot(&SessionSnapshot {
            session_id: SessionId::new(),
            state: fanout_sfu::SessionState::Established,
            estimate: None,
            loss_ratio: 0.05,
            rtt_ms: Some(20.0),
        });
        let text = metrics.render().unwrap();
        assert!(text.contains("fanout_session_loss_ratio_count 1"));
        assert!(text.contains("fanout_session_estimate_bps_count 0"));
    }
}
