//! Layer selection and forwarding across the router and switch controller

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{payload_layer, simulcast, video, CaptureSink};
use fanout_sfu::config::{RecoveryConfig, RtpExtensionConfig, SelectorConfig};
use fanout_sfu::selector::{subscription_budget, SwitchAction};
use fanout_sfu::{
    select_layer, LayerId, MediaKind, ReceiverConstraints, Router, StreamId, SubscriptionId,
    SwitchController,
};

struct Subscriber {
    router: Router,
    sink: Arc<CaptureSink>,
    subscription: SubscriptionId,
    switch: SwitchController,
}

const STREAM: StreamId = StreamId::new(7);

impl Subscriber {
    fn new() -> Self {
        let router = Router::new(RtpExtensionConfig::default(), RecoveryConfig::default());
        router.add_stream(STREAM, MediaKind::Video, &simulcast()).unwrap();
        let sink = Arc::new(CaptureSink::default());
        let subscription = SubscriptionId::new();
        router.subscribe(subscription, STREAM, sink.clone()).unwrap();
        Self {
            router,
            sink,
            subscription,
            switch: SwitchController::new(),
        }
    }

    /// One allocation round for an estimate, as the control loop runs it
    fn allocate(&mut self, estimate_bps: u64, now: Instant) -> Option<LayerId> {
        let forwarder = self.router.forwarder(self.subscription).unwrap();
        self.switch.observe(forwarder.current_layer(), now);
        let layers = simulcast();
        let target = select_layer(
            &layers,
            subscription_budget(estimate_bps, 1),
            &ReceiverConstraints::default(),
        )?;
        match self
            .switch
            .request(&layers, target, now, &SelectorConfig::default())
        {
            SwitchAction::Arm(layer) => forwarder.set_target(Some(layer)),
            SwitchAction::Cancel => forwarder.set_target(None),
            SwitchAction::Idle => {}
        }
        Some(target)
    }

    /// Release one frame on every layer
    fn frame(&self, seq: u16, keyframe_on: &[u8], now: Instant) {
        for layer in 0..3u8 {
            let packet = video(layer, seq, u32::from(seq) * 3000, keyframe_on.contains(&layer));
            self.router
                .on_ready_packet(STREAM, LayerId::new(layer), &packet, now);
        }
    }

    fn forwarded_layers(&self) -> Vec<u8> {
        self.sink
            .sent
            .lock()
            .iter()
            .map(|p| payload_layer(p))
            .collect()
    }
}

#[test]
fn test_estimate_selects_highest_fitting_layer() {
    let mut sub = Subscriber::new();
    let now = Instant::now();

    assert_eq!(sub.allocate(300_000, now), Some(LayerId::new(0)));
    sub.frame(1, &[0, 1, 2], now);
    sub.frame(2, &[], now);

    assert_eq!(sub.forwarded_layers(), vec![0, 0]);
    let forwarder = sub.router.forwarder(sub.subscription).unwrap();
    assert_eq!(forwarder.current_layer(), Some(LayerId::new(0)));
}

#[test]
fn test_upgrade_waits_for_keyframe_boundary() {
    let mut sub = Subscriber::new();
    let start = Instant::now();

    sub.allocate(300_000, start);
    sub.frame(1, &[0, 1, 2], start);
    sub.allocate(300_000, start);

    // Past the cooldown so the upgrade arms immediately
    let later = start + Duration::from_secs(2);
    assert_eq!(sub.allocate(500_000, later), Some(LayerId::new(1)));
    assert_eq!(sub.switch.pending(), Some(LayerId::new(1)));

    for seq in 2..6 {
        sub.frame(seq, &[], later);
    }
    assert!(sub.forwarded_layers().iter().all(|&l| l == 0));

    // Layer 0 is released first within a frame, so frame 6 reaches the
    // receiver on both layers
    sub.frame(6, &[1], later);
    sub.frame(7, &[], later);
    assert_eq!(sub.forwarded_layers(), vec![0, 0, 0, 0, 0, 0, 1, 1]);

    sub.allocate(500_000, later);
    assert_eq!(sub.switch.current(), Some(LayerId::new(1)));
    assert_eq!(sub.switch.pending(), None);
}

#[test]
fn test_output_numbering_contiguous_across_switches() {
    let mut sub = Subscriber::new();
    let start = Instant::now();

    sub.allocate(300_000, start);
    sub.frame(10, &[0], start);
    sub.frame(11, &[], start);
    sub.allocate(300_000, start);

    let t1 = start + Duration::from_secs(2);
    sub.allocate(1_500_000, t1);
    sub.frame(12, &[2], t1);
    sub.frame(13, &[], t1);

    let t2 = t1 + Duration::from_secs(2);
    sub.allocate(150_000, t2);
    sub.frame(14, &[0], t2);

    let headers = sub.sink.headers();
    let first = headers[0].sequence;
    let seqs: Vec<u16> = headers.iter().map(|h| h.sequence.wrapping_sub(first)).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);
    assert!(headers.windows(2).all(|w| w[0].ssrc == w[1].ssrc));
    assert!(headers
        .windows(2)
        .all(|w| w[1].timestamp.wrapping_sub(w[0].timestamp) < u32::MAX / 2));
    assert_eq!(sub.forwarded_layers(), vec![0, 0, 0, 2, 2, 0]);
}

#[test]
fn test_reordered_and_duplicate_input_never_reaches_receiver() {
    let mut sub = Subscriber::new();
    let now = Instant::now();
    sub.allocate(300_000, now);

    let l0 = LayerId::new(0);
    for (seq, keyframe) in [(20, true), (21, false), (21, false), (20, false), (22, false)] {
        sub.router
            .on_ready_packet(STREAM, l0, &video(0, seq, u32::from(seq) * 3000, keyframe), now);
    }

    let headers = sub.sink.headers();
    assert_eq!(headers.len(), 3);
    assert!(headers
        .windows(2)
        .all(|w| w[1].sequence == w[0].sequence.wrapping_add(1)));
    let forwarder = sub.router.forwarder(sub.subscription).unwrap();
    assert_eq!(forwarder.get_stats().packets_stale, 2);
}

#[test]
fn test_downgrade_during_cooldown_is_not_delayed() {
    let mut sub = Subscriber::new();
    let start = Instant::now();

    sub.allocate(1_500_000, start);
    sub.frame(1, &[2], start);
    sub.allocate(1_500_000, start);

    let soon = start + Duration::from_millis(100);
    assert_eq!(sub.allocate(150_000, soon), Some(LayerId::new(0)));
    assert_eq!(sub.switch.pending(), Some(LayerId::new(0)));

    sub.frame(2, &[0], soon);
    assert_eq!(sub.forwarded_layers(), vec![2, 0]);
}

#[test]
fn test_constraints_cap_the_layer() {
    let layers = simulcast();
    let capped = ReceiverConstraints {
        max_spatial_rank: Some(1),
        ..Default::default()
    };
    assert_eq!(select_layer(&layers, 5_000_000, &capped), Some(LayerId::new(1)));

    let by_bitrate = ReceiverConstraints {
        max_bitrate_bps: Some(200_000),
        ..Default::default()
    };
    assert_eq!(select_layer(&layers, 5_000_000, &by_bitrate), Some(LayerId::new(0)));

    // Nothing fits: the base layer still flows
    assert_eq!(
        select_layer(&layers, 10_000, &ReceiverConstraints::default()),
        Some(LayerId::new(0))
    );
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let mut sub = Subscriber::new();
    let now = Instant::now();
    sub.allocate(300_000, now);
    sub.frame(1, &[0], now);
    assert_eq!(sub.sink.sent.lock().len(), 1);

    assert!(sub.router.unsubscribe(sub.subscription));
    assert!(!sub.router.unsubscribe(sub.subscription));
    sub.frame(2, &[0], now);
    assert_eq!(sub.sink.sent.lock().len(), 1);
}
