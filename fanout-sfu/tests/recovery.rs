//! Loss recovery decisions and the estimator's response to loss

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{simulcast, video, CaptureSink};
use fanout_sfu::bwe::Trend;
use fanout_sfu::config::{BweConfig, RecoveryConfig, RtpExtensionConfig};
use fanout_sfu::{
    BandwidthEstimator, LayerId, MediaKind, RecoveryAction, RecoveryCoordinator, Router, SeqRange,
    SessionId, StreamId, SubscriptionId,
};

const STREAM: StreamId = StreamId::new(3);
const L0: LayerId = LayerId::new(0);

fn setup() -> (Arc<Router>, RecoveryCoordinator) {
    let config = RecoveryConfig::default();
    let router = Arc::new(Router::new(RtpExtensionConfig::default(), config.clone()));
    router.add_stream(STREAM, MediaKind::Video, &simulcast()).unwrap();
    let recovery = RecoveryCoordinator::new(config, router.clone());
    (router, recovery)
}

fn release(router: &Router, seqs: impl IntoIterator<Item = u16>, now: Instant) {
    for seq in seqs {
        router.on_ready_packet(STREAM, L0, &video(0, seq, u32::from(seq) * 3000, seq == 1), now);
    }
}

#[test]
fn test_gap_within_retention_requests_retransmission() {
    let (router, recovery) = setup();
    let now = Instant::now();
    release(&router, 1..=10, now);

    let action = recovery.on_gap_detected(STREAM, L0, SeqRange::new(11, 13), now);
    match action {
        RecoveryAction::Nack { stream_id, layer, seqs } => {
            assert_eq!(stream_id, STREAM);
            assert_eq!(layer, L0);
            assert_eq!(seqs.iter().collect::<Vec<_>>(), vec![11, 12, 13]);
        }
        other => panic!("expected a NACK, got {other:?}"),
    }
    let stats = recovery.get_stats();
    assert_eq!(stats.nacks_sent, 1);
    assert_eq!(stats.keyframe_requests, 0);
    assert_eq!(stats.pending_nacks, 1);

    // Reported again while pending: nothing new goes out
    assert!(matches!(
        recovery.on_gap_detected(STREAM, L0, SeqRange::new(11, 13), now),
        RecoveryAction::Nothing
    ));
}

#[test]
fn test_gap_beyond_retention_requests_keyframe_once() {
    let (router, recovery) = setup();
    let start = Instant::now();
    release(&router, 1..=10, start);

    let later = start + RecoveryConfig::default().retention() + Duration::from_millis(100);
    router.evict_expired(later);

    let action = recovery.on_gap_detected(STREAM, L0, SeqRange::new(11, 13), later);
    assert!(action.is_keyframe_request());

    let again = recovery.on_gap_detected(
        STREAM,
        L0,
        SeqRange::new(11, 13),
        later + Duration::from_millis(50),
    );
    assert!(matches!(again, RecoveryAction::Nothing));

    let stats = recovery.get_stats();
    assert_eq!(stats.nacks_sent, 0);
    assert_eq!(stats.keyframe_requests, 1);
    assert_eq!(stats.keyframe_requests_throttled, 1);

    // Once the throttle interval has passed a new loss may ask again
    let after_throttle = later + RecoveryConfig::default().keyframe_min_interval();
    assert!(recovery
        .on_gap_detected(STREAM, L0, SeqRange::new(40, 41), after_throttle)
        .is_keyframe_request());
}

#[test]
fn test_unanswered_nack_escalates_to_keyframe() {
    let (router, recovery) = setup();
    let now = Instant::now();
    release(&router, 1..=10, now);

    recovery.on_gap_detected(STREAM, L0, SeqRange::new(11, 12), now);
    assert!(recovery.on_packet_recovered(STREAM, L0, 11));
    assert!(recovery.tick(now + Duration::from_millis(10)).is_empty());

    let actions = recovery.tick(now + RecoveryConfig::default().retransmit_wait());
    assert_eq!(actions.len(), 1);
    assert!(actions[0].is_keyframe_request());
    assert_eq!(recovery.get_stats().escalations, 1);
    assert_eq!(recovery.get_stats().pending_nacks, 0);
}

#[test]
fn test_receiver_nack_served_from_window() {
    let (router, recovery) = setup();
    let now = Instant::now();
    let sink = Arc::new(CaptureSink::default());
    let subscription = SubscriptionId::new();
    let forwarder = router.subscribe(subscription, STREAM, sink.clone()).unwrap();
    forwarder.set_target(Some(L0));
    release(&router, 1..=5, now);

    let lost = sink.sequences()[2];
    let actions = recovery.on_recovery_request_received(sink.id, subscription, &[lost], now);
    assert_eq!(actions.len(), 1);
    let RecoveryAction::Retransmit { resolved, packet, .. } = &actions[0] else {
        panic!("expected a retransmission");
    };
    assert_eq!(resolved.in_seq, 3);
    assert!(forwarder.retransmit(resolved, packet, now));
    assert_eq!(*sink.sequences().last().unwrap(), lost);

    // Another receiver cannot act on this subscription
    assert!(recovery
        .on_recovery_request_received(SessionId::new(), subscription, &[lost], now)
        .is_empty());
}

#[test]
fn test_sustained_loss_strictly_decreases_estimate() {
    let config = BweConfig::default();
    let estimator = BandwidthEstimator::new(config.clone());
    let session = SessionId::new();
    let start = Instant::now();
    estimator.register(session, start);

    let step = config.min_decrease_interval() + Duration::from_millis(10);
    let mut previous = estimator.current_estimate(&session).unwrap().bitrate_bps;
    for i in 1..=6u32 {
        let now = start + step * i;
        estimator.on_loss_signal(&session, 0.2, now);
        estimator.evaluate(now);
        let estimate = estimator.current_estimate(&session).unwrap();
        assert!(
            estimate.bitrate_bps < previous,
            "round {i}: {} not below {previous}",
            estimate.bitrate_bps
        );
        assert_eq!(estimate.trend, Trend::Decrease);
        previous = estimate.bitrate_bps;
    }
    assert!(previous >= config.min_bitrate_bps);
}

#[test]
fn test_clean_link_increases_slowly() {
    let config = BweConfig::default();
    let estimator = BandwidthEstimator::new(config.clone());
    let session = SessionId::new();
    let start = Instant::now();
    estimator.register(session, start);

    let initial = estimator.current_estimate(&session).unwrap().bitrate_bps;
    let now = start + config.evaluation_interval();
    estimator.on_loss_signal(&session, 0.0, now);
    estimator.evaluate(now);
    let estimate = estimator.current_estimate(&session).unwrap();

    assert_eq!(estimate.trend, Trend::Increase);
    assert!(estimate.bitrate_bps > initial);
    let ceiling = (initial as f64 * (1.0 + config.max_increase_ratio)).ceil() as u64;
    assert!(estimate.bitrate_bps <= ceiling);
}
