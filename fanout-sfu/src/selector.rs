//! Layer selection and switch damping
//!
//! [`select_layer`] is a pure function of the announced layers, the budget
//! and the receiver's constraints. [`SwitchController`] keeps the per
//! subscription switch state on the control plane: coalescing, cooldown,
//! and the keyframe deadline. The commit itself happens on the forwarding
//! path when the target layer's keyframe arrives.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::SelectorConfig;
use crate::error::{SfuError, SfuResult};
use crate::types::{LayerDescriptor, LayerId};

/// Limits a receiver places on what it is sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConstraints {
    pub max_spatial_rank: Option<u8>,
    pub max_temporal_rank: Option<u8>,
    pub max_bitrate_bps: Option<u64>,
}

impl ReceiverConstraints {
    fn allows(&self, layer: &LayerDescriptor) -> bool {
        self.max_spatial_rank.map_or(true, |max| layer.spatial_rank <= max)
            && self.max_temporal_rank.map_or(true, |max| layer.temporal_rank <= max)
    }
}

/// Budget of one subscription when a receiver's estimate is shared equally
#[must_use]
pub fn subscription_budget(estimate_bps: u64, subscriptions: usize) -> u64 {
    estimate_bps / subscriptions.max(1) as u64
}

/// Lowest-ranked layer
#[must_use]
pub fn base_layer(layers: &[LayerDescriptor]) -> Option<LayerId> {
    layers.iter().min_by_key(|l| l.rank()).map(|l| l.layer_id)
}

/// Highest-ranked layer that fits the budget and the constraints. Ranks are
/// unique per stream, so among the fitting layers this is also the one that
/// uses the budget best. Falls back to the base layer when nothing fits.
#[must_use]
pub fn select_layer(
    layers: &[LayerDescriptor],
    budget_bps: u64,
    constraints: &ReceiverConstraints,
) -> Option<LayerId> {
    let budget = constraints
        .max_bitrate_bps
        .map_or(budget_bps, |max| max.min(budget_bps));

    layers
        .iter()
        .filter(|l| l.target_bitrate_bps <= budget && constraints.allows(l))
        .max_by_key(|l| l.rank())
        .map(|l| l.layer_id)
        .or_else(|| base_layer(layers))
}

fn rank_of(layers: &[LayerDescriptor], id: LayerId) -> Option<(u8, u8)> {
    layers.iter().find(|l| l.layer_id == id).map(LayerDescriptor::rank)
}

/// What the control plane has to do with the forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchAction {
    Idle,
    /// Point the forwarder at this layer and request a keyframe on it
    Arm(LayerId),
    /// Withdraw the forwarder's pending target
    Cancel,
}

#[derive(Debug, Clone, Copy)]
struct PendingSwitch {
    target: LayerId,
    /// Set once the switch is armed; the keyframe must arrive before it
    deadline: Option<Instant>,
    armed_at: Option<Instant>,
}

/// Per-subscription switch state
#[derive(Debug, Default)]
pub struct SwitchController {
    committed: Option<LayerId>,
    last_commit: Option<Instant>,
    pending: Option<PendingSwitch>,
    timeouts: u64,
}

impl SwitchController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer being forwarded, `None` until the first switch commits
    #[must_use]
    pub const fn current(&self) -> Option<LayerId> {
        self.committed
    }

    #[must_use]
    pub fn pending(&self) -> Option<LayerId> {
        self.pending.map(|p| p.target)
    }

    #[must_use]
    pub const fn timeouts(&self) -> u64 {
        self.timeouts
    }

    /// Feed back the layer the forwarder is actually on. Returns true when
    /// a switch committed since the last observation.
    pub fn observe(&mut self, forwarded: Option<LayerId>, now: Instant) -> bool {
        if forwarded.is_none() || forwarded == self.committed {
            return false;
        }
        self.committed = forwarded;
        self.last_commit = Some(now);
        if self.pending.is_some_and(|p| Some(p.target) == forwarded) {
            self.pending = None;
        }
        true
    }

    fn in_cooldown(&self, now: Instant, config: &SelectorConfig) -> bool {
        self.last_commit
            .is_some_and(|at| now.saturating_duration_since(at) < config.switch_cooldown())
    }

    fn arm(&mut self, target: LayerId, now: Instant, config: &SelectorConfig) -> SwitchAction {
        self.pending = Some(PendingSwitch {
            target,
            deadline: Some(now + config.keyframe_wait()),
            armed_at: Some(now),
        });
        SwitchAction::Arm(target)
    }

    /// A new desired layer from allocation
    pub fn request(
        &mut self,
        layers: &[LayerDescriptor],
        target: LayerId,
        now: Instant,
        config: &SelectorConfig,
    ) -> SwitchAction {
        if self.committed == Some(target) {
            return match self.pending.take() {
                Some(p) if p.deadline.is_some() => SwitchAction::Cancel,
                _ => SwitchAction::Idle,
            };
        }
        if self.pending.is_some_and(|p| p.target == target) {
            return SwitchAction::Idle;
        }

        let Some(current) = self.committed else {
            return self.arm(target, now, config);
        };
        let upgrade = rank_of(layers, target) > rank_of(layers, current);
        if upgrade && self.in_cooldown(now, config) {
            let was_armed = self.pending.is_some_and(|p| p.deadline.is_some());
            self.pending = Some(PendingSwitch {
                target,
                deadline: None,
                armed_at: None,
            });
            return if was_armed {
                SwitchAction::Cancel
            } else {
                SwitchAction::Idle
            };
        }
        self.arm(target, now, config)
    }

    /// Advance timers. A keyframe deadline that passes yields
    /// [`SfuError::Timeout`]; the switch stays armed with a fresh deadline
    /// and the caller re-requests the keyframe.
    pub fn poll(&mut self, now: Instant, config: &SelectorConfig) -> SfuResult<SwitchAction> {
        let Some(pending) = self.pending else {
            return Ok(SwitchAction::Idle);
        };
        match pending.deadline {
            None if self.in_cooldown(now, config) => Ok(SwitchAction::Idle),
            None => Ok(self.arm(pending.target, now, config)),
            Some(deadline) if now >= deadline => {
                let elapsed = now.saturating_duration_since(pending.armed_at.unwrap_or(deadline));
                self.pending = Some(PendingSwitch {
                    deadline: Some(now + config.keyframe_wait()),
                    ..pending
                });
                self.timeouts += 1;
                Err(SfuError::Timeout {
                    operation: "keyframe_wait",
                    elapsed,
                })
            }
            Some(_) => Ok(SwitchAction::Idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn layer(id: u8, kbps: u64, spatial: u8, temporal: u8) -> LayerDescriptor {
        LayerDescriptor {
            layer_id: LayerId::new(id),
            ssrc: 1000 + u32::from(id),
            target_bitrate_bps: kbps * 1000,
            spatial_rank: spatial,
            temporal_rank: temporal,
        }
    }

    fn simulcast() -> Vec<LayerDescriptor> {
        vec![layer(0, 100, 0, 0), layer(1, 400, 1, 0), layer(2, 1200, 2, 0)]
    }

    fn config() -> SelectorConfig {
        SelectorConfig {
            switch_cooldown_ms: 1_000,
            keyframe_wait_ms: 2_000,
        }
    }

    #[test]
    fn test_highest_fitting_layer() {
        let layers = simulcast();
        let none = ReceiverConstraints::default();
        assert_eq!(select_layer(&layers, 300_000, &none), Some(LayerId::new(0)));
        assert_eq!(select_layer(&layers, 500_000, &none), Some(LayerId::new(1)));
        assert_eq!(select_layer(&layers, 5_000_000, &none), Some(LayerId::new(2)));
    }

    #[test]
    fn test_nothing_fits_falls_back_to_base() {
        let layers = simulcast();
        assert_eq!(
            select_layer(&layers, 10_000, &ReceiverConstraints::default()),
            Some(LayerId::new(0))
        );
        assert_eq!(select_layer(&[], 10_000, &ReceiverConstraints::default()), None);
    }

    #[test]
    fn test_constraints_cap_selection() {
        let layers = simulcast();
        let capped = ReceiverConstraints {
            max_spatial_rank: Some(1),
            ..Default::default()
        };
        assert_eq!(select_layer(&layers, 5_000_000, &capped), Some(LayerId::new(1)));

        let bitrate = ReceiverConstraints {
            max_bitrate_bps: Some(200_000),
            ..Default::default()
        };
        assert_eq!(select_layer(&layers, 5_000_000, &bitrate), Some(LayerId::new(0)));
    }

    #[test]
    fn test_spatial_and_temporal_grid() {
        // Two resolutions, each at two frame rates
        let layers = vec![
            layer(0, 100, 0, 0),
            layer(1, 150, 0, 1),
            layer(2, 450, 1, 0),
            layer(3, 700, 1, 1),
        ];
        let none = ReceiverConstraints::default();
        assert_eq!(select_layer(&layers, 300_000, &none), Some(LayerId::new(1)));
        assert_eq!(select_layer(&layers, 500_000, &none), Some(LayerId::new(2)));
        assert_eq!(select_layer(&layers, 1_000_000, &none), Some(LayerId::new(3)));

        let base_rate = ReceiverConstraints {
            max_temporal_rank: Some(0),
            ..Default::default()
        };
        assert_eq!(select_layer(&layers, 1_000_000, &base_rate), Some(LayerId::new(2)));
        assert_eq!(select_layer(&layers, 300_000, &base_rate), Some(LayerId::new(0)));
    }

    #[test]
    fn test_budget_is_split_equally() {
        assert_eq!(subscription_budget(900_000, 3), 300_000);
        assert_eq!(subscription_budget(900_000, 0), 900_000);
    }

    #[test]
    fn test_first_switch_arms_immediately() {
        let layers = simulcast();
        let mut ctl = SwitchController::new();
        let t0 = Instant::now();
        assert_eq!(
            ctl.request(&layers, LayerId::new(0), t0, &config()),
            SwitchAction::Arm(LayerId::new(0))
        );
        assert_eq!(ctl.current(), None);
        assert!(ctl.observe(Some(LayerId::new(0)), t0));
        assert_eq!(ctl.current(), Some(LayerId::new(0)));
        assert_eq!(ctl.pending(), None);
    }

    #[test]
    fn test_upgrade_waits_out_cooldown_and_coalesces() {
        let layers = simulcast();
        let cfg = config();
        let mut ctl = SwitchController::new();
        let t0 = Instant::now();
        ctl.request(&layers, LayerId::new(0), t0, &cfg);
        ctl.observe(Some(LayerId::new(0)), t0);

        let t1 = t0 + Duration::from_millis(200);
        assert_eq!(ctl.request(&layers, LayerId::new(1), t1, &cfg), SwitchAction::Idle);
        assert_eq!(ctl.request(&layers, LayerId::new(2), t1, &cfg), SwitchAction::Idle);
        assert_eq!(ctl.pending(), Some(LayerId::new(2)));
        assert_eq!(ctl.poll(t1, &cfg).unwrap(), SwitchAction::Idle);

        let t2 = t0 + cfg.switch_cooldown();
        assert_eq!(ctl.poll(t2, &cfg).unwrap(), SwitchAction::Arm(LayerId::new(2)));
    }

    #[test]
    fn test_downgrade_is_armed_inside_cooldown() {
        let layers = simulcast();
        let cfg = config();
        let mut ctl = SwitchController::new();
        let t0 = Instant::now();
        ctl.request(&layers, LayerId::new(2), t0, &cfg);
        ctl.observe(Some(LayerId::new(2)), t0);

        let t1 = t0 + Duration::from_millis(50);
        assert_eq!(
            ctl.request(&layers, LayerId::new(0), t1, &cfg),
            SwitchAction::Arm(LayerId::new(0))
        );
    }

    #[test]
    fn test_returning_to_current_cancels() {
        let layers = simulcast();
        let cfg = config();
        let mut ctl = SwitchController::new();
        let t0 = Instant::now();
        ctl.request(&layers, LayerId::new(2), t0, &cfg);
        ctl.observe(Some(LayerId::new(2)), t0);
        ctl.request(&layers, LayerId::new(0), t0, &cfg);
        assert_eq!(ctl.request(&layers, LayerId::new(2), t0, &cfg), SwitchAction::Cancel);
        assert_eq!(ctl.pending(), None);
    }

    #[test]
    fn test_keyframe_wait_times_out_and_rearms() {
        let layers = simulcast();
        let cfg = config();
        let mut ctl = SwitchController::new();
        let t0 = Instant::now();
        ctl.request(&layers, LayerId::new(1), t0, &cfg);

        assert_eq!(
            ctl.poll(t0 + Duration::from_millis(1_999), &cfg).unwrap(),
            SwitchAction::Idle
        );
        let err = ctl.poll(t0 + cfg.keyframe_wait(), &cfg).unwrap_err();
        assert!(matches!(err, SfuError::Timeout { operation: "keyframe_wait", .. }));
        assert_eq!(ctl.timeouts(), 1);
        assert_eq!(ctl.pending(), Some(LayerId::new(1)));

        // Fresh deadline
        assert_eq!(
            ctl.poll(t0 + cfg.keyframe_wait() + Duration::from_millis(10), &cfg)
                .unwrap(),
            SwitchAction::Idle
        );
    }
}
