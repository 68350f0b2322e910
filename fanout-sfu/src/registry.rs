//! Session registry - room topology and lifecycle
//!
//! This module provides:
//! - Room membership with capacity limits
//! - Stream announcement and validation of layer descriptors
//! - Subscriptions and their `Pending -> Active -> Closed` lifecycle
//! - Connect with retry, and cascading, idempotent teardown
//! - Periodic layer allocation for every subscription
//!
//! Topology lives under one `parking_lot::Mutex` per room. The forwarding
//! path never touches it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bwe::BandwidthEstimator;
use crate::config::{LimitsConfig, SelectorConfig};
use crate::demux::Demuxer;
use crate::error::{SfuError, SfuResult, StaleRef};
use crate::recovery::RecoveryCoordinator;
use crate::router::{Forwarder, Router};
use crate::selector::{select_layer, subscription_budget, ReceiverConstraints, SwitchAction, SwitchController};
use crate::telemetry::{KeyframeReason, TelemetryEvent, TelemetrySink};
use crate::transport::{ConnectivityParams, Session, SessionState, TransportManager};
use crate::types::{
    LayerDescriptor, LayerId, MediaKind, ParticipantId, RoomId, SessionId, StreamId, SubscriptionId,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Waiting for the first layer switch to commit
    Pending,
    Active,
    /// Terminal
    Closed,
}

/// Status change published for the signaling collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub subscription_id: SubscriptionId,
    pub status: SubscriptionState,
    pub layer: Option<LayerId>,
}

/// A sender's description of a new stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAnnouncement {
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub kind: MediaKind,
    pub layers: Vec<LayerDescriptor>,
}

/// Public view of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub subscription_id: SubscriptionId,
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub state: SubscriptionState,
    pub current_layer: Option<LayerId>,
    pub target_layer: Option<LayerId>,
}

/// An announced stream
#[derive(Debug, Clone)]
pub struct InboundStream {
    pub stream_id: StreamId,
    pub owner: SessionId,
    pub kind: MediaKind,
    /// Sorted by rank, base layer first
    pub layers: Vec<LayerDescriptor>,
}

struct Participant {
    participant_id: ParticipantId,
    session: Arc<Session>,
    joined_at: DateTime<Utc>,
}

struct Subscription {
    subscriber: SessionId,
    stream_id: StreamId,
    constraints: ReceiverConstraints,
    state: SubscriptionState,
    switch: SwitchController,
    forwarder: Arc<Forwarder>,
}

impl Subscription {
    fn info(&self, subscription_id: SubscriptionId) -> SubscriptionInfo {
        SubscriptionInfo {
            subscription_id,
            session_id: self.subscriber,
            stream_id: self.stream_id,
            state: self.state,
            current_layer: self.forwarder.current_layer(),
            target_layer: self.forwarder.target_layer(),
        }
    }
}

#[derive(Default)]
struct Topology {
    participants: HashMap<SessionId, Participant>,
    streams: HashMap<StreamId, InboundStream>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

struct Room {
    id: RoomId,
    created_at: DateTime<Utc>,
    topology: Mutex<Topology>,
}

/// Keyframe the control plane should ask a sender for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeNeed {
    pub stream_id: StreamId,
    pub layer: LayerId,
    pub reason: KeyframeReason,
}

/// Registry statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryStats {
    pub rooms: usize,
    pub participants: usize,
    pub streams: usize,
    pub subscriptions: usize,
    pub pending_subscriptions: usize,
}

/// Room summary for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<ParticipantSummary>,
    pub streams: usize,
    pub subscriptions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    pub state: SessionState,
    pub joined_at: DateTime<Utc>,
}

/// Components the registry wires together on every topology change
pub struct Components {
    pub transport: Arc<TransportManager>,
    pub demux: Arc<Demuxer>,
    pub router: Arc<Router>,
    pub recovery: Arc<RecoveryCoordinator>,
    pub bwe: Arc<BandwidthEstimator>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

pub struct Registry {
    limits: LimitsConfig,
    selector: SelectorConfig,
    parts: Components,
    rooms: DashMap<RoomId, Arc<Room>>,
    session_rooms: DashMap<SessionId, RoomId>,
    stream_rooms: DashMap<StreamId, RoomId>,
    subscription_rooms: DashMap<SubscriptionId, RoomId>,
    events: broadcast::Sender<SubscriptionEvent>,
}

/// Check announced layers and return them sorted by rank
fn validate_layers(layers: &[LayerDescriptor], max_layers: usize) -> SfuResult<Vec<LayerDescriptor>> {
    if layers.is_empty() {
        return Err(SfuError::Protocol("stream announces no layers".to_string()));
    }
    if max_layers > 0 && layers.len() > max_layers {
        return Err(SfuError::Capacity(format!(
            "stream announces {} layers, limit is {max_layers}",
            layers.len()
        )));
    }
    let mut sorted = layers.to_vec();
    sorted.sort_by_key(LayerDescriptor::rank);
    if sorted[0].rank() != (0, 0) {
        return Err(SfuError::Protocol("base layer must have rank 0".to_string()));
    }
    for pair in sorted.windows(2) {
        if pair[0].rank() == pair[1].rank() {
            return Err(SfuError::Protocol(format!(
                "layers {} and {} share a rank",
                pair[0].layer_id, pair[1].layer_id
            )));
        }
    }
    for (i, layer) in sorted.iter().enumerate() {
        if sorted[..i]
            .iter()
            .any(|l| l.layer_id == layer.layer_id || l.ssrc == layer.ssrc)
        {
            return Err(SfuError::Protocol(format!(
                "layer {} repeats a layer id or SSRC",
                layer.layer_id
            )));
        }
    }
    Ok(sorted)
}

impl Registry {
    #[must_use]
    pub fn new(limits: LimitsConfig, selector: SelectorConfig, parts: Components) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            limits,
            selector,
            parts,
            rooms: DashMap::new(),
            session_rooms: DashMap::new(),
            stream_rooms: DashMap::new(),
            subscription_rooms: DashMap::new(),
            events,
        }
    }

    /// Subscription status changes
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.events.subscribe()
    }

    fn publish(&self, subscription_id: SubscriptionId, status: SubscriptionState, layer: Option<LayerId>) {
        // No listeners is fine
        let _ = self.events.send(SubscriptionEvent {
            subscription_id,
            status,
            layer,
        });
    }

    fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    fn room_of_session(&self, session_id: SessionId) -> SfuResult<Arc<Room>> {
        self.session_rooms
            .get(&session_id)
            .and_then(|room_id| self.room(room_id.value()))
            .ok_or(SfuError::StaleState(StaleRef::Session(session_id)))
    }

    fn check_capacity(&self, room_id: &RoomId) -> SfuResult<()> {
        match self.room(room_id) {
            Some(room) => {
                let participants = room.topology.lock().participants.len();
                let max = self.limits.max_participants_per_room;
                if max > 0 && participants >= max {
                    warn!(room_id = %room_id, participants, max, "Participant limit reached");
                    return Err(SfuError::Capacity(format!(
                        "room {room_id} is full ({max} participants)"
                    )));
                }
            }
            None => {
                let max = self.limits.max_rooms;
                if max > 0 && self.rooms.len() >= max {
                    warn!(rooms = self.rooms.len(), max, "Room limit reached");
                    return Err(SfuError::Capacity(format!("room limit of {max} reached")));
                }
            }
        }
        Ok(())
    }

    /// Establish a transport session for a participant and add it to a room.
    ///
    /// Establishment is retried up to `connect_attempts` times on check
    /// failures; every attempt gets a fresh session id.
    pub async fn connect(
        &self,
        room_id: RoomId,
        participant_id: ParticipantId,
        params: ConnectivityParams,
    ) -> SfuResult<SessionId> {
        self.check_capacity(&room_id)?;

        let attempts = self.limits.connect_attempts.max(1);
        let mut attempt = 0;
        let session = loop {
            attempt += 1;
            match self.parts.transport.open(params.clone()).await {
                Ok(session) => break session,
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        room_id = %room_id,
                        participant_id = %participant_id,
                        attempt,
                        error = %e,
                        "Connect attempt failed, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.admit(room_id, participant_id, session, Instant::now())
    }

    /// Add an established session to a room
    pub(crate) fn admit(
        &self,
        room_id: RoomId,
        participant_id: ParticipantId,
        session: Arc<Session>,
        now: Instant,
    ) -> SfuResult<SessionId> {
        let session_id = session.id();
        let max_rooms = self.limits.max_rooms;
        // Counted before taking the entry, which holds a shard lock
        let rooms_full = max_rooms > 0 && self.rooms.len() >= max_rooms;

        // The participant is seated while the entry guard is held, so a
        // concurrent teardown cannot remove the room in between
        let replaced = match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(entry) => self.seat(entry.get(), &participant_id, session)?,
            Entry::Vacant(slot) => {
                if rooms_full {
                    drop(slot);
                    self.close_session(&session);
                    return Err(SfuError::Capacity(format!("room limit of {max_rooms} reached")));
                }
                let room = Arc::new(Room {
                    id: room_id.clone(),
                    created_at: Utc::now(),
                    topology: Mutex::new(Topology::default()),
                });
                let replaced = self.seat(&room, &participant_id, session)?;
                slot.insert(room);
                info!(room_id = %room_id, "Room created");
                replaced
            }
        };
        self.session_rooms.insert(session_id, room_id.clone());
        self.parts.bwe.register(session_id, now);

        info!(
            room_id = %room_id,
            participant_id = %participant_id,
            session_id = %session_id,
            "Participant joined"
        );

        // A reconnect supersedes the participant's previous session
        if let Some(previous) = replaced {
            debug!(session_id = %previous, "Tearing down superseded session");
            self.teardown_session(previous)?;
        }
        Ok(session_id)
    }

    /// Insert a participant into a room's topology, returning the session it
    /// supersedes
    fn seat(
        &self,
        room: &Room,
        participant_id: &ParticipantId,
        session: Arc<Session>,
    ) -> SfuResult<Option<SessionId>> {
        let mut topology = room.topology.lock();
        let max = self.limits.max_participants_per_room;
        if max > 0 && topology.participants.len() >= max {
            drop(topology);
            self.close_session(&session);
            return Err(SfuError::Capacity(format!(
                "room {} is full ({max} participants)",
                room.id
            )));
        }
        let replaced = topology
            .participants
            .iter()
            .find(|(_, p)| &p.participant_id == participant_id)
            .map(|(id, _)| *id);
        topology.participants.insert(
            session.id(),
            Participant {
                participant_id: participant_id.clone(),
                session,
                joined_at: Utc::now(),
            },
        );
        Ok(replaced)
    }

    fn close_session(&self, session: &Session) {
        if !self.parts.transport.close(session.id()) {
            session.transition(SessionState::Closed);
            session.cancel_token().cancel();
        }
    }

    /// Register a sender's stream and its layers
    pub fn announce_stream(&self, announcement: StreamAnnouncement) -> SfuResult<()> {
        let StreamAnnouncement {
            session_id,
            stream_id,
            kind,
            layers,
        } = announcement;
        let layers = validate_layers(&layers, self.limits.max_layers_per_stream)?;
        let room = self.room_of_session(session_id)?;

        let mut topology = room.topology.lock();
        if !topology.participants.contains_key(&session_id) {
            return Err(SfuError::StaleState(StaleRef::Session(session_id)));
        }
        match self.stream_rooms.entry(stream_id) {
            Entry::Occupied(_) => {
                return Err(SfuError::Protocol(format!("stream {stream_id} already announced")));
            }
            Entry::Vacant(slot) => {
                slot.insert(room.id.clone());
            }
        }

        for layer in &layers {
            if !self.parts.demux.register(layer.ssrc, stream_id, layer.layer_id, session_id) {
                self.parts.demux.unregister_stream(stream_id);
                self.stream_rooms.remove(&stream_id);
                return Err(SfuError::Protocol(format!(
                    "SSRC {} is already in use",
                    layer.ssrc
                )));
            }
        }
        if let Err(e) = self.parts.router.add_stream(stream_id, kind, &layers) {
            self.parts.demux.unregister_stream(stream_id);
            self.stream_rooms.remove(&stream_id);
            return Err(e);
        }

        info!(
            room_id = %room.id,
            session_id = %session_id,
            stream_id = %stream_id,
            kind = ?kind,
            layers = layers.len(),
            "Stream announced"
        );
        topology.streams.insert(
            stream_id,
            InboundStream {
                stream_id,
                owner: session_id,
                kind,
                layers,
            },
        );
        Ok(())
    }

    /// Subscribe a session to a stream in its room
    pub fn join(
        &self,
        session_id: SessionId,
        stream_id: StreamId,
        constraints: ReceiverConstraints,
    ) -> SfuResult<SubscriptionInfo> {
        let room = self.room_of_session(session_id)?;
        let mut topology = room.topology.lock();

        let session = topology
            .participants
            .get(&session_id)
            .map(|p| Arc::clone(&p.session))
            .ok_or(SfuError::StaleState(StaleRef::Session(session_id)))?;
        let stream = topology
            .streams
            .get(&stream_id)
            .ok_or(SfuError::StaleState(StaleRef::Stream(stream_id)))?;
        if stream.owner == session_id {
            return Err(SfuError::Protocol(format!(
                "session {session_id} cannot subscribe to its own stream"
            )));
        }

        let existing = topology
            .subscriptions
            .values()
            .filter(|s| s.stream_id == stream_id)
            .count();
        let max = self.limits.max_subscriptions_per_stream;
        if max > 0 && existing >= max {
            warn!(stream_id = %stream_id, subscriptions = existing, max, "Subscription limit reached");
            return Err(SfuError::Capacity(format!(
                "stream {stream_id} has {max} subscriptions"
            )));
        }

        let subscription_id = SubscriptionId::new();
        let forwarder = self.parts.router.subscribe(subscription_id, stream_id, session)?;
        let subscription = Subscription {
            subscriber: session_id,
            stream_id,
            constraints,
            state: SubscriptionState::Pending,
            switch: SwitchController::new(),
            forwarder,
        };
        let info = subscription.info(subscription_id);
        topology.subscriptions.insert(subscription_id, subscription);
        self.subscription_rooms.insert(subscription_id, room.id.clone());
        drop(topology);

        info!(
            room_id = %room.id,
            session_id = %session_id,
            stream_id = %stream_id,
            subscription_id = %subscription_id,
            "Subscription created"
        );
        self.publish(subscription_id, SubscriptionState::Pending, None);
        Ok(info)
    }

    /// End a subscription
    pub fn leave(&self, subscription_id: SubscriptionId) -> SfuResult<()> {
        let room = self
            .subscription_rooms
            .remove(&subscription_id)
            .and_then(|(_, room_id)| self.room(&room_id))
            .ok_or(SfuError::StaleState(StaleRef::Subscription(subscription_id)))?;
        let removed = room.topology.lock().subscriptions.remove(&subscription_id);
        if removed.is_none() {
            return Err(SfuError::StaleState(StaleRef::Subscription(subscription_id)));
        }
        self.parts.router.unsubscribe(subscription_id);
        debug!(subscription_id = %subscription_id, "Subscription closed");
        self.publish(subscription_id, SubscriptionState::Closed, None);
        Ok(())
    }

    /// Tear a session down with everything depending on it.
    ///
    /// Subscriptions of and to the session close, its streams stop being
    /// routed and demultiplexed, pending recovery is cancelled, estimator
    /// state is dropped, and finally the transport session closes. Calling
    /// it again is a no-op.
    pub fn teardown_session(&self, session_id: SessionId) -> SfuResult<()> {
        let Some((_, room_id)) = self.session_rooms.remove(&session_id) else {
            // Not (or no longer) in a room; make sure the transport is gone too
            self.parts.transport.close(session_id);
            return Ok(());
        };
        let Some(room) = self.room(&room_id) else {
            self.parts.transport.close(session_id);
            return Ok(());
        };

        let (participant, subscriptions, streams) = {
            let mut topology = room.topology.lock();
            let participant = topology.participants.remove(&session_id);
            let streams: Vec<StreamId> = topology
                .streams
                .iter()
                .filter(|(_, s)| s.owner == session_id)
                .map(|(id, _)| *id)
                .collect();
            for stream_id in &streams {
                topology.streams.remove(stream_id);
            }
            let subscriptions: Vec<SubscriptionId> = topology
                .subscriptions
                .iter()
                .filter(|(_, s)| s.subscriber == session_id || streams.contains(&s.stream_id))
                .map(|(id, _)| *id)
                .collect();
            for subscription_id in &subscriptions {
                topology.subscriptions.remove(subscription_id);
            }
            (participant, subscriptions, streams)
        };

        for subscription_id in &subscriptions {
            self.subscription_rooms.remove(subscription_id);
            self.parts.router.unsubscribe(*subscription_id);
            self.publish(*subscription_id, SubscriptionState::Closed, None);
        }
        for stream_id in &streams {
            self.parts.router.remove_stream(*stream_id);
            self.parts.demux.unregister_stream(*stream_id);
            self.parts.recovery.cancel_stream(*stream_id);
            self.stream_rooms.remove(stream_id);
        }
        self.parts.bwe.remove(&session_id);
        match participant {
            Some(participant) => self.close_session(&participant.session),
            None => {
                self.parts.transport.close(session_id);
            }
        }

        self.rooms
            .remove_if(&room_id, |_, room| room.topology.lock().participants.is_empty());

        self.parts.telemetry.event(&TelemetryEvent::SessionTeardown {
            session_id,
            subscriptions_closed: subscriptions.len(),
            streams_removed: streams.len(),
        });
        Ok(())
    }

    /// Sender session and SSRC of a stream layer
    #[must_use]
    pub fn layer_source(&self, stream_id: StreamId, layer: LayerId) -> Option<(Arc<Session>, u32)> {
        let room_id = self.stream_rooms.get(&stream_id)?.value().clone();
        let room = self.room(&room_id)?;
        let topology = room.topology.lock();
        let stream = topology.streams.get(&stream_id)?;
        let ssrc = stream.layers.iter().find(|l| l.layer_id == layer)?.ssrc;
        let session = Arc::clone(&topology.participants.get(&stream.owner)?.session);
        Some((session, ssrc))
    }

    #[must_use]
    pub fn stream(&self, stream_id: StreamId) -> Option<InboundStream> {
        let room_id = self.stream_rooms.get(&stream_id)?.value().clone();
        let room = self.room(&room_id)?;
        let topology = room.topology.lock();
        topology.streams.get(&stream_id).cloned()
    }

    #[must_use]
    pub fn subscription(&self, subscription_id: SubscriptionId) -> Option<SubscriptionInfo> {
        let room_id = self.subscription_rooms.get(&subscription_id)?.value().clone();
        let room = self.room(&room_id)?;
        let topology = room.topology.lock();
        topology
            .subscriptions
            .get(&subscription_id)
            .map(|s| s.info(subscription_id))
    }

    /// Every participant session across all rooms
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.rooms_snapshot()
            .iter()
            .flat_map(|room| {
                room.topology
                    .lock()
                    .participants
                    .values()
                    .map(|p| Arc::clone(&p.session))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn rooms_snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// One allocation pass: pick each subscription's layer from its share
    /// of the receiver's estimate, drive the switch state machines, and
    /// report the keyframes needed to complete pending switches
    pub fn allocate(&self, now: Instant) -> Vec<KeyframeNeed> {
        let fallback_bps = self.parts.bwe.config().initial_bitrate_bps;
        let mut needs = Vec::new();
        let mut events = Vec::new();
        let mut activated = Vec::new();

        for room in self.rooms_snapshot() {
            let mut topology = room.topology.lock();
            let Topology {
                streams,
                subscriptions,
                ..
            } = &mut *topology;

            let mut per_receiver: HashMap<SessionId, usize> = HashMap::new();
            for sub in subscriptions.values() {
                *per_receiver.entry(sub.subscriber).or_default() += 1;
            }

            for (subscription_id, sub) in subscriptions.iter_mut() {
                let Some(stream) = streams.get(&sub.stream_id) else {
                    continue;
                };
                let previous = sub.switch.current();
                let forwarded = sub.forwarder.current_layer();
                if sub.switch.observe(forwarded, now) {
                    if let Some(to) = forwarded {
                        events.push(TelemetryEvent::LayerSwitch {
                            subscription_id: *subscription_id,
                            stream_id: sub.stream_id,
                            from: previous,
                            to,
                        });
                    }
                    if sub.state == SubscriptionState::Pending {
                        sub.state = SubscriptionState::Active;
                        activated.push((*subscription_id, forwarded));
                    }
                }

                let estimate = self
                    .parts
                    .bwe
                    .current_estimate(&sub.subscriber)
                    .map_or(fallback_bps, |e| e.bitrate_bps);
                let receivers_subs = per_receiver.get(&sub.subscriber).copied().unwrap_or(1);
                let budget = subscription_budget(estimate, receivers_subs);
                if let Some(target) = select_layer(&stream.layers, budget, &sub.constraints) {
                    let action = sub.switch.request(&stream.layers, target, now, &self.selector);
                    Self::apply_switch(&sub.forwarder, action, stream.stream_id, &mut needs);
                }

                match sub.switch.poll(now, &self.selector) {
                    Ok(action) => Self::apply_switch(&sub.forwarder, action, stream.stream_id, &mut needs),
                    Err(e) => {
                        warn!(
                            subscription_id = %subscription_id,
                            stream_id = %stream.stream_id,
                            target = ?sub.switch.pending(),
                            error = %e,
                            "Layer switch timed out, requesting keyframe again"
                        );
                        if let Some(layer) = sub.switch.pending() {
                            needs.push(KeyframeNeed {
                                stream_id: stream.stream_id,
                                layer,
                                reason: KeyframeReason::SwitchTimeout,
                            });
                        }
                    }
                }
            }
        }

        for event in &events {
            self.parts.telemetry.event(event);
        }
        for (subscription_id, layer) in activated {
            self.publish(subscription_id, SubscriptionState::Active, layer);
        }
        needs
    }

    fn apply_switch(forwarder: &Forwarder, action: SwitchAction, stream_id: StreamId, needs: &mut Vec<KeyframeNeed>) {
        match action {
            SwitchAction::Idle => {}
            SwitchAction::Arm(layer) => {
                forwarder.set_target(Some(layer));
                needs.push(KeyframeNeed {
                    stream_id,
                    layer,
                    reason: KeyframeReason::LayerSwitch,
                });
            }
            SwitchAction::Cancel => forwarder.set_target(None),
        }
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<RoomSummary> {
        self.rooms_snapshot()
            .iter()
            .map(|room| {
                let topology = room.topology.lock();
                RoomSummary {
                    room_id: room.id.clone(),
                    created_at: room.created_at,
                    participants: topology
                        .participants
                        .iter()
                        .map(|(session_id, p)| ParticipantSummary {
                            participant_id: p.participant_id.clone(),
                            session_id: *session_id,
                            state: p.session.state(),
                            joined_at: p.joined_at,
                        })
                        .collect(),
                    streams: topology.streams.len(),
                    subscriptions: topology.subscriptions.len(),
                }
            })
            .collect()
    }

    #[must_use]
    pub fn get_stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            rooms: self.rooms.len(),
            ..Default::default()
        };
        for room in self.rooms_snapshot() {
            let topology = room.topology.lock();
            stats.participants += topology.participants.len();
            stats.streams += topology.streams.len();
            stats.subscriptions += topology.subscriptions.len();
            stats.pending_subscriptions += topology
                .subscriptions
                .values()
                .filter(|s| s.state == SubscriptionState::Pending)
                .count();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::{BweConfig, RecoveryConfig, RtpExtensionConfig, TransportConfig};
    use crate::router::tests::media;
    use crate::transport::session::tests::session;

    struct Fixture {
        registry: Registry,
        router: Arc<Router>,
        demux: Arc<Demuxer>,
        bwe: Arc<BandwidthEstimator>,
    }

    async fn fixture(limits: LimitsConfig) -> Fixture {
        let transport = TransportManager::bind(
            TransportConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let demux = Arc::new(Demuxer::new(RtpExtensionConfig::default()));
        let router = Arc::new(Router::new(RtpExtensionConfig::default(), RecoveryConfig::default()));
        let recovery = Arc::new(RecoveryCoordinator::new(RecoveryConfig::default(), Arc::clone(&router)));
        let bwe = Arc::new(BandwidthEstimator::new(BweConfig::default()));
        let registry = Registry::new(
            limits,
            SelectorConfig::default(),
            Components {
                transport,
                demux: Arc::clone(&demux),
                router: Arc::clone(&router),
                recovery,
                bwe: Arc::clone(&bwe),
                telemetry: Arc::new(crate::telemetry::TracingTelemetry),
            },
        );
        Fixture {
            registry,
            router,
            demux,
            bwe,
        }
    }

    fn layers() -> Vec<LayerDescriptor> {
        crate::router::tests::simulcast()
    }

    async fn admit(fx: &Fixture, room: &str, participant: &str) -> SessionId {
        let session = Arc::new(session().await);
        fx.registry
            .admit(RoomId::from(room), ParticipantId::from(participant), session, Instant::now())
            .unwrap()
    }

    fn announce(fx: &Fixture, session_id: SessionId, stream: u32) -> SfuResult<()> {
        fx.registry.announce_stream(StreamAnnouncement {
            session_id,
            stream_id: StreamId::new(stream),
            kind: MediaKind::Video,
            layers: layers(),
        })
    }

    #[test]
    fn test_layer_validation() {
        assert!(validate_layers(&layers(), 4).is_ok());
        assert!(matches!(validate_layers(&[], 4), Err(SfuError::Protocol(_))));
        assert!(matches!(validate_layers(&layers(), 2), Err(SfuError::Capacity(_))));

        let mut no_base = layers();
        no_base.remove(0);
        assert!(matches!(validate_layers(&no_base, 4), Err(SfuError::Protocol(_))));

        let mut shared_rank = layers();
        shared_rank[2].spatial_rank = 1;
        assert!(matches!(validate_layers(&shared_rank, 4), Err(SfuError::Protocol(_))));

        let mut reversed = layers();
        reversed.reverse();
        let sorted = validate_layers(&reversed, 4).unwrap();
        assert_eq!(sorted[0].layer_id, LayerId::new(0));
    }

    #[tokio::test]
    async fn test_participant_limit() {
        let fx = fixture(LimitsConfig {
            max_participants_per_room: 1,
            ..Default::default()
        })
        .await;
        admit(&fx, "room", "alice").await;
        let session = Arc::new(session().await);
        let err = fx
            .registry
            .admit(RoomId::from("room"), ParticipantId::from("bob"), session.clone(), Instant::now())
            .unwrap_err();
        assert!(matches!(err, SfuError::Capacity(_)));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_room_limit() {
        let fx = fixture(LimitsConfig {
            max_rooms: 1,
            ..Default::default()
        })
        .await;
        admit(&fx, "one", "alice").await;
        let session = Arc::new(session().await);
        let err = fx
            .registry
            .admit(RoomId::from("two"), ParticipantId::from("bob"), session, Instant::now())
            .unwrap_err();
        assert!(matches!(err, SfuError::Capacity(_)));
    }

    #[tokio::test]
    async fn test_admit_racing_last_teardown_keeps_room_registered() {
        let fx = fixture(LimitsConfig::default()).await;
        for _ in 0..32 {
            let first = admit(&fx, "room", "alice").await;
            let session = Arc::new(session().await);
            let joined = std::thread::scope(|scope| {
                scope.spawn(|| fx.registry.teardown_session(first).unwrap());
                scope
                    .spawn(|| {
                        fx.registry
                            .admit(RoomId::from("room"), ParticipantId::from("bob"), session, Instant::now())
                            .unwrap()
                    })
                    .join()
                    .unwrap()
            });

            let rooms = fx.registry.rooms();
            assert_eq!(rooms.len(), 1);
            assert_eq!(rooms[0].participants.len(), 1);
            assert_eq!(rooms[0].participants[0].participant_id, ParticipantId::from("bob"));
            assert!(fx.registry.room_of_session(joined).is_ok());

            fx.registry.teardown_session(joined).unwrap();
            assert!(fx.registry.rooms().is_empty());
        }
    }

    #[tokio::test]
    async fn test_announce_and_join() {
        let fx = fixture(LimitsConfig::default()).await;
        let sender = admit(&fx, "room", "alice").await;
        let receiver = admit(&fx, "room", "bob").await;
        announce(&fx, sender, 1).unwrap();
        assert!(matches!(announce(&fx, sender, 1), Err(SfuError::Protocol(_))));
        assert_eq!(fx.demux.route_count(), 3);

        let mut events = fx.registry.subscribe_events();
        let info = fx
            .registry
            .join(receiver, StreamId::new(1), ReceiverConstraints::default())
            .unwrap();
        assert_eq!(info.state, SubscriptionState::Pending);
        assert_eq!(events.try_recv().unwrap().status, SubscriptionState::Pending);

        assert!(matches!(
            fx.registry.join(sender, StreamId::new(1), ReceiverConstraints::default()),
            Err(SfuError::Protocol(_))
        ));
        assert!(matches!(
            fx.registry.join(receiver, StreamId::new(9), ReceiverConstraints::default()),
            Err(SfuError::StaleState(StaleRef::Stream(_)))
        ));
        let (_, ssrc) = fx.registry.layer_source(StreamId::new(1), LayerId::new(2)).unwrap();
        assert_eq!(ssrc, 102);
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let fx = fixture(LimitsConfig {
            max_subscriptions_per_stream: 1,
            ..Default::default()
        })
        .await;
        let sender = admit(&fx, "room", "alice").await;
        let bob = admit(&fx, "room", "bob").await;
        let carol = admit(&fx, "room", "carol").await;
        announce(&fx, sender, 1).unwrap();
        fx.registry.join(bob, StreamId::new(1), ReceiverConstraints::default()).unwrap();
        assert!(matches!(
            fx.registry.join(carol, StreamId::new(1), ReceiverConstraints::default()),
            Err(SfuError::Capacity(_))
        ));
    }

    #[tokio::test]
    async fn test_allocation_activates_on_keyframe() {
        let fx = fixture(LimitsConfig::default()).await;
        let sender = admit(&fx, "room", "alice").await;
        let receiver = admit(&fx, "room", "bob").await;
        announce(&fx, sender, 1).unwrap();
        let info = fx
            .registry
            .join(receiver, StreamId::new(1), ReceiverConstraints::default())
            .unwrap();
        let mut events = fx.registry.subscribe_events();

        // Initial estimate of 300 kbps fits only the base layer
        let t0 = Instant::now();
        let needs = fx.registry.allocate(t0);
        assert_eq!(
            needs,
            vec![KeyframeNeed {
                stream_id: StreamId::new(1),
                layer: LayerId::new(0),
                reason: KeyframeReason::LayerSwitch,
            }]
        );
        assert_eq!(fx.registry.subscription(info.subscription_id).unwrap().target_layer, Some(LayerId::new(0)));

        fx.router
            .on_ready_packet(StreamId::new(1), LayerId::new(0), &media(100, 1, 0, true), t0);
        assert!(fx.registry.allocate(t0 + Duration::from_millis(20)).is_empty());
        let info = fx.registry.subscription(info.subscription_id).unwrap();
        assert_eq!(info.state, SubscriptionState::Active);
        assert_eq!(info.current_layer, Some(LayerId::new(0)));
        let event = events.try_recv().unwrap();
        assert_eq!(event.status, SubscriptionState::Active);
        assert_eq!(event.layer, Some(LayerId::new(0)));
    }

    #[tokio::test]
    async fn test_teardown_cascades_and_is_idempotent() {
        let fx = fixture(LimitsConfig::default()).await;
        let sender = admit(&fx, "room", "alice").await;
        let receiver = admit(&fx, "room", "bob").await;
        announce(&fx, sender, 1).unwrap();
        let info = fx
            .registry
            .join(receiver, StreamId::new(1), ReceiverConstraints::default())
            .unwrap();
        let mut events = fx.registry.subscribe_events();

        fx.registry.teardown_session(sender).unwrap();
        let after_first = fx.registry.get_stats();
        assert_eq!(after_first.streams, 0);
        assert_eq!(after_first.subscriptions, 0);
        assert_eq!(after_first.participants, 1);
        assert!(fx.registry.subscription(info.subscription_id).is_none());
        assert!(fx.router.forwarder(info.subscription_id).is_none());
        assert!(fx.router.stream(StreamId::new(1)).is_none());
        assert_eq!(fx.demux.route_count(), 0);
        assert!(fx.bwe.current_estimate(&sender).is_none());
        assert_eq!(events.try_recv().unwrap().status, SubscriptionState::Closed);

        fx.registry.teardown_session(sender).unwrap();
        let after_second = fx.registry.get_stats();
        assert_eq!(after_first.participants, after_second.participants);
        assert!(events.try_recv().is_err());

        assert!(matches!(
            fx.registry.announce_stream(StreamAnnouncement {
                session_id: sender,
                stream_id: StreamId::new(2),
                kind: MediaKind::Audio,
                layers: layers(),
            }),
            Err(SfuError::StaleState(StaleRef::Session(_)))
        ));

        fx.registry.teardown_session(receiver).unwrap();
        assert_eq!(fx.registry.get_stats().rooms, 0);
    }

    #[tokio::test]
    async fn test_leave() {
        let fx = fixture(LimitsConfig::default()).await;
        let sender = admit(&fx, "room", "alice").await;
        let receiver = admit(&fx, "room", "bob").await;
        announce(&fx, sender, 1).unwrap();
        let info = fx
            .registry
            .join(receiver, StreamId::new(1), ReceiverConstraints::default())
            .unwrap();
        fx.registry.leave(info.subscription_id).unwrap();
        assert!(fx.router.forwarder(info.subscription_id).is_none());
        assert!(matches!(
            fx.registry.leave(info.subscription_id),
            Err(SfuError::StaleState(StaleRef::Subscription(_)))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_previous_session() {
        let fx = fixture(LimitsConfig::default()).await;
        let first = admit(&fx, "room", "alice").await;
        let second = admit(&fx, "room", "alice").await;
        assert_ne!(first, second);
        let stats = fx.registry.get_stats();
        assert_eq!(stats.participants, 1);
        assert!(fx.bwe.current_estimate(&first).is_none());
        assert!(fx.bwe.current_estimate(&second).is_some());
    }
}
