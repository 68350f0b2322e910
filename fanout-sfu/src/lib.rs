//! Fanout SFU (Selective Forwarding Unit) core
//!
//! Receives encrypted media from many senders on one UDP socket and forwards,
//! per receiver, the encoded layer that receiver's downlink can carry.
//!
//! ## Architecture
//!
//! - **`TransportManager`** / **`Session`**: connectivity checks, SRTP, liveness
//! - **`Demuxer`**: first-byte classification and SSRC routing
//! - **`JitterBuffer`**: reordering and hole detection per stream layer
//! - **`BandwidthEstimator`**: delay-gradient and loss based downlink estimate
//! - **`select_layer`** / **`SwitchController`**: layer choice and switch damping
//! - **`Router`** / **`Forwarder`**: header rewriting and fan-out
//! - **`RecoveryCoordinator`**: NACK versus keyframe decisions
//! - **`Registry`**: rooms, streams, subscriptions and teardown
//! - **`Sfu`**: the engine wiring all of the above to background tasks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fanout_sfu::{Sfu, SfuConfig, TracingTelemetry};
//!
//! let sfu = Sfu::start(SfuConfig::default(), Arc::new(TracingTelemetry), cancel).await?;
//! let session_id = sfu.registry().connect(room_id, participant_id, params).await?;
//! sfu.registry().announce_stream(announcement)?;
//! ```

pub mod bwe;
pub mod config;
pub mod demux;
mod engine;
pub mod error;
pub mod jitter;
pub mod packet;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod selector;
pub mod seq;
pub mod telemetry;
pub mod transport;
mod types;

/// Largest datagram read from or written to the media socket
pub const MAX_DATAGRAM: usize = 2048;

pub use bwe::{BandwidthEstimate, BandwidthEstimator, Trend};
pub use config::SfuConfig;
pub use demux::{Classified, Demuxer, DropReason};
pub use engine::{PipelineStats, Sfu, SfuStats};
pub use error::{ConnectivityError, SendError, SfuError, SfuResult, StaleRef};
pub use jitter::JitterBuffer;
pub use recovery::{RecoveryAction, RecoveryCoordinator, RecoveryWindow};
pub use registry::{
    Registry, StreamAnnouncement, SubscriptionEvent, SubscriptionInfo, SubscriptionState,
};
pub use router::{Forwarder, MediaSink, Router};
pub use selector::{select_layer, ReceiverConstraints, SwitchController};
pub use telemetry::{
    KeyframeReason, SessionSnapshot, TelemetryEvent, TelemetryFanout, TelemetrySink,
    TracingTelemetry,
};
pub use transport::{
    Candidate, CandidateKind, ConnectivityParams, IceCredentials, KeyingMaterial, Session,
    SessionState, SrtpKeys, TransportManager,
};
pub use types::{
    LayerDescriptor, LayerId, MediaKind, ParticipantId, RoomId, SeqRange, SessionId, StreamId,
    SubscriptionId,
};
