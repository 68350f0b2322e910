use std::time::Duration;

use thiserror::Error;

use crate::types::{SessionId, StreamId, SubscriptionId};

/// Errors surfaced by control-plane operations of the SFU core.
///
/// Hot-path failures (malformed datagrams, stale references) never reach this
/// type; they are dropped and counted in [`crate::PipelineStats`].
#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Connectivity error: {0}")]
    Connectivity(#[from] ConnectivityError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Timed out after {elapsed:?}: {operation}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("Stale state: {0}")]
    StaleState(StaleRef),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// The torn-down object an operation referred to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleRef {
    Session(SessionId),
    Stream(StreamId),
    Subscription(SubscriptionId),
}

impl std::fmt::Display for StaleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session {id} no longer exists"),
            Self::Stream(id) => write!(f, "stream {id} no longer exists"),
            Self::Subscription(id) => write!(f, "subscription {id} no longer exists"),
        }
    }
}

/// No viable transport path could be established
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("no remote candidates supplied")]
    NoCandidates,

    #[error("all {attempts} candidate pair checks failed")]
    ChecksFailed { attempts: usize },

    #[error("connectivity checks exceeded {0:?}")]
    DeadlineExceeded(Duration),

    #[error("invalid keying material: {0}")]
    InvalidKeys(String),

    #[error("transport is shutting down")]
    ShuttingDown,
}

impl ConnectivityError {
    /// Whether a fresh establishment attempt could succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ChecksFailed { .. } | Self::DeadlineExceeded(_))
    }
}

/// Outcome of a non-blocking send that did not complete
#[derive(Error, Debug)]
pub enum SendError {
    /// The socket buffer is full; the caller decides whether to drop or requeue
    #[error("send would block")]
    WouldBlock,

    #[error("session is closed")]
    Closed,

    #[error("packet protection failed")]
    Protect,

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for SendError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Self::WouldBlock
        } else {
            Self::Io(err)
        }
    }
}

impl SfuError {
    /// Short machine-readable kind, used as a metric label and by the
    /// signaling boundary to translate errors for end users.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connectivity(_) => "connectivity",
            Self::Protocol(_) => "protocol",
            Self::Capacity(_) => "capacity",
            Self::Timeout { .. } => "timeout",
            Self::StaleState(_) => "stale_state",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
        }
    }
}

pub type SfuResult<T> = Result<T, SfuError>;
