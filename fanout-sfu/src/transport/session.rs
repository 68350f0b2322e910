//! Secured transport session
//!
//! This module handles:
//! - Session state and liveness tracking
//! - SRTP protection of everything sent, verification of everything received
//! - Round-trip time smoothing from keepalive exchanges
//! - Per-session transport statistics

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connectivity::{CandidateKind, IceCredentials};
use super::srtp::{SrtpContext, SrtpError, SRTP_TAG_LEN};
use crate::bwe::SendHistory;
use crate::error::SendError;
use crate::types::SessionId;
use crate::MAX_DATAGRAM;

/// Transport-wide sequence numbers remembered for feedback matching
const SEND_HISTORY_CAPACITY: usize = 4096;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Established = 1,
    Stale = 2,
    /// Terminal
    Closed = 3,
}

impl SessionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Established,
            2 => Self::Stale,
            _ => Self::Closed,
        }
    }
}

/// The transport path selected by connectivity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedPath {
    pub remote: SocketAddr,
    pub kind: CandidateKind,
}

/// Session statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Sends refused by kernel backpressure
    pub sends_would_block: u64,
    /// Packets failing SRTP verification
    pub auth_failures: u64,
    pub rtt_ms: Option<f64>,
}

#[derive(Default)]
struct StatsInner {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    sends_would_block: AtomicU64,
    auth_failures: AtomicU64,
}

/// One secured transport endpoint for one participant connection attempt
pub struct Session {
    id: SessionId,
    state: AtomicU8,
    path: RwLock<SelectedPath>,
    credentials: IceCredentials,
    inbound: SrtpContext,
    outbound: SrtpContext,
    socket: Arc<UdpSocket>,

    /// Time base for the atomic timestamps below
    epoch: Instant,
    last_seen_us: AtomicU64,
    /// Smoothed RTT in microseconds; 0 until the first sample
    srtt_us: AtomicU64,

    transport_seq: AtomicU32,
    send_history: SendHistory,
    stats: StatsInner,
    cancel: CancellationToken,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        path: SelectedPath,
        credentials: IceCredentials,
        inbound: SrtpContext,
        outbound: SrtpContext,
        socket: Arc<UdpSocket>,
        cancel: CancellationToken,
        now: Instant,
    ) -> Self {
        Self {
            id,
            state: AtomicU8::new(SessionState::Connecting as u8),
            path: RwLock::new(path),
            credentials,
            inbound,
            outbound,
            socket,
            epoch: now,
            last_seen_us: AtomicU64::new(0),
            srtt_us: AtomicU64::new(0),
            transport_seq: AtomicU32::new(0),
            send_history: SendHistory::new(SEND_HISTORY_CAPACITY),
            stats: StatsInner::default(),
            cancel,
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` unless the session is already closed; returns the
    /// previous state
    pub(crate) fn transition(&self, next: SessionState) -> SessionState {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if SessionState::from_u8(current) == SessionState::Closed {
                return SessionState::Closed;
            }
            match self
                .state
                .compare_exchange_weak(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(previous) => return SessionState::from_u8(previous),
                Err(actual) => current = actual,
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    #[must_use]
    pub fn path(&self) -> SelectedPath {
        *self.path.read()
    }

    pub(crate) fn select_path(&self, path: SelectedPath) {
        *self.path.write() = path;
    }

    #[must_use]
    pub const fn credentials(&self) -> &IceCredentials {
        &self.credentials
    }

    /// Cancelled when the session closes
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub const fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Microseconds since the session epoch, the unit of the send history
    #[must_use]
    pub fn micros_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// Record a valid packet; revives a stale session. Returns true when the
    /// session came back from `Stale`.
    pub fn touch(&self, now: Instant) -> bool {
        self.last_seen_us
            .fetch_max(self.micros_since_epoch(now), Ordering::Relaxed);
        self.state
            .compare_exchange(
                SessionState::Stale as u8,
                SessionState::Established as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[must_use]
    pub fn last_seen(&self) -> Instant {
        self.epoch + Duration::from_micros(self.last_seen_us.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen())
    }

    /// Fold an RTT sample into the smoothed estimate (RFC 6298 weights)
    pub fn update_rtt(&self, sample: Duration) {
        let sample_us = (sample.as_micros() as u64).max(1);
        let previous = self.srtt_us.load(Ordering::Relaxed);
        let next = if previous == 0 {
            sample_us
        } else {
            (previous * 7 + sample_us) / 8
        };
        self.srtt_us.store(next, Ordering::Relaxed);
    }

    #[must_use]
    pub fn rtt(&self) -> Option<Duration> {
        match self.srtt_us.load(Ordering::Relaxed) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    /// Next transport-wide sequence number for packets sent to this session
    pub fn next_transport_seq(&self) -> u16 {
        self.transport_seq.fetch_add(1, Ordering::Relaxed) as u16
    }

    #[must_use]
    pub const fn send_history(&self) -> &SendHistory {
        &self.send_history
    }

    /// Verify and decrypt an inbound SRTP packet in place
    pub fn unprotect_rtp(&self, buf: &mut [u8]) -> Result<usize, SrtpError> {
        self.inbound.unprotect_rtp(buf).inspect_err(|_| {
            self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Verify and decrypt an inbound SRTCP packet in place
    pub fn unprotect_rtcp(&self, buf: &mut [u8]) -> Result<usize, SrtpError> {
        self.inbound.unprotect_rtcp(buf).inspect_err(|_| {
            self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
        })
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_sent(&self, bytes: usize) {
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn try_send(&self, data: &[u8]) -> Result<(), SendError> {
        let remote = self.path.read().remote;
        match self.socket.try_send_to(data, remote) {
            Ok(_) => {
                self.record_sent(data.len());
                Ok(())
            }
            Err(e) => {
                let err = SendError::from(e);
                if matches!(err, SendError::WouldBlock) {
                    self.stats.sends_would_block.fetch_add(1, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }

    /// Protect and send the plaintext RTP packet in `buf[..len]`.
    ///
    /// `buf` must have room for the authentication tag. Never blocks.
    pub fn send_rtp_in_place(&self, buf: &mut [u8], len: usize) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let len = self.outbound.protect_rtp(buf, len).map_err(|_| SendError::Protect)?;
        self.try_send(&buf[..len])
    }

    /// Protect and send a plaintext RTP packet
    pub fn send_rtp(&self, packet: &[u8]) -> Result<(), SendError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        if packet.len() + SRTP_TAG_LEN > buf.len() {
            return Err(SendError::Protect);
        }
        buf[..packet.len()].copy_from_slice(packet);
        self.send_rtp_in_place(&mut buf, packet.len())
    }

    /// Protect and send a plaintext (compound) RTCP packet
    pub fn send_rtcp(&self, packet: &[u8]) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let protected = self.outbound.protect_rtcp(packet).map_err(|_| SendError::Protect)?;
        self.try_send(&protected)
    }

    /// Send an unprotected STUN message to the current remote
    pub fn send_stun(&self, message: &[u8]) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.try_send(message)
    }

    #[must_use]
    pub fn get_stats(&self) -> SessionStats {
        SessionStats {
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            sends_would_block: self.stats.sends_would_block.load(Ordering::Relaxed),
            auth_failures: self.stats.auth_failures.load(Ordering::Relaxed),
            rtt_ms: self.rtt().map(|rtt| rtt.as_secs_f64() * 1000.0),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(
            session_id = %self.id,
            packets_sent = self.stats.packets_sent.load(Ordering::Relaxed),
            packets_received = self.stats.packets_received.load(Ordering::Relaxed),
            "Session dropped"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::srtp::SrtpKeys;

    /// A session on a loopback socket whose remote is the discard port
    pub(crate) async fn session() -> Session {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let keys = SrtpKeys {
            key: [1; 16],
            salt: [2; 12],
        };
        Session::new(
            SessionId::new(),
            SelectedPath {
                remote: "127.0.0.1:9".parse().unwrap(),
                kind: CandidateKind::Host,
            },
            IceCredentials {
                local_ufrag: "a".to_string(),
                local_pwd: "b".to_string(),
                remote_ufrag: "c".to_string(),
                remote_pwd: "d".to_string(),
            },
            SrtpContext::new(&keys).unwrap(),
            SrtpContext::new(&keys).unwrap(),
            Arc::new(socket),
            CancellationToken::new(),
            Instant::now(),
        )
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let session = session().await;
        assert_eq!(session.state(), SessionState::Connecting);
        session.transition(SessionState::Established);
        session.transition(SessionState::Stale);
        assert!(session.touch(Instant::now()));
        assert_eq!(session.state(), SessionState::Established);

        session.transition(SessionState::Closed);
        assert_eq!(session.transition(SessionState::Established), SessionState::Closed);
        assert!(session.is_closed());
        assert!(!session.touch(Instant::now()));
    }

    #[tokio::test]
    async fn test_rtt_smoothing() {
        let session = session().await;
        assert!(session.rtt().is_none());
        session.update_rtt(Duration::from_millis(80));
        assert_eq!(session.rtt(), Some(Duration::from_millis(80)));
        session.update_rtt(Duration::from_millis(160));
        assert_eq!(session.rtt(), Some(Duration::from_millis(90)));
    }

    #[tokio::test]
    async fn test_liveness_timestamps() {
        let session = session().await;
        let later = session.epoch() + Duration::from_millis(500);
        session.touch(later);
        assert_eq!(session.last_seen(), later);
        assert_eq!(session.idle_for(later + Duration::from_secs(1)), Duration::from_secs(1));
        // Older observations never move liveness backwards
        session.touch(session.epoch());
        assert_eq!(session.last_seen(), later);
    }

    #[tokio::test]
    async fn test_closed_session_refuses_sends() {
        let session = session().await;
        session.transition(SessionState::Closed);
        assert!(matches!(session.send_stun(&[0; 20]), Err(SendError::Closed)));
        assert!(matches!(session.send_rtcp(&[0x80; 8]), Err(SendError::Closed)));
    }

    #[tokio::test]
    async fn test_transport_seq_wraps() {
        let session = session().await;
        session.transport_seq.store(u32::from(u16::MAX), Ordering::Relaxed);
        assert_eq!(session.next_transport_seq(), u16::MAX);
        assert_eq!(session.next_transport_seq(), 0);
    }
}
