//! Transport sessions over one shared UDP socket
//!
//! This module provides:
//! - Connectivity establishment against a remote candidate set
//! - ICE-lite answers to the peers' own binding requests
//! - SRTP/SRTCP verification of inbound traffic before it reaches the pipeline
//! - Keepalive round trips and liveness tracking
//! - Non-blocking sends

pub mod connectivity;
pub mod session;
pub mod srtp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use connectivity::{Candidate, CandidateKind, ConnectivityParams, IceCredentials};
pub use session::{SelectedPath, Session, SessionState, SessionStats};
pub use srtp::{KeyingMaterial, SrtpKeys};

use crate::config::TransportConfig;
use crate::demux::PacketFamily;
use crate::error::{ConnectivityError, SendError};
use crate::types::SessionId;
use crate::MAX_DATAGRAM;
use connectivity::{binding_response, verify_integrity, StunAgent, StunOutcome};
use srtp::SrtpContext;

/// Bytes reserved per receive buffer refill
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Receives every verified, decrypted RTP or RTCP datagram
pub trait ReceiveHandler: Send + Sync + 'static {
    fn on_receive(&self, session: &Arc<Session>, packet: Bytes, now: Instant);
}

impl<F> ReceiveHandler for F
where
    F: Fn(&Arc<Session>, Bytes, Instant) + Send + Sync + 'static,
{
    fn on_receive(&self, session: &Arc<Session>, packet: Bytes, now: Instant) {
        self(session, packet, now);
    }
}

/// Transport-level statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransportStats {
    pub sessions: usize,
    pub datagrams_received: u64,
    pub stun_requests_answered: u64,
    /// Media from addresses with no established session
    pub unknown_source: u64,
    pub auth_failures: u64,
    pub unsupported: u64,
    pub recv_errors: u64,
}

#[derive(Default)]
struct StatsInner {
    datagrams_received: AtomicU64,
    stun_requests_answered: AtomicU64,
    unknown_source: AtomicU64,
    auth_failures: AtomicU64,
    unsupported: AtomicU64,
    recv_errors: AtomicU64,
}

/// Sessions whose liveness changed during a check
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    /// Established sessions that went quiet
    pub newly_stale: Vec<SessionId>,
    /// Stale sessions quiet long enough to be torn down
    pub expired: Vec<SessionId>,
}

/// Owns the media socket and every transport session on it
pub struct TransportManager {
    config: TransportConfig,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    sessions: DashMap<SessionId, Arc<Session>>,
    by_addr: DashMap<SocketAddr, SessionId>,
    by_ufrag: DashMap<String, SessionId>,
    agent: StunAgent,
    handler: OnceLock<Arc<dyn ReceiveHandler>>,
    stats: StatsInner,
    cancel: CancellationToken,
}

impl TransportManager {
    /// Bind the media socket
    pub async fn bind(config: TransportConfig, cancel: CancellationToken) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(&config.bind_addr).await?;
        let local_addr = socket.local_addr()?;

        info!(
            bind_addr = %local_addr,
            connect_timeout_ms = config.connect_timeout_ms,
            stale_after_ms = config.stale_after_ms,
            "Media transport bound"
        );

        Ok(Arc::new(Self {
            config,
            socket: Arc::new(socket),
            local_addr,
            sessions: DashMap::new(),
            by_addr: DashMap::new(),
            by_ufrag: DashMap::new(),
            agent: StunAgent::new(),
            handler: OnceLock::new(),
            stats: StatsInner::default(),
            cancel,
        }))
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Install the receiver of decrypted packets. Only the first call wins.
    pub fn on_receive(&self, handler: Arc<dyn ReceiveHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    /// Spawn the receive workers sharing the socket
    pub fn spawn_receivers(self: &Arc<Self>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let manager = Arc::clone(self);
                tokio::spawn(async move { manager.recv_loop(worker).await })
            })
            .collect()
    }

    async fn recv_loop(self: Arc<Self>, worker: usize) {
        let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
        debug!(worker, "Receive worker started");

        loop {
            buf.reserve(MAX_DATAGRAM);
            tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.socket.recv_buf_from(&mut buf) => match result {
                    Ok((_, from)) => {
                        let datagram = buf.split();
                        self.process_datagram(datagram, from, Instant::now());
                    }
                    Err(e) => {
                        // ICMP errors from departed peers surface here on some platforms
                        self.stats.recv_errors.fetch_add(1, Ordering::Relaxed);
                        trace!(worker, error = %e, "Receive failed");
                        buf.clear();
                    }
                }
            }
        }

        debug!(worker, "Receive worker stopped");
    }

    /// Handle one datagram from the socket
    pub fn process_datagram(&self, mut datagram: BytesMut, from: SocketAddr, now: Instant) {
        self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

        let family = PacketFamily::of(&datagram);
        match family {
            PacketFamily::Stun => self.handle_stun(&datagram, from, now),
            PacketFamily::Rtp | PacketFamily::Rtcp => {
                let Some(session) = self.session_by_addr(&from) else {
                    self.stats.unknown_source.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                let result = if family == PacketFamily::Rtp {
                    session.unprotect_rtp(&mut datagram)
                } else {
                    session.unprotect_rtcp(&mut datagram)
                };
                let len = match result {
                    Ok(len) => len,
                    Err(e) => {
                        self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                        trace!(session_id = %session.id(), error = %e, "Dropped unverifiable packet");
                        return;
                    }
                };
                datagram.truncate(len);
                session.record_received(len);
                if session.touch(now) {
                    info!(session_id = %session.id(), "Session revived");
                }
                if let Some(handler) = self.handler.get() {
                    handler.on_receive(&session, datagram.freeze(), now);
                }
            }
            PacketFamily::Dtls | PacketFamily::TurnChannel | PacketFamily::Other => {
                self.stats.unsupported.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn handle_stun(&self, data: &[u8], from: SocketAddr, now: Instant) {
        match self.agent.handle(data, from, now) {
            StunOutcome::Completed => {}
            StunOutcome::Keepalive { session_id, rtt } => {
                if let Some(session) = self.session(session_id) {
                    session.update_rtt(rtt);
                    if session.touch(now) {
                        info!(session_id = %session_id, "Session revived");
                    }
                }
            }
            StunOutcome::Request { local_ufrag, message } => {
                let Some(session) = self
                    .by_ufrag
                    .get(&local_ufrag)
                    .and_then(|id| self.session(*id.value()))
                else {
                    debug!(peer_addr = %from, ufrag = %local_ufrag, "Binding request for unknown ufrag");
                    return;
                };
                let local_pwd = &session.credentials().local_pwd;
                if !verify_integrity(&message, local_pwd) {
                    debug!(peer_addr = %from, session_id = %session.id(), "Binding request failed integrity check");
                    return;
                }
                match binding_response(&message, from, local_pwd) {
                    Ok(response) => {
                        if self.socket.try_send_to(&response, from).is_ok() {
                            self.stats.stun_requests_answered.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to build binding response"),
                }
                if session.path().remote == from && session.touch(now) {
                    info!(session_id = %session.id(), "Session revived");
                }
            }
            StunOutcome::Ignored(reason) => {
                trace!(peer_addr = %from, reason, "Ignored STUN message");
            }
        }
    }

    /// Establish a new session against the remote candidates.
    ///
    /// Candidate pairs are checked one after another in preference order;
    /// the first verified response wins. Failure is reported, never retried.
    pub async fn open(&self, params: ConnectivityParams) -> Result<Arc<Session>, ConnectivityError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectivityError::ShuttingDown);
        }
        let order = params.check_order(self.config.max_candidate_attempts);
        let Some(first) = order.first().copied() else {
            return Err(ConnectivityError::NoCandidates);
        };
        let inbound = SrtpContext::new(&params.keys.inbound).map_err(ConnectivityError::InvalidKeys)?;
        let outbound = SrtpContext::new(&params.keys.outbound).map_err(ConnectivityError::InvalidKeys)?;

        let id = SessionId::new();
        let local_ufrag = params.credentials.local_ufrag.clone();
        let session = Arc::new(Session::new(
            id,
            SelectedPath {
                remote: first.addr,
                kind: first.kind,
            },
            params.credentials,
            inbound,
            outbound,
            Arc::clone(&self.socket),
            self.cancel.child_token(),
            Instant::now(),
        ));
        self.sessions.insert(id, Arc::clone(&session));
        self.by_ufrag.insert(local_ufrag, id);

        debug!(session_id = %id, candidates = order.len(), "Starting connectivity checks");

        match self.run_checks(&session, &order).await {
            Ok(path) => {
                session.select_path(path);
                session.touch(Instant::now());
                session.transition(SessionState::Established);
                self.by_addr.insert(path.remote, id);

                info!(
                    session_id = %id,
                    remote = %path.remote,
                    candidate_kind = ?path.kind,
                    rtt_ms = session.rtt().map(|rtt| rtt.as_millis() as u64),
                    "Session established"
                );
                Ok(session)
            }
            Err(e) => {
                self.close(id);
                warn!(session_id = %id, error = %e, "Connectivity establishment failed");
                Err(e)
            }
        }
    }

    async fn run_checks(&self, session: &Session, order: &[Candidate]) -> Result<SelectedPath, ConnectivityError> {
        let connect_timeout = self.config.connect_timeout();
        let deadline = Instant::now() + connect_timeout;
        let mut attempts = 0;

        for candidate in order {
            let now = Instant::now();
            if now >= deadline {
                return Err(ConnectivityError::DeadlineExceeded(connect_timeout));
            }
            attempts += 1;

            let (request, response) = self
                .agent
                .establishment_request(session.credentials(), now)
                .map_err(ConnectivityError::InvalidKeys)?;
            if let Err(e) = self.socket.try_send_to(&request, candidate.addr) {
                debug!(session_id = %session.id(), candidate = %candidate.addr, error = %e, "Check could not be sent");
                continue;
            }

            let wait = self.config.check_timeout().min(deadline - now);
            tokio::select! {
                () = session.cancel_token().cancelled() => return Err(ConnectivityError::ShuttingDown),
                result = tokio::time::timeout(wait, response) => match result {
                    Ok(Ok(response)) => {
                        session.update_rtt(response.rtt);
                        return Ok(SelectedPath {
                            remote: response.from,
                            kind: candidate.kind,
                        });
                    }
                    _ => {
                        debug!(
                            session_id = %session.id(),
                            candidate = %candidate.addr,
                            kind = ?candidate.kind,
                            "Candidate check timed out"
                        );
                    }
                }
            }
        }

        if Instant::now() >= deadline {
            Err(ConnectivityError::DeadlineExceeded(connect_timeout))
        } else {
            Err(ConnectivityError::ChecksFailed { attempts })
        }
    }

    /// Send a plaintext RTP, RTCP or STUN packet to a session. Never blocks.
    pub fn send(&self, session_id: SessionId, payload: &[u8]) -> Result<(), SendError> {
        let session = self.session(session_id).ok_or(SendError::Closed)?;
        match PacketFamily::of(payload) {
            PacketFamily::Rtp => session.send_rtp(payload),
            PacketFamily::Rtcp => session.send_rtcp(payload),
            _ => session.send_stun(payload),
        }
    }

    #[must_use]
    pub fn session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&session_id).map(|entry| Arc::clone(entry.value()))
    }

    fn session_by_addr(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        let id = *self.by_addr.get(addr)?.value();
        self.session(id)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close a session and release its transport resources. Returns false if
    /// the session was already gone.
    pub fn close(&self, session_id: SessionId) -> bool {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return false;
        };
        let previous = session.transition(SessionState::Closed);
        session.cancel_token().cancel();

        self.by_addr
            .remove_if(&session.path().remote, |_, id| *id == session_id);
        self.by_ufrag
            .remove_if(&session.credentials().local_ufrag, |_, id| *id == session_id);

        info!(
            session_id = %session_id,
            previous_state = ?previous,
            remaining_sessions = self.sessions.len(),
            "Session closed"
        );
        true
    }

    /// Send a keepalive binding request to every live session
    pub fn keepalive(&self, now: Instant) -> usize {
        let mut sent = 0;
        for entry in &self.sessions {
            let session = entry.value();
            if !matches!(session.state(), SessionState::Established | SessionState::Stale) {
                continue;
            }
            match self.agent.keepalive_request(session.id(), session.credentials(), now) {
                Ok(request) => {
                    if session.send_stun(&request).is_ok() {
                        sent += 1;
                    }
                }
                Err(e) => warn!(session_id = %session.id(), error = %e, "Failed to build keepalive"),
            }
        }
        self.agent.purge_expired(now, self.config.stale_after());
        sent
    }

    /// Move quiet sessions to `Stale` and report those overdue for teardown
    pub fn check_liveness(&self, now: Instant) -> LivenessReport {
        let stale_after = self.config.stale_after();
        let expire_after = stale_after + self.config.stale_teardown_after();
        let mut report = LivenessReport::default();

        for entry in &self.sessions {
            let session = entry.value();
            let idle = session.idle_for(now);
            match session.state() {
                SessionState::Established if idle >= stale_after => {
                    session.transition(SessionState::Stale);
                    warn!(
                        session_id = %session.id(),
                        idle_ms = idle.as_millis() as u64,
                        "Session went stale"
                    );
                    report.newly_stale.push(session.id());
                }
                SessionState::Stale if idle >= expire_after => report.expired.push(session.id()),
                _ => {}
            }
        }
        report
    }

    #[must_use]
    pub fn get_stats(&self) -> TransportStats {
        TransportStats {
            sessions: self.sessions.len(),
            datagrams_received: self.stats.datagrams_received.load(Ordering::Relaxed),
            stun_requests_answered: self.stats.stun_requests_answered.load(Ordering::Relaxed),
            unknown_source: self.stats.unknown_source.load(Ordering::Relaxed),
            auth_failures: self.stats.auth_failures.load(Ordering::Relaxed),
            unsupported: self.stats.unsupported.load(Ordering::Relaxed),
            recv_errors: self.stats.recv_errors.load(Ordering::Relaxed),
        }
    }
}
