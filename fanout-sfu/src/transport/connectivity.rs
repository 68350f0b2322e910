//! Connectivity checks over STUN (RFC 8489, ICE short-term credentials)
//!
//! Uses the `stun_codec` crate for message handling. Outstanding requests are
//! tracked by transaction id; responses arrive through the shared socket's
//! receive loop and complete them.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytecodec::{DecodeExt, EncodeExt};
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use stun_codec::rfc5389::attributes::{MessageIntegrity, Username, XorMappedAddress};
use stun_codec::rfc5389::{methods, Attribute};
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId};
use tokio::sync::oneshot;

use super::srtp::KeyingMaterial;
use crate::types::SessionId;

/// Candidate type, in decreasing order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    /// Address allocated by the relay collaborator; checked like any other
    Relayed,
}

/// A remote transport address learned through signaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub addr: SocketAddr,
    pub kind: CandidateKind,
    #[serde(default)]
    pub priority: u32,
}

/// ICE user fragments and passwords for both sides
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCredentials {
    pub local_ufrag: String,
    pub local_pwd: String,
    pub remote_ufrag: String,
    pub remote_pwd: String,
}

impl std::fmt::Debug for IceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceCredentials")
            .field("local_ufrag", &self.local_ufrag)
            .field("remote_ufrag", &self.remote_ufrag)
            .field("local_pwd", &"[REDACTED]")
            .field("remote_pwd", &"[REDACTED]")
            .finish()
    }
}

impl IceCredentials {
    /// USERNAME we put in requests toward the peer
    #[must_use]
    pub fn outgoing_username(&self) -> String {
        format!("{}:{}", self.remote_ufrag, self.local_ufrag)
    }
}

/// Everything needed to establish one secured transport session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityParams {
    pub candidates: Vec<Candidate>,
    pub credentials: IceCredentials,
    pub keys: KeyingMaterial,
}

impl ConnectivityParams {
    /// Candidates in check order: type preference, then priority, capped at `max`
    #[must_use]
    pub fn check_order(&self, max: usize) -> Vec<Candidate> {
        let mut ordered = self.candidates.clone();
        ordered.sort_by(|a, b| a.kind.cmp(&b.kind).then(b.priority.cmp(&a.priority)));
        ordered.dedup_by_key(|c| c.addr);
        ordered.truncate(max);
        ordered
    }
}

/// A successful check's response
#[derive(Debug, Clone, Copy)]
pub struct CheckResponse {
    pub from: SocketAddr,
    pub mapped: Option<SocketAddr>,
    pub rtt: Duration,
}

enum PendingKind {
    Establish(oneshot::Sender<CheckResponse>),
    Keepalive(SessionId),
}

struct PendingRequest {
    kind: PendingKind,
    password: String,
    sent_at: Instant,
}

/// What the receive loop should do after handing a STUN message to the agent
#[derive(Debug)]
pub enum StunOutcome {
    /// An establishment check completed
    Completed,
    /// A keepalive round trip finished for the session
    Keepalive { session_id: SessionId, rtt: Duration },
    /// A binding request from the peer, addressed to `local_ufrag`
    Request {
        local_ufrag: String,
        message: Box<Message<Attribute>>,
    },
    /// Unsolicited, expired or unverifiable message
    Ignored(&'static str),
}

/// Tracks outstanding binding requests
#[derive(Default)]
pub struct StunAgent {
    pending: DashMap<[u8; 12], PendingRequest>,
}

impl StunAgent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn new_transaction_id() -> TransactionId {
        TransactionId::new(rand::thread_rng().gen())
    }

    /// Build a binding request and register a waiter for its response
    pub fn establishment_request(
        &self,
        credentials: &IceCredentials,
        now: Instant,
    ) -> Result<(Bytes, oneshot::Receiver<CheckResponse>), String> {
        let (tx, rx) = oneshot::channel();
        let bytes = self.request(credentials, PendingKind::Establish(tx), now)?;
        Ok((bytes, rx))
    }

    /// Build a consent/keepalive binding request for an established session
    pub fn keepalive_request(
        &self,
        session_id: SessionId,
        credentials: &IceCredentials,
        now: Instant,
    ) -> Result<Bytes, String> {
        self.request(credentials, PendingKind::Keepalive(session_id), now)
    }

    fn request(&self, credentials: &IceCredentials, kind: PendingKind, now: Instant) -> Result<Bytes, String> {
        let transaction_id = Self::new_transaction_id();
        let mut message: Message<Attribute> = Message::new(MessageClass::Request, methods::BINDING, transaction_id);
        message.add_attribute(Attribute::Username(
            Username::new(credentials.outgoing_username()).map_err(|e| e.to_string())?,
        ));
        let integrity = MessageIntegrity::new_short_term_credential(&message, &credentials.remote_pwd)
            .map_err(|e| e.to_string())?;
        message.add_attribute(Attribute::MessageIntegrity(integrity));

        let bytes = MessageEncoder::new()
            .encode_into_bytes(message)
            .map_err(|e| format!("failed to encode STUN request: {e}"))?;

        self.pending.insert(
            *transaction_id.as_bytes(),
            PendingRequest {
                kind,
                password: credentials.remote_pwd.clone(),
                sent_at: now,
            },
        );
        Ok(Bytes::from(bytes))
    }

    /// Drop requests older than `max_age`; returns how many were dropped
    pub fn purge_expired(&self, now: Instant, max_age: Duration) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, request| now.saturating_duration_since(request.sent_at) < max_age);
        before.saturating_sub(self.pending.len())
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Handle one inbound STUN datagram
    pub fn handle(&self, data: &[u8], from: SocketAddr, now: Instant) -> StunOutcome {
        let message = match MessageDecoder::<Attribute>::new().decode_from_bytes(data) {
            Ok(Ok(message)) => message,
            Ok(Err(_)) | Err(_) => return StunOutcome::Ignored("undecodable"),
        };
        if message.method() != methods::BINDING {
            return StunOutcome::Ignored("not a binding message");
        }

        match message.class() {
            MessageClass::Request => {
                let Some(username) = find_username(&message) else {
                    return StunOutcome::Ignored("request without username");
                };
                let local_ufrag = username.split(':').next().unwrap_or_default().to_string();
                StunOutcome::Request {
                    local_ufrag,
                    message: Box::new(message),
                }
            }
            MessageClass::SuccessResponse => {
                let key = *message.transaction_id().as_bytes();
                let Some((_, pending)) = self.pending.remove(&key) else {
                    return StunOutcome::Ignored("unsolicited response");
                };
                if !verify_integrity(&message, &pending.password) {
                    return StunOutcome::Ignored("response integrity check failed");
                }
                let rtt = now.saturating_duration_since(pending.sent_at);
                match pending.kind {
                    PendingKind::Establish(tx) => {
                        let response = CheckResponse {
                            from,
                            mapped: find_mapped_address(&message),
                            rtt,
                        };
                        // The checker may have timed out already
                        let _ = tx.send(response);
                        StunOutcome::Completed
                    }
                    PendingKind::Keepalive(session_id) => StunOutcome::Keepalive { session_id, rtt },
                }
            }
            MessageClass::ErrorResponse => {
                self.pending.remove(message.transaction_id().as_bytes());
                StunOutcome::Ignored("error response")
            }
            MessageClass::Indication => StunOutcome::Ignored("indication"),
        }
    }
}

fn find_username(message: &Message<Attribute>) -> Option<&str> {
    message.attributes().find_map(|attr| match attr {
        Attribute::Username(username) => Some(username.name()),
        _ => None,
    })
}

fn find_mapped_address(message: &Message<Attribute>) -> Option<SocketAddr> {
    message.attributes().find_map(|attr| match attr {
        Attribute::XorMappedAddress(addr) => Some(addr.address()),
        _ => None,
    })
}

/// Check MESSAGE-INTEGRITY against `password`
#[must_use]
pub fn verify_integrity(message: &Message<Attribute>, password: &str) -> bool {
    message
        .attributes()
        .find_map(|attr| match attr {
            Attribute::MessageIntegrity(integrity) => Some(integrity.check_short_term_credential(password).is_ok()),
            _ => None,
        })
        .unwrap_or(false)
}

/// ICE-lite answer to a peer's binding request
pub fn binding_response(
    request: &Message<Attribute>,
    peer_addr: SocketAddr,
    local_pwd: &str,
) -> Result<Bytes, String> {
    let mut response: Message<Attribute> = Message::new(
        MessageClass::SuccessResponse,
        methods::BINDING,
        request.transaction_id(),
    );
    response.add_attribute(Attribute::XorMappedAddress(XorMappedAddress::new(peer_addr)));
    let integrity =
        MessageIntegrity::new_short_term_credential(&response, local_pwd).map_err(|e| e.to_string())?;
    response.add_attribute(Attribute::MessageIntegrity(integrity));

    MessageEncoder::new()
        .encode_into_bytes(response)
        .map(Bytes::from)
        .map_err(|e| format!("failed to encode STUN response: {e}"))
}
