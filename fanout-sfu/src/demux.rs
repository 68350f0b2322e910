//! Packet demultiplexer
//!
//! Classifies datagrams arriving on the shared media socket (RFC 7983 first
//! byte ranges, RFC 5761 RTP/RTCP split) and resolves media SSRCs to the
//! stream layer that owns them. Classification reads only the header and
//! never allocates.

use dashmap::DashMap;

use crate::config::RtpExtensionConfig;
use crate::packet::{ParseError, RtpHeader};
use crate::types::{LayerId, SessionId, StreamId};

/// Protocol family of a datagram, judged by its first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFamily {
    Stun,
    Dtls,
    TurnChannel,
    Rtp,
    Rtcp,
    Other,
}

impl PacketFamily {
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        match data.first() {
            Some(0..=3) => Self::Stun,
            Some(20..=63) => Self::Dtls,
            Some(64..=79) => Self::TurnChannel,
            Some(128..=191) => match data.get(1) {
                Some(192..=223) => Self::Rtcp,
                Some(_) => Self::Rtp,
                None => Self::Other,
            },
            _ => Self::Other,
        }
    }
}

/// Why a datagram was dropped by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Header could not be parsed
    Malformed,
    /// Well-formed but not a protocol this core speaks
    Unsupported,
    /// SSRC not (or no longer) mapped to a stream; expected during teardown
    UnknownStream,
    /// SSRC belongs to a stream another session announced
    ForeignSession,
}

impl DropReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Unsupported => "unsupported",
            Self::UnknownStream => "unknown_stream",
            Self::ForeignSession => "foreign_session",
        }
    }
}

impl From<ParseError> for DropReason {
    fn from(_: ParseError) -> Self {
        Self::Malformed
    }
}

/// Non-media packets, handed to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacket<'a> {
    Stun(&'a [u8]),
    Rtcp(&'a [u8]),
}

/// A media packet resolved to its stream layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPacket {
    pub stream_id: StreamId,
    pub layer_id: LayerId,
    /// Session that announced the stream
    pub owner: SessionId,
    pub header: RtpHeader,
}

impl MediaPacket {
    #[must_use]
    pub const fn sequence(&self) -> u16 {
        self.header.sequence
    }

    /// Whether the packet arrived on the session that owns its stream
    #[must_use]
    pub fn is_from(&self, session_id: SessionId) -> bool {
        self.owner == session_id
    }
}

/// Result of classifying one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified<'a> {
    Control(ControlPacket<'a>),
    Media(MediaPacket),
    Unknown(DropReason),
}

/// Where a media SSRC belongs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLayer {
    pub stream_id: StreamId,
    pub layer_id: LayerId,
    pub owner: SessionId,
}

/// SSRC routing table plus the negotiated header extension ids
pub struct Demuxer {
    routes: DashMap<u32, StreamLayer>,
    extensions: RtpExtensionConfig,
}

impl Demuxer {
    #[must_use]
    pub fn new(extensions: RtpExtensionConfig) -> Self {
        Self {
            routes: DashMap::new(),
            extensions,
        }
    }

    #[must_use]
    pub const fn extensions(&self) -> &RtpExtensionConfig {
        &self.extensions
    }

    /// Classify a decrypted datagram
    #[must_use]
    pub fn classify<'a>(&self, data: &'a [u8]) -> Classified<'a> {
        match PacketFamily::of(data) {
            PacketFamily::Stun if data.len() >= 20 => Classified::Control(ControlPacket::Stun(data)),
            PacketFamily::Stun => Classified::Unknown(DropReason::Malformed),
            PacketFamily::Rtcp if data.len() >= 8 => Classified::Control(ControlPacket::Rtcp(data)),
            PacketFamily::Rtcp => Classified::Unknown(DropReason::Malformed),
            PacketFamily::Rtp => match RtpHeader::parse(data, &self.extensions) {
                Ok(header) => match self.resolve(header.ssrc) {
                    Some(route) => Classified::Media(MediaPacket {
                        stream_id: route.stream_id,
                        layer_id: route.layer_id,
                        owner: route.owner,
                        header,
                    }),
                    None => Classified::Unknown(DropReason::UnknownStream),
                },
                Err(e) => Classified::Unknown(e.into()),
            },
            PacketFamily::Dtls | PacketFamily::TurnChannel => Classified::Unknown(DropReason::Unsupported),
            PacketFamily::Other => Classified::Unknown(DropReason::Malformed),
        }
    }

    #[must_use]
    pub fn resolve(&self, ssrc: u32) -> Option<StreamLayer> {
        self.routes.get(&ssrc).map(|entry| *entry.value())
    }

    /// Map `ssrc` to a layer of a stream announced by `owner`; returns false
    /// if another stream owns it
    pub fn register(&self, ssrc: u32, stream_id: StreamId, layer_id: LayerId, owner: SessionId) -> bool {
        match self.routes.entry(ssrc) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                entry.get().stream_id == stream_id && entry.get().owner == owner
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(StreamLayer {
                    stream_id,
                    layer_id,
                    owner,
                });
                true
            }
        }
    }

    /// Remove every SSRC belonging to `stream_id`
    pub fn unregister_stream(&self, stream_id: StreamId) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, route| route.stream_id != stream_id);
        before.saturating_sub(self.routes.len())
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}
