//! Wire formats handled on the media path

pub mod rtcp;
pub mod rtp;

use bytes::Bytes;
use thiserror::Error;

pub use rtcp::{ReportBlock, RtcpItem, RtcpIter, TransportFeedback, TwccResult};
pub use rtp::{FrameMarking, HeaderRewrite, RtpBuilder, RtpHeader};

/// Why a header could not be read
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram too short")]
    TooShort,

    #[error("unsupported protocol version")]
    BadVersion,

    #[error("malformed header extension")]
    BadExtension,

    #[error("invalid padding")]
    BadPadding,
}

/// A decrypted RTP packet with its parsed header
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    /// The whole packet, header included
    pub data: Bytes,
}

impl RtpPacket {
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let start = self.header.header_len;
        &self.data[start..start + self.header.payload_len]
    }
}
