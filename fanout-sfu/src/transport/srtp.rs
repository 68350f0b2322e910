//! SRTP/SRTCP protection with AEAD_AES_128_GCM (RFC 7714)
//!
//! The session keys and salts are derived by the handshake collaborator and
//! handed over per direction; this module only applies them. Rollover
//! counters are tracked per SSRC by unwrapping 16-bit sequence numbers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes128Gcm;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::rtp;
use crate::seq::SeqUnwrapper;

pub const SRTP_TAG_LEN: usize = 16;
pub const SRTCP_TRAILER_LEN: usize = 4;
pub const KEY_LEN: usize = 16;
pub const SALT_LEN: usize = 12;

const SRTCP_HEADER_LEN: usize = 8;
const SRTCP_E_FLAG: u32 = 0x8000_0000;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpError {
    #[error("packet too short")]
    TooShort,

    #[error("authentication failed")]
    AuthFailed,

    #[error("output buffer too small")]
    BufferTooSmall,

    #[error("unencrypted SRTCP is not supported")]
    Unencrypted,
}

/// Key and salt for one direction of a session
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SrtpKeys {
    pub key: [u8; KEY_LEN],
    pub salt: [u8; SALT_LEN],
}

impl std::fmt::Debug for SrtpKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpKeys")
            .field("key", &"[REDACTED]")
            .field("salt", &"[REDACTED]")
            .finish()
    }
}

impl SrtpKeys {
    /// Build from raw bytes, checking lengths
    pub fn from_slices(key: &[u8], salt: &[u8]) -> Result<Self, String> {
        Ok(Self {
            key: key
                .try_into()
                .map_err(|_| format!("key must be {KEY_LEN} bytes, got {}", key.len()))?,
            salt: salt
                .try_into()
                .map_err(|_| format!("salt must be {SALT_LEN} bytes, got {}", salt.len()))?,
        })
    }
}

/// Keying material of a session: `outbound` protects what the SFU sends,
/// `inbound` verifies what the peer sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyingMaterial {
    pub inbound: SrtpKeys,
    pub outbound: SrtpKeys,
}

/// Protection context for one direction
pub struct SrtpContext {
    cipher: Aes128Gcm,
    salt: [u8; SALT_LEN],
    rocs: Mutex<HashMap<u32, SeqUnwrapper>>,
    srtcp_index: AtomicU32,
}

impl std::fmt::Debug for SrtpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpContext")
            .field("cipher", &"[REDACTED]")
            .field("tracked_ssrcs", &self.rocs.lock().len())
            .finish()
    }
}

impl SrtpContext {
    pub fn new(keys: &SrtpKeys) -> Result<Self, String> {
        let cipher = Aes128Gcm::new_from_slice(&keys.key).map_err(|e| format!("invalid SRTP key: {e}"))?;
        Ok(Self {
            cipher,
            salt: keys.salt,
            rocs: Mutex::new(HashMap::new()),
            srtcp_index: AtomicU32::new(0),
        })
    }

    fn roc_for(&self, ssrc: u32, seq: u16) -> u32 {
        let mut rocs = self.rocs.lock();
        let extended = rocs.entry(ssrc).or_default().unwrap(seq);
        SeqUnwrapper::roc_of(extended)
    }

    fn rtp_iv(&self, ssrc: u32, roc: u32, seq: u16) -> [u8; 12] {
        let mut iv = [0u8; 12];
        iv[2..6].copy_from_slice(&ssrc.to_be_bytes());
        iv[6..10].copy_from_slice(&roc.to_be_bytes());
        iv[10..12].copy_from_slice(&seq.to_be_bytes());
        for (b, s) in iv.iter_mut().zip(self.salt) {
            *b ^= s;
        }
        iv
    }

    fn rtcp_iv(&self, ssrc: u32, index: u32) -> [u8; 12] {
        let mut iv = [0u8; 12];
        iv[2..6].copy_from_slice(&ssrc.to_be_bytes());
        iv[8..12].copy_from_slice(&(index & !SRTCP_E_FLAG).to_be_bytes());
        for (b, s) in iv.iter_mut().zip(self.salt) {
            *b ^= s;
        }
        iv
    }

    /// Encrypt the RTP packet occupying `buf[..len]` in place and append the
    /// tag. Returns the protected length.
    pub fn protect_rtp(&self, buf: &mut [u8], len: usize) -> Result<usize, SrtpError> {
        if buf.len() < len + SRTP_TAG_LEN {
            return Err(SrtpError::BufferTooSmall);
        }
        let header_len = rtp::header_len(&buf[..len]).map_err(|_| SrtpError::TooShort)?;
        let seq = u16::from_be_bytes([buf[2], buf[3]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let iv = self.rtp_iv(ssrc, self.roc_for(ssrc, seq), seq);

        let (aad, body) = buf.split_at_mut(header_len);
        let payload_len = len - header_len;
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), aad, &mut body[..payload_len])
            .map_err(|_| SrtpError::AuthFailed)?;
        body[payload_len..payload_len + SRTP_TAG_LEN].copy_from_slice(&tag);
        Ok(len + SRTP_TAG_LEN)
    }

    /// Verify and decrypt an SRTP packet in place; returns the plaintext length
    pub fn unprotect_rtp(&self, buf: &mut [u8]) -> Result<usize, SrtpError> {
        let header_len = rtp::header_len(buf).map_err(|_| SrtpError::TooShort)?;
        if buf.len() < header_len + SRTP_TAG_LEN {
            return Err(SrtpError::TooShort);
        }
        let seq = u16::from_be_bytes([buf[2], buf[3]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        // Estimate the ROC without committing it until the tag verifies
        let roc = {
            let rocs = self.rocs.lock();
            rocs.get(&ssrc)
                .and_then(|u| u.peek(seq))
                .map_or(0, SeqUnwrapper::roc_of)
        };
        let iv = self.rtp_iv(ssrc, roc, seq);

        let plain_len = buf.len() - SRTP_TAG_LEN;
        let (head, tag) = buf.split_at_mut(plain_len);
        let (aad, payload) = head.split_at_mut(header_len);
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&iv),
                aad,
                payload,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| SrtpError::AuthFailed)?;

        self.roc_for(ssrc, seq);
        Ok(plain_len)
    }

    /// Protect a compound RTCP packet
    pub fn protect_rtcp(&self, plain: &[u8]) -> Result<Bytes, SrtpError> {
        if plain.len() < SRTCP_HEADER_LEN {
            return Err(SrtpError::TooShort);
        }
        let ssrc = u32::from_be_bytes([plain[4], plain[5], plain[6], plain[7]]);
        let index = self.srtcp_index.fetch_add(1, Ordering::Relaxed) & !SRTCP_E_FLAG;
        let trailer = (SRTCP_E_FLAG | index).to_be_bytes();
        let iv = self.rtcp_iv(ssrc, index);

        let mut aad = [0u8; SRTCP_HEADER_LEN + SRTCP_TRAILER_LEN];
        aad[..SRTCP_HEADER_LEN].copy_from_slice(&plain[..SRTCP_HEADER_LEN]);
        aad[SRTCP_HEADER_LEN..].copy_from_slice(&trailer);

        let mut out = BytesMut::with_capacity(plain.len() + SRTP_TAG_LEN + SRTCP_TRAILER_LEN);
        out.extend_from_slice(plain);
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), &aad, &mut out[SRTCP_HEADER_LEN..])
            .map_err(|_| SrtpError::AuthFailed)?;
        out.extend_from_slice(&tag);
        out.put_slice(&trailer);
        Ok(out.freeze())
    }

    /// Verify and decrypt an SRTCP packet in place; returns the plaintext length
    pub fn unprotect_rtcp(&self, buf: &mut [u8]) -> Result<usize, SrtpError> {
        if buf.len() < SRTCP_HEADER_LEN + SRTP_TAG_LEN + SRTCP_TRAILER_LEN {
            return Err(SrtpError::TooShort);
        }
        let trailer_at = buf.len() - SRTCP_TRAILER_LEN;
        let trailer: [u8; 4] = [buf[trailer_at], buf[trailer_at + 1], buf[trailer_at + 2], buf[trailer_at + 3]];
        let word = u32::from_be_bytes(trailer);
        if word & SRTCP_E_FLAG == 0 {
            return Err(SrtpError::Unencrypted);
        }
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let iv = self.rtcp_iv(ssrc, word);

        let mut aad = [0u8; SRTCP_HEADER_LEN + SRTCP_TRAILER_LEN];
        aad[..SRTCP_HEADER_LEN].copy_from_slice(&buf[..SRTCP_HEADER_LEN]);
        aad[SRTCP_HEADER_LEN..].copy_from_slice(&trailer);

        let plain_len = trailer_at - SRTP_TAG_LEN;
        let (head, rest) = buf.split_at_mut(plain_len);
        let tag = &rest[..SRTP_TAG_LEN];
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&iv),
                &aad,
                &mut head[SRTCP_HEADER_LEN..],
                GenericArray::from_slice(tag),
            )
            .map_err(|_| SrtpError::AuthFailed)?;
        Ok(plain_len)
    }
}
