//! STUN binding request/response framing as defined in RFC 5389.
//!
//! STUN is used purely as an externally reachable echo mechanism: a binding
//! request elicits a reply from the far end, and the 96-bit transaction ID is
//! the probe identity that correlates the reply to its request.

use rand::Rng;
use thiserror::Error;

/// Fixed STUN magic cookie (RFC 5389 Section 6).
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

/// Size of the STUN message header and of a binding request with no
/// attributes.
pub const HEADER_LEN: usize = 20;

/// 96-bit STUN transaction ID.
///
/// Generated fresh per probe; must be unique enough that a late reply from a
/// previous probe window can never be mistaken for the current probe's.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TxId(pub [u8; 12]);

impl TxId {
    /// Draws a fresh transaction ID from the injected random source.
    pub fn generate<R: Rng>(rng: &mut R) -> TxId {
        let mut id = [0u8; 12];
        rng.fill(&mut id[..]);
        TxId(id)
    }
}

/// StunError is returned when a datagram cannot be parsed as a STUN binding
/// response.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StunError {
    #[error("datagram shorter than the STUN header")]
    TooShort,
    #[error("not a binding response")]
    NotABindingResponse,
    #[error("bad magic cookie")]
    BadMagicCookie,
    #[error("message length does not match datagram")]
    BadLength,
}

/// Builds a binding request carrying `txid` and no attributes.
///
/// Wire format (RFC 5389 Section 6):
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |0 0|     STUN Message Type     |         Message Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         Magic Cookie                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                     Transaction ID (96 bits)                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub fn binding_request(txid: &TxId) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Message length counts attribute bytes only; a bare request has none.
    buf[2..4].copy_from_slice(&0u16.to_be_bytes());
    buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf[8..20].copy_from_slice(&txid.0);
    buf
}

/// Parses a datagram as a binding response and returns its transaction ID.
///
/// Only the framing the probe needs is validated: message type, magic
/// cookie, and length consistency. Attributes are not interpreted; the
/// caller compares the returned ID against the one it generated.
pub fn parse_binding_response(buf: &[u8]) -> Result<TxId, StunError> {
    if buf.len() < HEADER_LEN {
        return Err(StunError::TooShort);
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(StunError::NotABindingResponse);
    }
    let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::BadMagicCookie);
    }
    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() != HEADER_LEN + msg_len {
        return Err(StunError::BadLength);
    }
    let mut id = [0u8; 12];
    id.copy_from_slice(&buf[8..20]);
    Ok(TxId(id))
}

/// Builds a binding response echoing `txid`, with the given attribute bytes.
///
/// Only needed by reflectors in tests; real responses come from remote STUN
/// servers.
pub fn binding_response(txid: &TxId, attrs: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + attrs.len());
    buf.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
    buf.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(&txid.0);
    buf.extend_from_slice(attrs);
    buf
}
