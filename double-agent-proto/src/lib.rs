//! Wire format shared by every component that frames SSH agent protocol
//! messages: a 4-byte big-endian length followed by a 1-byte message type.

use std::io;

/// Smallest legal frame length (`L` in the header covers the type byte, so a
/// zero-body message has `L == 1`).
pub const MIN_FRAME_LEN: u32 = 1;
/// Largest legal frame length. Frames outside `[MIN_FRAME_LEN, MAX_FRAME_LEN]`
/// are rejected before any payload is read.
pub const MAX_FRAME_LEN: u32 = 32 * 1024;
/// Above this many bytes, `peek_bytes`-style operations discard the payload
/// instead of buffering it.
pub const MAX_PEEK_BYTES: u32 = 16 * 1024;

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
pub const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
pub const SSH_AGENTC_LOCK: u8 = 22;
pub const SSH_AGENTC_UNLOCK: u8 = 23;

/// The 5-byte length+type header that precedes every frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: u8,
    /// Body length in bytes, i.e. `L - 1` from the wire length field.
    pub body_len: u32,
}

impl FrameHeader {
    /// Builds a header for a message whose body is `body_len` bytes.
    pub fn new(msg_type: u8, body_len: u32) -> Self {
        Self { msg_type, body_len }
    }

    /// Encodes the header as the 5 wire bytes `be32(body_len + 1) ‖ type`.
    pub fn encode(&self) -> [u8; 5] {
        let wire_len = self.body_len + 1;
        let be = wire_len.to_be_bytes();
        [be[0], be[1], be[2], be[3], self.msg_type]
    }

    /// Decodes a header from 5 wire bytes, validating the length range.
    pub fn decode(buf: [u8; 5]) -> io::Result<Self> {
        let wire_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if wire_len < MIN_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message length {wire_len} underflows threshold"),
            ));
        }
        if wire_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("message length {wire_len} overflows threshold"),
            ));
        }
        Ok(Self {
            msg_type: buf[4],
            body_len: wire_len - 1,
        })
    }
}
