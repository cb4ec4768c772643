//! A single inbound or outbound SSH agent protocol message, tracked across
//! the handful of operations the double agent needs to perform on it without
//! ever buffering more of the payload than necessary.

use std::io;
use std::os::unix::net::UnixStream;

use double_agent_proto::{FrameHeader, MAX_PEEK_BYTES};

use crate::io_util::{read_exact_or_err, read_full, stream_bytes, write_all_or_err};

/// One message read off (or destined for) a socket.
///
/// `remaining` is how many payload bytes are still sitting unread on
/// `socket`; `payload_length` is the declared total payload length from the
/// frame header and is left unchanged by [`Message::read_payload`] (it still
/// describes the full body, which is now held in `content` instead of on the
/// wire). Peek operations decrement both figures together, since the bytes
/// they consume never come back.
pub struct Message {
    name: &'static str,
    socket: UnixStream,
    msg_type: u8,
    remaining: u32,
    payload_length: u32,
    content: Option<Vec<u8>>,
}

impl Message {
    /// Reads a 5-byte frame header from `socket` and returns the resulting
    /// message. A clean EOF before any header byte arrives is not an error —
    /// it means the peer hung up at a frame boundary — and is reported as
    /// `Ok(None)`. Anything else short of a full header is a framing error.
    pub fn init(socket: UnixStream, name: &'static str) -> io::Result<Option<Self>> {
        let mut header_buf = [0u8; 5];
        let mut s = socket;
        let n = read_full(&mut s, &mut header_buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n != header_buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{name}: short read on frame header"),
            ));
        }
        let header = FrameHeader::decode(header_buf)?;
        Ok(Some(Self {
            name,
            socket: s,
            msg_type: header.msg_type,
            remaining: header.body_len,
            payload_length: header.body_len,
            content: None,
        }))
    }

    pub fn msg_type(&self) -> u8 {
        self.msg_type
    }

    pub fn payload_length(&self) -> u32 {
        self.payload_length
    }

    pub fn content(&self) -> Option<&[u8]> {
        self.content.as_deref()
    }

    /// Reads the entire remaining payload into `content`. Requires no prior
    /// read and a non-empty payload.
    pub fn read_payload(&mut self) -> io::Result<()> {
        if self.content.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: read_payload called twice", self.name),
            ));
        }
        if self.payload_length == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: read_payload on empty payload", self.name),
            ));
        }
        let len = self.payload_length as usize;
        let mut buf = vec![0u8; len];
        let n = read_full(&mut self.socket, &mut buf)?;
        self.remaining = self.remaining.saturating_sub(n as u32);
        if n != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{}: short read filling payload", self.name),
            ));
        }
        self.content = Some(buf);
        Ok(())
    }

    /// Reads a big-endian `u32` out of the payload without buffering it.
    pub fn peek_uint32(&mut self) -> io::Result<u32> {
        if self.content.is_some() || self.payload_length < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: peek_uint32 on exhausted payload", self.name),
            ));
        }
        let mut buf = [0u8; 4];
        read_exact_or_err(&mut self.socket, &mut buf)?;
        self.payload_length -= 4;
        self.remaining -= 4;
        Ok(u32::from_be_bytes(buf))
    }

    /// Reads a length-prefixed byte string out of the payload. If the
    /// declared length exceeds [`MAX_PEEK_BYTES`], the bytes are still drained
    /// off the socket to keep framing aligned, but `None` is returned instead
    /// of an owned buffer. A length of zero is a legitimate empty string and
    /// returns `Some(vec![])`.
    pub fn peek_bytes(&mut self) -> io::Result<Option<Vec<u8>>> {
        let len = self.peek_uint32()?;
        if self.payload_length < len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: peek_bytes length {len} exceeds remaining payload", self.name),
            ));
        }
        let result = if len > MAX_PEEK_BYTES {
            stream_bytes::<_, UnixStream>(&mut self.socket, None, len as usize)?;
            None
        } else {
            let mut buf = vec![0u8; len as usize];
            read_exact_or_err(&mut self.socket, &mut buf)?;
            Some(buf)
        };
        self.payload_length -= len;
        self.remaining -= len;
        Ok(result)
    }

    /// Writes the header and buffered `content` to `dst`. Requires
    /// [`Message::read_payload`] (or manual construction) to have filled
    /// `content` first.
    pub fn send(&self, dst: &mut UnixStream) -> io::Result<()> {
        let content = self.content.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{}: send with no content", self.name))
        })?;
        let header = FrameHeader::new(self.msg_type, self.payload_length).encode();
        write_all_or_err(dst, &header)?;
        write_all_or_err(dst, content)?;
        Ok(())
    }

    /// Writes whatever is buffered in `content`, then streams the rest of the
    /// payload directly from the source socket to `dst`. Leaves the message
    /// fully drained (`remaining == payload_length == 0`, type cleared).
    pub fn transfer_payload(&mut self, dst: &mut UnixStream) -> io::Result<()> {
        if let Some(content) = self.content.take() {
            write_all_or_err(dst, &content)?;
            self.remaining = self.remaining.saturating_sub(content.len() as u32);
        }
        stream_bytes(&mut self.socket, Some(dst), self.remaining as usize)?;
        self.remaining = 0;
        self.payload_length = 0;
        self.msg_type = 0;
        Ok(())
    }

    /// Writes a fresh header for the current type/length, then forwards the
    /// whole payload via [`Message::transfer_payload`].
    pub fn transfer(&mut self, dst: &mut UnixStream) -> io::Result<()> {
        let header = FrameHeader::new(self.msg_type, self.payload_length).encode();
        write_all_or_err(dst, &header)?;
        self.transfer_payload(dst)
    }

    /// Drains any unread payload bytes from the socket without forwarding
    /// them anywhere, restoring frame alignment for the next message.
    pub fn purge(&mut self) -> io::Result<()> {
        if self.remaining > 0 {
            stream_bytes::<_, UnixStream>(&mut self.socket, None, self.remaining as usize)?;
        }
        self.remaining = 0;
        self.payload_length = 0;
        self.msg_type = 0;
        Ok(())
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        self.content = None;
    }
}
