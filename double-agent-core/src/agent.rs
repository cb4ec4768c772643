//! Per-connection dispatch: identity aggregation, sign-with-fallback,
//! lock/unlock, and default passthrough for everything else.

use std::io;
use std::os::unix::net::UnixStream;

use double_agent_proto::{
    FrameHeader, SSH_AGENTC_LOCK, SSH_AGENTC_REQUEST_IDENTITIES, SSH_AGENTC_SIGN_REQUEST,
    SSH_AGENTC_UNLOCK, SSH_AGENT_FAILURE, SSH_AGENT_IDENTITIES_ANSWER, SSH_AGENT_SIGN_RESPONSE,
    SSH_AGENT_SUCCESS,
};

use crate::io_util::write_all_or_err;
use crate::message::Message;

/// Longest password this agent will hold in memory; anything longer is
/// treated the same as a malformed LOCK/UNLOCK request.
const MAX_PASSWORD_LEN: usize = 8;

/// State the double agent keeps for one client connection: which upstream
/// sockets it talks to, and whatever lock password is currently held.
pub struct AgentContext {
    primary: UnixStream,
    fallback: UnixStream,
    password: Option<Vec<u8>>,
}

impl AgentContext {
    pub fn new(primary: UnixStream, fallback: UnixStream) -> Self {
        Self {
            primary,
            fallback,
            password: None,
        }
    }

    /// Handles one fully-framed client request, replying on `client` as
    /// needed. Consumes `msg` and purges anything left unread so the caller's
    /// next read starts at a frame boundary.
    pub fn dispatch_request(&mut self, mut msg: Message, client: &mut UnixStream) -> io::Result<()> {
        let result = match msg.msg_type() {
            SSH_AGENTC_REQUEST_IDENTITIES => self.handle_request_identities(client),
            SSH_AGENTC_SIGN_REQUEST => self.handle_sign_request(&mut msg, client),
            SSH_AGENTC_LOCK => self.handle_lock(&mut msg, client),
            SSH_AGENTC_UNLOCK => self.handle_unlock(&mut msg, client),
            _ => self.handle_passthrough(&mut msg, client),
        };
        result?;
        msg.purge()
    }

    fn handle_request_identities(&mut self, client: &mut UnixStream) -> io::Result<()> {
        let (mut primary_msg, primary_count) =
            query_identities("primary", &mut self.primary)?;
        let (mut fallback_msg, fallback_count) =
            query_identities("fallback", &mut self.fallback)?;

        let total_count = primary_count + fallback_count;
        let body_len = primary_msg.payload_length() + fallback_msg.payload_length() + 4;
        let header = FrameHeader::new(SSH_AGENT_IDENTITIES_ANSWER, body_len).encode();
        write_all_or_err(client, &header)?;
        write_all_or_err(client, &total_count.to_be_bytes())?;
        primary_msg.transfer_payload(client)?;
        fallback_msg.transfer_payload(client)?;
        Ok(())
    }

    fn handle_sign_request(&mut self, msg: &mut Message, client: &mut UnixStream) -> io::Result<()> {
        msg.read_payload()?;
        if try_sign(msg, "primary", &mut self.primary, client)? {
            return Ok(());
        }
        if try_sign(msg, "fallback", &mut self.fallback, client)? {
            return Ok(());
        }
        write_all_or_err(client, &FrameHeader::new(SSH_AGENT_FAILURE, 0).encode())
    }

    fn handle_lock(&mut self, msg: &mut Message, client: &mut UnixStream) -> io::Result<()> {
        self.handle_password(msg, client, |ctx, password| {
            if ctx.password.is_some() {
                false
            } else {
                ctx.password = Some(password.to_vec());
                true
            }
        })
    }

    fn handle_unlock(&mut self, msg: &mut Message, client: &mut UnixStream) -> io::Result<()> {
        self.handle_password(msg, client, |ctx, password| match &ctx.password {
            Some(stored) if stored.as_slice() == password => {
                ctx.password = None;
                true
            }
            _ => false,
        })
    }

    fn handle_password(
        &mut self,
        msg: &mut Message,
        client: &mut UnixStream,
        action: impl FnOnce(&mut Self, &[u8]) -> bool,
    ) -> io::Result<()> {
        if msg.payload_length() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "lock/unlock request too short to carry a password length",
            ));
        }
        let password = msg.peek_bytes()?;
        let accepted = match password {
            Some(pw) if pw.len() <= MAX_PASSWORD_LEN => action(self, &pw),
            _ => false,
        };
        let msg_type = if accepted { SSH_AGENT_SUCCESS } else { SSH_AGENT_FAILURE };
        write_all_or_err(client, &FrameHeader::new(msg_type, 0).encode())
    }

    fn handle_passthrough(&mut self, msg: &mut Message, client: &mut UnixStream) -> io::Result<()> {
        msg.transfer(&mut self.primary)?;
        let mut response = Message::init(self.primary.try_clone()?, "primary")?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "primary agent closed the connection")
        })?;
        response.transfer(client)
    }
}

/// Sends `SSH_AGENTC_REQUEST_IDENTITIES` to `upstream` and returns the
/// resulting `IDENTITIES_ANSWER` message with its leading count already
/// peeled off, plus that count.
fn query_identities(name: &'static str, upstream: &mut UnixStream) -> io::Result<(Message, u32)> {
    let request = FrameHeader::new(SSH_AGENTC_REQUEST_IDENTITIES, 0).encode();
    write_all_or_err(upstream, &request)?;
    let mut msg = Message::init(upstream.try_clone()?, name)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, format!("{name}: closed before replying")))?;
    if msg.msg_type() != SSH_AGENT_IDENTITIES_ANSWER {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{name}: expected IDENTITIES_ANSWER, got type {}", msg.msg_type()),
        ));
    }
    let count = msg.peek_uint32()?;
    Ok((msg, count))
}

/// Forwards an already-read sign request to `upstream`; returns `true` and
/// relays the response to `dst` if `upstream` answered with
/// `SSH_AGENT_SIGN_RESPONSE`, `false` (after purging the response) otherwise.
fn try_sign(
    request: &Message,
    name: &'static str,
    upstream: &mut UnixStream,
    dst: &mut UnixStream,
) -> io::Result<bool> {
    request.send(upstream)?;
    let mut response = Message::init(upstream.try_clone()?, name)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, format!("{name}: closed before replying")))?;
    if response.msg_type() == SSH_AGENT_SIGN_RESPONSE {
        response.transfer(dst)?;
        Ok(true)
    } else {
        response.purge()?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use double_agent_proto::SSH_AGENTC_SIGN_REQUEST;

    fn send_frame(sock: &mut UnixStream, msg_type: u8, body: &[u8]) {
        let header = FrameHeader::new(msg_type, body.len() as u32).encode();
        write_all_or_err(sock, &header).unwrap();
        write_all_or_err(sock, body).unwrap();
    }

    fn read_frame(sock: &mut UnixStream) -> (u8, Vec<u8>) {
        use crate::io_util::read_exact_or_err;
        let mut header = [0u8; 5];
        read_exact_or_err(sock, &mut header).unwrap();
        let h = FrameHeader::decode(header).unwrap();
        let mut body = vec![0u8; h.body_len as usize];
        read_exact_or_err(sock, &mut body).unwrap();
        (h.msg_type, body)
    }

    #[test]
    fn lock_then_unlock_round_trip() {
        let (mut client_w, client_r) = UnixStream::pair().unwrap();
        let (_p_a, p_b) = UnixStream::pair().unwrap();
        let (_f_a, f_b) = UnixStream::pair().unwrap();
        let mut ctx = AgentContext::new(p_b, f_b);
        let mut client_r = client_r;

        let mut password_frame = Vec::new();
        password_frame.extend_from_slice(&4u32.to_be_bytes());
        password_frame.extend_from_slice(b"abcd");
        send_frame(&mut client_w, SSH_AGENTC_LOCK, &password_frame);
        let msg = Message::init(client_r.try_clone().unwrap(), "client").unwrap().unwrap();
        ctx.dispatch_request(msg, &mut client_r).unwrap();
        let (msg_type, _) = read_frame(&mut client_w);
        assert_eq!(msg_type, SSH_AGENT_SUCCESS);

        send_frame(&mut client_w, SSH_AGENTC_LOCK, &password_frame);
        let msg = Message::init(client_r.try_clone().unwrap(), "client").unwrap().unwrap();
        ctx.dispatch_request(msg, &mut client_r).unwrap();
        let (msg_type, _) = read_frame(&mut client_w);
        assert_eq!(msg_type, SSH_AGENT_FAILURE, "locking an already-locked agent is a no-op failure");

        send_frame(&mut client_w, SSH_AGENTC_UNLOCK, &password_frame);
        let msg = Message::init(client_r.try_clone().unwrap(), "client").unwrap().unwrap();
        ctx.dispatch_request(msg, &mut client_r).unwrap();
        let (msg_type, _) = read_frame(&mut client_w);
        assert_eq!(msg_type, SSH_AGENT_SUCCESS);
    }

    #[test]
    fn unlock_with_wrong_password_fails() {
        let (mut client_w, client_r) = UnixStream::pair().unwrap();
        let (_p_a, p_b) = UnixStream::pair().unwrap();
        let (_f_a, f_b) = UnixStream::pair().unwrap();
        let mut ctx = AgentContext::new(p_b, f_b);
        let mut client_r = client_r;

        let mut good = Vec::new();
        good.extend_from_slice(&4u32.to_be_bytes());
        good.extend_from_slice(b"abcd");
        send_frame(&mut client_w, SSH_AGENTC_LOCK, &good);
        let msg = Message::init(client_r.try_clone().unwrap(), "client").unwrap().unwrap();
        ctx.dispatch_request(msg, &mut client_r).unwrap();
        let _ = read_frame(&mut client_w);

        let mut wrong = Vec::new();
        wrong.extend_from_slice(&4u32.to_be_bytes());
        wrong.extend_from_slice(b"wxyz");
        send_frame(&mut client_w, SSH_AGENTC_UNLOCK, &wrong);
        let msg = Message::init(client_r.try_clone().unwrap(), "client").unwrap().unwrap();
        ctx.dispatch_request(msg, &mut client_r).unwrap();
        let (msg_type, _) = read_frame(&mut client_w);
        assert_eq!(msg_type, SSH_AGENT_FAILURE);
    }

    #[test]
    fn zero_length_password_locks_successfully() {
        let (mut client_w, client_r) = UnixStream::pair().unwrap();
        let (_p_a, p_b) = UnixStream::pair().unwrap();
        let (_f_a, f_b) = UnixStream::pair().unwrap();
        let mut ctx = AgentContext::new(p_b, f_b);
        let mut client_r = client_r;

        let empty_password_frame = 0u32.to_be_bytes();
        send_frame(&mut client_w, SSH_AGENTC_LOCK, &empty_password_frame);
        let msg = Message::init(client_r.try_clone().unwrap(), "client").unwrap().unwrap();
        ctx.dispatch_request(msg, &mut client_r).unwrap();
        let (msg_type, _) = read_frame(&mut client_w);
        assert_eq!(msg_type, SSH_AGENT_SUCCESS);
        assert_eq!(ctx.password, Some(Vec::new()));
    }

    #[test]
    fn sign_request_falls_back_when_primary_refuses() {
        let (mut client_w, client_r) = UnixStream::pair().unwrap();
        let (mut primary_peer, primary_agent) = UnixStream::pair().unwrap();
        let (mut fallback_peer, fallback_agent) = UnixStream::pair().unwrap();
        let mut ctx = AgentContext::new(primary_agent, fallback_agent);
        let mut client_r = client_r;

        send_frame(&mut client_w, SSH_AGENTC_SIGN_REQUEST, b"key+data");
        let msg = Message::init(client_r.try_clone().unwrap(), "client").unwrap().unwrap();

        let worker = std::thread::spawn(move || {
            ctx.dispatch_request(msg, &mut client_r).unwrap();
            ctx
        });

        let (primary_type, _) = read_frame(&mut primary_peer);
        assert_eq!(primary_type, SSH_AGENTC_SIGN_REQUEST);
        send_frame(&mut primary_peer, SSH_AGENT_FAILURE, &[]);

        let (fallback_type, _) = read_frame(&mut fallback_peer);
        assert_eq!(fallback_type, SSH_AGENTC_SIGN_REQUEST);
        send_frame(&mut fallback_peer, SSH_AGENT_SIGN_RESPONSE, b"signature-bytes");

        worker.join().unwrap();
        let (msg_type, body) = read_frame(&mut client_w);
        assert_eq!(msg_type, SSH_AGENT_SIGN_RESPONSE);
        assert_eq!(body, b"signature-bytes");
    }

    #[test]
    fn request_identities_aggregates_both_upstreams() {
        let (mut client_w, client_r) = UnixStream::pair().unwrap();
        let (mut primary_peer, primary_agent) = UnixStream::pair().unwrap();
        let (mut fallback_peer, fallback_agent) = UnixStream::pair().unwrap();
        let mut ctx = AgentContext::new(primary_agent, fallback_agent);
        let mut client_r = client_r;

        send_frame(&mut client_w, SSH_AGENTC_REQUEST_IDENTITIES, &[]);
        let msg = Message::init(client_r.try_clone().unwrap(), "client").unwrap().unwrap();

        let worker = std::thread::spawn(move || {
            ctx.dispatch_request(msg, &mut client_r).unwrap();
        });

        let (req_type, _) = read_frame(&mut primary_peer);
        assert_eq!(req_type, SSH_AGENTC_REQUEST_IDENTITIES);
        let mut primary_body = 1u32.to_be_bytes().to_vec();
        primary_body.extend_from_slice(b"primary-key");
        send_frame(&mut primary_peer, SSH_AGENT_IDENTITIES_ANSWER, &primary_body);

        let (req_type, _) = read_frame(&mut fallback_peer);
        assert_eq!(req_type, SSH_AGENTC_REQUEST_IDENTITIES);
        let mut fallback_body = 1u32.to_be_bytes().to_vec();
        fallback_body.extend_from_slice(b"fallback-key");
        send_frame(&mut fallback_peer, SSH_AGENT_IDENTITIES_ANSWER, &fallback_body);

        worker.join().unwrap();
        let (msg_type, body) = read_frame(&mut client_w);
        assert_eq!(msg_type, SSH_AGENT_IDENTITIES_ANSWER);
        let count = u32::from_be_bytes(body[0..4].try_into().unwrap());
        assert_eq!(count, 2);
        assert_eq!(&body[4..], b"primary-keyfallback-key");
    }
}
