//! The per-connection worker loop. Runs in a forked child tied to exactly one
//! client connection, with its own upstream connections and lock state.

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use anyhow::{Context, Result};
use double_agent_core::{connect_upstream, AgentContext, Message};

use crate::boundary::fd_wait_rd;
use crate::diag::debug;

/// Handles one client connection end to end: connects to both upstream
/// agents (fallback first, to fail fast on a misconfigured fallback), then
/// services requests until the client disconnects or a protocol error ends
/// the connection. Either connection failing is fatal to this worker only.
pub fn run_connection(mut client: UnixStream, primary_path: &str, fallback_path: &str) -> Result<()> {
    let fallback =
        connect_upstream(fallback_path).with_context(|| format!("connecting to fallback agent at {fallback_path}"))?;
    let primary =
        connect_upstream(primary_path).with_context(|| format!("connecting to primary agent at {primary_path}"))?;
    let mut ctx = AgentContext::new(primary, fallback);

    loop {
        match fd_wait_rd(client.as_raw_fd(), None) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!("client connection closed");
                break;
            }
            Err(e) => return Err(e).context("waiting for client to become readable"),
        }

        let client_clone = client.try_clone().context("cloning client socket for Message::init")?;
        let msg = match Message::init(client_clone, "client")? {
            Some(msg) => msg,
            None => {
                debug!("client hung up at a frame boundary");
                break;
            }
        };
        ctx.dispatch_request(msg, &mut client)
            .context("dispatching client request")?;
    }
    Ok(())
}
