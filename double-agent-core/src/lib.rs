//! Connection-level logic for the double agent: message framing, identity
//! aggregation, sign-with-fallback, and lock/unlock, all reusable without
//! forking a worker process or binding a real listening socket.

mod agent;
mod io_util;
mod message;
mod upstream;

pub use agent::AgentContext;
pub use message::Message;
pub use upstream::connect as connect_upstream;

pub use io_util::{read_exact_or_err, read_full, stream_bytes, write_all_or_err, write_full};
