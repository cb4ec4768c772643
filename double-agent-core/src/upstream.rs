//! Connecting to an upstream SSH agent's UNIX socket.

use std::io;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Opens a stream connection to an upstream agent socket at `path`.
pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<UnixStream> {
    UnixStream::connect(path)
}
