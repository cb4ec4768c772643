//! Thin wrappers around the handful of POSIX/Linux primitives the supervisor
//! needs that `nix` either doesn't expose (`pidfd_open`, `signalfd`) or that
//! need the exact `umask`/`listen` choreography the original agent relied on.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use nix::unistd::{unlink, Pid};

fn nix_err(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Opens a `pidfd` that becomes readable once `pid` exits. There is no
/// `nix::sys::pidfd` in the feature set this crate builds against, so this
/// calls the raw syscall directly, the same way the seccomp notification fds
/// elsewhere in this codebase family are hand-wrapped.
pub fn proc_fd(pid: Pid) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Creates a `signalfd` that becomes readable whenever `SIGCHLD` is pending,
/// after blocking it in the calling thread's signal mask (a `signalfd` only
/// delivers signals that are blocked, so they queue instead of interrupting
/// `poll`).
pub fn signal_fd_for_sigchld() -> io::Result<OwnedFd> {
    use nix::sys::signal::{SigSet, Signal};

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block().map_err(nix_err)?;

    let mut set: libc::sigset_t = unsafe { MaybeUninit::zeroed().assume_init() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGCHLD);
    }
    let fd = unsafe { libc::signalfd(-1, &set, libc::SFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Drains one `signalfd_siginfo` record, returning the signal number it
/// reports. Called after `poll` reports the signalfd readable.
pub fn signal_fd_read(fd: &OwnedFd) -> io::Result<u32> {
    let mut info: libc::signalfd_siginfo = unsafe { MaybeUninit::zeroed().assume_init() };
    let buf = &mut info as *mut _ as *mut libc::c_void;
    let n = unsafe { libc::read(fd.as_raw_fd(), buf, std::mem::size_of::<libc::signalfd_siginfo>()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n as usize != std::mem::size_of::<libc::signalfd_siginfo>() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read on signalfd"));
    }
    Ok(info.ssi_signo)
}

/// Waits up to `timeout_ms` (or indefinitely, if `None`) for `fd` to become
/// readable. A `POLLHUP` is surfaced the same way an `EINTR` from `poll`
/// would be: `Err(ErrorKind::Interrupted)`, telling the caller to stop
/// waiting without treating it as a failure.
pub fn fd_wait_rd(fd: RawFd, timeout_ms: Option<u32>) -> io::Result<()> {
    use std::os::fd::BorrowedFd;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    let timeout = match timeout_ms {
        Some(ms) => PollTimeout::from(ms as u16),
        None => PollTimeout::NONE,
    };
    loop {
        match poll(&mut fds, timeout) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::TimedOut, "fd_wait_rd timed out")),
            Ok(_) => break,
            Err(nix::errno::Errno::EINTR) => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "fd_wait_rd interrupted"))
            }
            Err(e) => return Err(nix_err(e)),
        }
    }
    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
    if revents.contains(PollFlags::POLLHUP) {
        return Err(io::Error::new(io::ErrorKind::Interrupted, "peer hung up"));
    }
    Ok(())
}

/// Creates and binds a UNIX stream listening socket at `path`, restricting
/// its permission bits to `0600` by scoping `umask(0177)` around the `bind`
/// call only, then listens with the kernel-minimum backlog.
///
/// The socket is created before the supervisor forks, so it carries
/// `SOCK_CLOEXEC`: the soon-to-be-`exec`'d monitored command must not inherit
/// it, while the forked supervisor (which never execs) keeps it open.
pub fn un_listen(path: &str) -> io::Result<OwnedFd> {
    unlink(Path::new(path)).ok();
    let flags = SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC;
    let fd = socket::socket(AddressFamily::Unix, SockType::Stream, flags, None).map_err(nix_err)?;
    let addr = UnixAddr::new(path).map_err(nix_err)?;

    let prev_mask = unsafe { libc::umask(0o177) };
    let bind_result = socket::bind(fd.as_raw_fd(), &addr);
    unsafe {
        libc::umask(prev_mask);
    }
    bind_result.map_err(nix_err)?;

    let backlog = Backlog::new(0).map_err(nix_err)?;
    socket::listen(&fd, backlog).map_err(nix_err)?;
    Ok(fd)
}

/// Accepts one connection off a listener created by [`un_listen`].
pub fn un_accept(listen_fd: &OwnedFd) -> io::Result<UnixStream> {
    let conn_fd = socket::accept(listen_fd.as_raw_fd()).map_err(nix_err)?;
    Ok(UnixStream::from(unsafe { OwnedFd::from_raw_fd(conn_fd) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn un_listen_restricts_permissions_to_owner_only() {
        let dir = std::env::temp_dir().join(format!("double-agent-runner-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("listener.sock");
        let path_str = path.to_str().unwrap();

        let fd = un_listen(path_str).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        drop(fd);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn un_accept_receives_a_connecting_client() {
        let dir = std::env::temp_dir().join(format!("double-agent-runner-test-accept-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("listener.sock");
        let path_str = path.to_str().unwrap();

        let fd = un_listen(path_str).unwrap();
        let client = std::thread::spawn({
            let path_str = path_str.to_string();
            move || UnixStream::connect(&path_str).unwrap()
        });
        let _server_side = un_accept(&fd).unwrap();
        client.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn fd_wait_rd_reports_hangup_as_interrupted() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        let err = fd_wait_rd(b.as_raw_fd(), Some(1000)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn fd_wait_rd_reports_readable_data() {
        use std::io::Write;
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"x").unwrap();
        fd_wait_rd(b.as_raw_fd(), Some(1000)).unwrap();
    }
}
