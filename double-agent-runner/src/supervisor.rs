//! The long-lived supervisor process: listens on the double agent socket,
//! forks one worker per connection, and shuts the whole process group down
//! once the process it was spawned alongside exits.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, setsid, ForkResult, Pid};

use crate::boundary::{proc_fd, signal_fd_for_sigchld, signal_fd_read, un_accept};
use crate::diag::{debug, warn};
use crate::worker;

/// Maximum number of connections served concurrently; beyond this the
/// listening socket's backlog holds further clients until one finishes.
const MAX_CONCURRENT_WORKERS: usize = 16;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub struct SupervisorConfig {
    pub socket_path: String,
    pub primary_path: String,
    pub fallback_path: String,
    /// PID of the process this supervisor was forked alongside; once it
    /// exits, the supervisor tears everything down.
    pub watched_pid: Pid,
}

/// Detaches from the controlling terminal and neutralizes stdio the way the
/// original daemon does: close fd 0/1, then dup the two ends of one
/// anonymous pipe onto them so nothing downstream ever reads real terminal
/// input or writes to a terminal that no longer belongs to this session.
fn stdio_pipe() -> Result<()> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error()).context("creating stdio replacement pipe");
    }
    let (read_end, write_end) = (fds[0], fds[1]);
    if unsafe { libc::dup2(read_end, 0) } < 0 {
        return Err(std::io::Error::last_os_error()).context("dup2 pipe read end onto fd 0");
    }
    if unsafe { libc::dup2(write_end, 1) } < 0 {
        return Err(std::io::Error::last_os_error()).context("dup2 pipe write end onto fd 1");
    }
    unsafe {
        libc::close(read_end);
        libc::close(write_end);
    }
    Ok(())
}

/// Sends `SIGTERM` then, after a grace period, `SIGKILL` to the whole
/// process group, having first set `SIGTERM` to be ignored in this process
/// so the supervisor survives long enough to send the follow-up `SIGKILL`.
fn terminate() {
    unsafe {
        let _ = signal(Signal::SIGTERM, SigHandler::SigIgn);
    }
    let pgid = Pid::from_raw(-getpid().as_raw());
    if let Err(e) = kill(pgid, Signal::SIGTERM) {
        warn!("failed to send SIGTERM to process group: {e}");
    }
    std::thread::sleep(SHUTDOWN_GRACE);
    if let Err(e) = kill(pgid, Signal::SIGKILL) {
        warn!("failed to send SIGKILL to process group: {e}");
    }
}

fn reap_finished_workers(active: &mut usize) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
            Ok(_) => {
                *active = active.saturating_sub(1);
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitpid failed: {e}");
                break;
            }
        }
    }
}

/// Runs the supervisor in the forked child. `listener` must already be bound
/// and listening (the caller creates it before forking, so the listening
/// socket and `SSH_AUTH_SOCK` are both ready before the monitored command is
/// `exec`'d, closing the race where it could try to connect too early).
pub fn run(cfg: SupervisorConfig, listener: OwnedFd) -> Result<()> {
    setsid().context("setsid")?;
    stdio_pipe()?;

    let pidfd = proc_fd(cfg.watched_pid).context("opening pidfd for watched process")?;
    let sigfd = signal_fd_for_sigchld().context("creating signalfd for SIGCHLD")?;

    let mut active_workers: usize = 0;
    let result = serve(&cfg, &listener, &pidfd, &sigfd, &mut active_workers);

    terminate();
    let _ = std::fs::remove_file(&cfg.socket_path);
    result
}

fn serve(
    cfg: &SupervisorConfig,
    listener: &OwnedFd,
    pidfd: &OwnedFd,
    sigfd: &OwnedFd,
    active_workers: &mut usize,
) -> Result<()> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::AsFd;

    loop {
        // Reaping happens unconditionally at the top of every iteration, not
        // only when the signal fd is readable: a child can die and be
        // waitable before this loop ever gets back around to checking the
        // signal fd for it.
        reap_finished_workers(active_workers);

        let mut fds = [
            PollFd::new(listener.as_fd(), PollFlags::POLLIN),
            PollFd::new(sigfd.as_fd(), PollFlags::POLLIN),
            PollFd::new(pidfd.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("polling supervisor fds"),
        }

        let listener_ready = fds[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN);
        let sigfd_ready = fds[1].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN);
        let pidfd_ready = fds[2].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN);

        if pidfd_ready {
            debug!("watched process exited, shutting down");
            return Ok(());
        }

        if sigfd_ready {
            // The signal fd's only job is to wake poll; reaping already
            // happened above, so just drain the pending record.
            let _ = signal_fd_read(sigfd)?;
        }

        if listener_ready {
            match un_accept(listener) {
                Ok(client) if *active_workers >= MAX_CONCURRENT_WORKERS => {
                    debug!("at worker capacity ({MAX_CONCURRENT_WORKERS}), closing new connection");
                    drop(client);
                }
                Ok(client) => spawn_worker(cfg, client, active_workers, listener, pidfd, sigfd)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    }
}

fn spawn_worker(
    cfg: &SupervisorConfig,
    client: UnixStream,
    active_workers: &mut usize,
    listener: &OwnedFd,
    pidfd: &OwnedFd,
    sigfd: &OwnedFd,
) -> Result<()> {
    match unsafe { fork() }.context("forking connection worker")? {
        ForkResult::Parent { .. } => {
            *active_workers += 1;
            Ok(())
        }
        ForkResult::Child => {
            // The worker has no business holding the supervisor's own fds;
            // it inherited copies of all three across the fork.
            unsafe {
                libc::close(listener.as_raw_fd());
                libc::close(pidfd.as_raw_fd());
                libc::close(sigfd.as_raw_fd());
            }
            if let Err(e) = worker::run_connection(client, &cfg.primary_path, &cfg.fallback_path) {
                warn!("connection worker failed: {e}");
            }
            std::process::exit(0);
        }
    }
}
