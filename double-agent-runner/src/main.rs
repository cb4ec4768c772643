mod boundary;
mod cli;
mod diag;
mod supervisor;
mod worker;

use std::ffi::CString;
use std::io::{self, Write};

use anyhow::{Context, Result};
use nix::unistd::{execvp, fork, ForkResult, Pid};

use diag::{set_debug, warn};
use supervisor::SupervisorConfig;

fn main() {
    if let Err(err) = real_main() {
        let _ = writeln!(io::stderr(), "ssh-double-agent: {err:#}");
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    let args = cli::parse(&argv)?;
    set_debug(args.debug);

    // The listening socket is bound and `SSH_AUTH_SOCK` is set before the
    // fork below, so the monitored command can never race the supervisor
    // into connecting before the double agent socket exists.
    let listener = boundary::un_listen(&args.socket_path).context("binding double agent socket")?;
    std::env::set_var("SSH_AUTH_SOCK", &args.socket_path);

    let watched_pid = Pid::this();

    match unsafe { fork() }.context("forking the supervisor")? {
        ForkResult::Parent { .. } => {
            drop(listener);
            let cmd: Vec<CString> = args
                .cmd
                .iter()
                .map(|s| CString::new(s.as_str()))
                .collect::<Result<_, _>>()
                .context("command argument contains an embedded NUL byte")?;
            execvp(&cmd[0], &cmd).context("exec of requested command failed")?;
            unreachable!("execvp only returns on failure, which is mapped to Err above");
        }
        ForkResult::Child => {
            let cfg = SupervisorConfig {
                socket_path: args.socket_path,
                primary_path: args.primary_path,
                fallback_path: args.fallback_path,
                watched_pid,
            };
            if let Err(e) = supervisor::run(cfg, listener) {
                warn!("supervisor exited with error: {e:#}");
                std::process::exit(1);
            }
            std::process::exit(0);
        }
    }
}
