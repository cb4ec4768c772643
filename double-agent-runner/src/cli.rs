//! Hand-rolled argument parsing, reproducing the original `parse_options`
//! shape rather than reaching for a flag-parsing crate: `-d`/`--debug` and
//! `-h`/`--help` up front, then an optional primary-path, a mandatory
//! fallback-path and double-agent-path, `--`, and the command to exec.

use anyhow::{bail, Context, Result};

pub struct CliArgs {
    pub debug: bool,
    pub primary_path: String,
    pub fallback_path: String,
    pub socket_path: String,
    pub cmd: Vec<String>,
}

pub fn print_usage(program: &str) {
    eprintln!(
        "usage: {program} [-d|--debug] [-h|--help] [primary-path] fallback-path double-agent-path -- cmd [args...]"
    );
}

pub fn parse(argv: &[String]) -> Result<CliArgs> {
    let program = argv.first().map(String::as_str).unwrap_or("ssh-double-agent");
    let mut debug = false;
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "-d" | "--debug" => {
                debug = true;
                i += 1;
            }
            "-h" | "--help" => {
                print_usage(program);
                std::process::exit(0);
            }
            _ => break,
        }
    }

    let rest = &argv[i..];
    let (primary_path, fallback_path, socket_path, cmd_start) = if rest.len() > 3 && rest[3] == "--" {
        (rest[0].clone(), rest[1].clone(), rest[2].clone(), 4)
    } else if rest.len() > 2 && rest[2] == "--" {
        let primary = std::env::var("SSH_AUTH_SOCK")
            .context("primary-path omitted and SSH_AUTH_SOCK is not set")?;
        (primary, rest[0].clone(), rest[1].clone(), 3)
    } else {
        print_usage(program);
        bail!("missing required arguments");
    };

    let cmd: Vec<String> = rest[cmd_start..].to_vec();
    if cmd.is_empty() {
        print_usage(program);
        bail!("no command given to exec after `--`");
    }

    Ok(CliArgs {
        debug,
        primary_path,
        fallback_path,
        socket_path,
        cmd,
    })
}
