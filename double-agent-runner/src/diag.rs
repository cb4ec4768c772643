//! Ad hoc diagnostics gated on a process-wide debug flag, set once from CLI
//! parsing before the supervisor forks.

use std::sync::atomic::{AtomicBool, Ordering};

pub static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn set_debug(enabled: bool) {
    DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Prints to stderr only when `-d`/`--debug` was passed.
macro_rules! debug {
    ($($arg:tt)*) => {
        if $crate::diag::debug_enabled() {
            eprintln!("ssh-double-agent: DEBUG: {}", format!($($arg)*));
        }
    };
}

/// Always prints to stderr, regardless of the debug flag.
macro_rules! warn {
    ($($arg:tt)*) => {
        eprintln!("ssh-double-agent: {}", format!($($arg)*));
    };
}

pub(crate) use debug;
pub(crate) use warn;
