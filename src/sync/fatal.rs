//! Fail-fast path for broken synchronization invariants.
//!
//! Nothing that reaches this module is recoverable: the lock state is already
//! proven inconsistent, so the process is terminated after the diagnostic is
//! written out.

use log::error;

/// Logs `message` and aborts the process.
#[cold]
#[inline(never)]
pub fn abort_with(message: &str) -> ! {
    error!("fatal synchronization error: {}", message);
    // The logger may not be installed yet, stderr always is.
    eprintln!("fatal synchronization error: {}", message);
    std::process::abort()
}
