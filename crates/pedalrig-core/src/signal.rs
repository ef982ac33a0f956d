//! Cooperative shutdown on SIGINT / SIGTERM / SIGHUP.
//!
//! The handlers do the minimum signal-safe work: flip a process-wide atomic.
//! The driver's bounded poll picks the flag up within one timeout. These
//! atomics are the one process-wide global in the engine; everything else is
//! an owned service object.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static NORMAL_TERMINATION: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_termination_signal(signal: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
    if signal == libc::SIGINT {
        // Interactive interrupt: a deliberate stop, not a supervisor kill.
        NORMAL_TERMINATION.store(true, Ordering::Release);
    }
}

/// Installs process-wide termination handlers. Idempotent.
pub fn install_termination_handlers() {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    #[cfg(unix)]
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_termination_signal as usize;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            libc::sigaction(signal, &action, std::ptr::null_mut());
        }
    }
}

/// True once a termination signal has arrived (or shutdown was requested
/// programmatically).
#[inline]
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Acquire)
}

/// Requests shutdown from code, as if a signal had arrived.
pub fn request_shutdown(normal: bool) {
    if normal {
        NORMAL_TERMINATION.store(true, Ordering::Release);
    }
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

/// Distinguishes user-initiated shutdown (exit code 0, supervisor should not
/// restart) from a supervisor kill (exit code 1).
pub fn normal_termination() -> bool {
    NORMAL_TERMINATION.load(Ordering::Acquire)
}

/// Exit code to report to the service supervisor.
pub fn exit_code() -> i32 {
    if normal_termination() {
        0
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_programmatic_shutdown() {
        request_shutdown(true);
        assert!(shutdown_requested());
        assert!(normal_termination());
        assert_eq!(exit_code(), 0);
    }

    #[test]
    fn test_install_is_idempotent() {
        install_termination_handlers();
        install_termination_handlers();
    }
}
