//! Realtime scheduling helpers.

/// SCHED_FIFO priority used for the audio thread and the inversion guard.
pub const RT_THREAD_PRIORITY: i32 = 80;

/// Promotes the calling thread to realtime priority. Failure (missing
/// rtprio privileges) is reported but not fatal; the engine still runs,
/// just without deadline guarantees.
pub fn promote_current_thread() -> bool {
    #[cfg(unix)]
    unsafe {
        let param = libc::sched_param {
            sched_priority: RT_THREAD_PRIORITY,
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) == 0 {
            return true;
        }
        tracing::warn!("failed to set realtime thread priority; running best-effort");
        false
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(unix)]
struct SavedPolicy {
    policy: libc::c_int,
    param: libc::sched_param,
}

/// RAII priority boost preventing realtime-thread priority inversion.
///
/// Take one before acquiring any lock the realtime thread might briefly
/// contend on (driver open/close, swap acknowledgment). The previous policy
/// is restored on drop.
pub struct RtInversionGuard {
    #[cfg(unix)]
    saved: Option<SavedPolicy>,
}

impl RtInversionGuard {
    pub fn new() -> Self {
        #[cfg(unix)]
        unsafe {
            let policy = libc::sched_getscheduler(0);
            let mut param = libc::sched_param { sched_priority: 0 };
            libc::sched_getparam(0, &mut param);

            let rt_param = libc::sched_param {
                sched_priority: RT_THREAD_PRIORITY,
            };
            if libc::sched_setscheduler(0, libc::SCHED_RR, &rt_param) != 0 {
                return Self { saved: None };
            }
            Self {
                saved: Some(SavedPolicy { policy, param }),
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Default for RtInversionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RtInversionGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(saved) = self.saved.take() {
            unsafe {
                libc::sched_setscheduler(0, saved.policy, &saved.param);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_is_droppable_without_privileges() {
        // Without rtprio this is a no-op either way; it must not panic.
        let guard = RtInversionGuard::new();
        drop(guard);
    }
}
