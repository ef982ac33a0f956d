//! Persistent crash counter that breaks plugin crash loops across restarts.
//!
//! The realtime call chain is bracketed by [`CrashGuard::enter`]: the counter
//! file is written on first entry and removed on last exit. A process that
//! dies inside the bracket leaves the file behind; after enough consecutive
//! abnormal exits the engine refuses to load the user's pedalboard and boots
//! with an empty one instead, so the appliance stays reachable.
//!
//! Power-off resets are not crashes. The loader ignores the count when the
//! recorded time is in the future (RTC-less board), when less than 3 s have
//! elapsed (the service supervisor retries after 5 s, so anything faster was
//! a power cut), or when more than 10 min have passed.

use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Consecutive unbracketed exits tolerated before the guard trips.
const MAX_CRASHES: u32 = 4;

const POWER_RESET_WINDOW_MS: u64 = 3_000;
const STALE_WINDOW_MS: u64 = 1000 * 60 * 10;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct GuardState {
    count: u32,
    depth: u32,
}

/// Crash-loop detector backed by a two-line counter file.
pub struct CrashGuard {
    path: Option<PathBuf>,
    state: Mutex<GuardState>,
}

impl CrashGuard {
    /// Loads (or initializes) the guard from `path`, applying the power-off
    /// reset heuristics to the stored count.
    pub fn open(path: PathBuf) -> Self {
        let mut count = 0u32;
        let current_time = now_millis();

        if let Ok(contents) = fs::read_to_string(&path) {
            let mut lines = contents.lines();
            let stored_count: u32 = lines.next().and_then(|l| l.trim().parse().ok()).unwrap_or(0);
            let crash_time: u64 = lines.next().and_then(|l| l.trim().parse().ok()).unwrap_or(0);

            count = stored_count;
            if crash_time > current_time {
                tracing::info!("crash guard: clock moved backwards, ignoring crash count");
                count = 0;
            } else {
                let elapsed = current_time - crash_time;
                if elapsed > STALE_WINDOW_MS {
                    count = 0;
                } else if elapsed < POWER_RESET_WINDOW_MS && count > 0 {
                    tracing::info!("crash guard: power-off reset detected, ignoring crash count");
                    count = 0;
                }
            }
        }

        if count > 0 {
            tracing::info!(count, "crash guard: previous abnormal exit detected");
        }

        Self {
            path: Some(path),
            state: Mutex::new(GuardState { count, depth: 0 }),
        }
    }

    /// A guard with no backing file; never trips. Used by tests and by
    /// embedded configurations without writable storage.
    pub fn disabled() -> Self {
        Self {
            path: None,
            state: Mutex::new(GuardState { count: 0, depth: 0 }),
        }
    }

    /// True when the stored count exceeds the tolerance and the engine should
    /// refuse to load the current pedalboard.
    pub fn has_crashed(&self) -> bool {
        self.state.lock().count > MAX_CRASHES
    }

    /// Clears the persistent count (after the user re-enables their board).
    pub fn clear(&self) {
        self.state.lock().count = 0;
        self.remove_file();
    }

    /// Enters the guarded zone. Reference-counted; the first entry persists
    /// `count + 1` so an exit that never reaches [`leave`](Self::leave) is
    /// recorded as a crash.
    pub fn enter(&self) {
        let mut state = self.state.lock();
        state.depth += 1;
        if state.depth == 1 {
            self.write_file(state.count + 1);
        }
    }

    /// Leaves the guarded zone; the last exit removes the counter file.
    pub fn leave(&self) {
        let mut state = self.state.lock();
        if state.depth > 0 {
            state.depth -= 1;
            if state.depth == 0 {
                self.remove_file();
            }
        }
    }

    /// RAII bracketing around a guarded scope.
    pub fn lock(&self) -> CrashGuardLock<'_> {
        self.enter();
        CrashGuardLock { guard: self }
    }

    fn write_file(&self, count: u32) {
        let Some(path) = &self.path else { return };
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(path)?;
            write!(file, "{}\n{}\n", count, now_millis())?;
            file.sync_all()?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
            }
            Ok(())
        };
        if let Err(err) = write() {
            tracing::warn!(%err, "crash guard: failed to persist counter");
        }
    }

    fn remove_file(&self) {
        let Some(path) = &self.path else { return };
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }
}

/// Scope guard returned by [`CrashGuard::lock`].
pub struct CrashGuardLock<'a> {
    guard: &'a CrashGuard,
}

impl Drop for CrashGuardLock<'_> {
    fn drop(&mut self) {
        self.guard.leave();
    }
}
