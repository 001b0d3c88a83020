//! Process watchdog: turns "no progress" into SIGTERM.
//!
//! The watchdog thread sleeps a fixed period and increments a strike
//! counter each pass. Monitored components call [`WatchdogHandle::reset`]
//! to zero the counter; if it ever reaches the strike limit the watchdog
//! sends SIGTERM to the process (not `exit()`, so the signal handlers run
//! and shutdown stays orderly). The logic loop is the sole resetter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::error;

use crate::error::Result;
use crate::registry::{ThreadRegistry, WorkerKind};
use crate::sync::interruptible_sleep;

/// Sleep per watchdog iteration.
const WATCHDOG_PERIOD: Duration = Duration::from_millis(500);

/// Iterations without a reset before the process is terminated (≈ 4 s).
const WATCHDOG_STRIKES: u32 = 8;

/// Shared handle monitored components use to prove liveness.
#[derive(Debug, Clone, Default)]
pub struct WatchdogHandle {
    counter: Arc<AtomicU32>,
}

impl WatchdogHandle {
    /// Zeroes the strike counter.
    pub fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }

    /// Current strike count (test and introspection use).
    pub fn strikes(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// Starts the watchdog thread and returns the reset handle.
///
/// # Errors
///
/// Fails when the registry refuses the launch (shutdown in progress).
pub fn start(registry: &ThreadRegistry) -> Result<WatchdogHandle> {
    let handle = WatchdogHandle::default();
    let counter = Arc::clone(&handle.counter);
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    registry.launch("WATCHDOG", WorkerKind::Watchdog, stop, move |stop| {
        while !stop.load(Ordering::SeqCst) {
            interruptible_sleep(WATCHDOG_PERIOD, &stop);
            if stop.load(Ordering::SeqCst) {
                break;
            }

            if counter.fetch_add(1, Ordering::Relaxed) >= WATCHDOG_STRIKES {
                error!("watchdog expired; terminating process");
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::this(),
                    nix::sys::signal::Signal::SIGTERM,
                );
                return;
            }
        }
    })?;

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_zeroes_strikes() {
        let handle = WatchdogHandle::default();
        handle.counter.store(5, Ordering::Relaxed);
        handle.reset();
        assert_eq!(handle.strikes(), 0);
    }
}
