//! Process-wide runtime context.
//!
//! One [`Runtime`] is built by the supervisor and passed by reference to
//! everything that needs the registry or the watchdog. The only process
//! global is the shutdown flag: signal handlers can touch nothing else,
//! so the flag is a static and every loop predicate reads it through
//! [`shutdown_requested`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::error::{ConnectionError, Result};
use crate::registry::ThreadRegistry;
use crate::watchdog::WatchdogHandle;

/// The static hook signal handlers flip.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Whether process shutdown has been requested.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Requests process shutdown. Called by signal handlers and by fatal
/// failures that must take the daemon down.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Resets the flag (test use only; the process normally exits).
#[doc(hidden)]
pub fn reset_shutdown_for_tests() {
    SHUTDOWN.store(false, Ordering::SeqCst);
}

extern "C" fn handle_signal(signum: i32) {
    // Only async-signal-safe work here: flip the flag and return. The
    // supervisor's main loop notices and performs the orderly teardown.
    let _ = signum;
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Installs termination handlers that flag shutdown instead of exiting,
/// so every worker drains through the registry.
///
/// # Errors
///
/// `sigaction` failures surface as connection setup errors.
pub fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for signal in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGQUIT,
    ] {
        // SAFETY: the handler only performs an atomic store, which is
        // async-signal-safe.
        unsafe {
            signal::sigaction(signal, &action).map_err(|e| ConnectionError::Poll { source: e })?;
        }
    }

    info!("signal handlers installed");
    Ok(())
}

/// The shared context handed to every component by the supervisor.
#[derive(Debug, Clone)]
pub struct Runtime {
    /// The worker thread registry.
    pub registry: Arc<ThreadRegistry>,
    /// Handle monitored components use to prove liveness.
    pub watchdog: WatchdogHandle,
}

impl Runtime {
    /// Builds the runtime and starts the watchdog.
    ///
    /// # Errors
    ///
    /// Watchdog launch failures propagate.
    pub fn start() -> Result<Self> {
        let registry = Arc::new(ThreadRegistry::new());
        let watchdog = crate::watchdog::start(&registry)?;

        Ok(Self { registry, watchdog })
    }

    /// Orderly teardown: stop every worker and wait for them.
    pub fn teardown(&self) {
        info!("stopping all workers");
        self.registry.stop_all();
    }
}
