//! Process-wide worker thread registry and coordinated shutdown.
//!
//! Every long-lived thread in the daemon (serial workers, the listener,
//! per-client connections, the logic loop) is launched through the registry
//! so that one `stop_all` call can flag, wait out, and join the whole set.
//! Serial workers are additionally indexed by board tag for O(N) lookup by
//! the logic loop and the server dispatcher, and their deaths can be
//! reported to a listener so the supervisor can restart them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::error::{LockError, Result};
use crate::serial::SerialWorker;
use crate::sync::Guarded;

/// How long `stop_all` waits for each worker to observe its stop flag.
const STOP_WAIT_PER_WORKER: Duration = Duration::from_secs(1);

/// Poll interval while waiting for a worker to acknowledge stop.
const STOP_POLL: Duration = Duration::from_millis(10);

/// What a registered worker does; serial workers get death notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// A board's serial I/O worker (reader thread owning a writer thread).
    Serial,
    /// The socket accept loop.
    Listener,
    /// A per-client connection thread.
    Connection,
    /// The 1 Hz logic loop.
    Logic,
    /// The watchdog.
    Watchdog,
}

/// Callback invoked with the board tag when a serial worker dies.
pub type IoDeathListener = Box<dyn Fn(&str) + Send + Sync>;

struct WorkerEntry {
    name: String,
    kind: WorkerKind,
    stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

struct RegistryInner {
    active: Vec<WorkerEntry>,
    dead: Vec<WorkerEntry>,
    serial: HashMap<String, Arc<SerialWorker>>,
}

/// Registry of live and dead worker threads.
pub struct ThreadRegistry {
    inner: Guarded<RegistryInner>,
    in_stop_all: AtomicBool,
    never_abort: AtomicBool,
    io_death_listener: Mutex<Option<IoDeathListener>>,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Guarded::new(
                "THREAD_REGISTRY",
                RegistryInner {
                    active: Vec::new(),
                    dead: Vec::new(),
                    serial: HashMap::new(),
                },
            ),
            in_stop_all: AtomicBool::new(false),
            never_abort: AtomicBool::new(false),
            io_death_listener: Mutex::new(None),
        }
    }

    /// Installs the callback fired when a serial worker dies outside of
    /// `stop_all`. The supervisor uses this to restart the worker.
    pub fn set_io_death_listener(&self, listener: IoDeathListener) {
        if let Ok(mut slot) = self.io_death_listener.lock() {
            *slot = Some(listener);
        }
    }

    /// Spawns `body` on a named thread and registers it.
    ///
    /// The caller supplies the stop flag (usually owned by the worker
    /// object so its own methods can observe shutdown); `stop_all` raises
    /// it. The closure is expected to check the flag between blocking
    /// steps. Liveness bookkeeping is handled here: the registry observes
    /// thread exit through the shared `alive` flag.
    ///
    /// # Errors
    ///
    /// Fails if the registry is mid `stop_all`, if the lock cannot be
    /// obtained, or if the OS refuses to spawn the thread.
    pub fn launch<F>(
        &self,
        name: &str,
        kind: WorkerKind,
        stop: Arc<AtomicBool>,
        body: F,
    ) -> Result<Arc<AtomicBool>>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        if self.in_stop_all.load(Ordering::SeqCst) {
            return Err(LockError::Aborted {
                tag: "THREAD_REGISTRY(stop-all)".to_string(),
            }
            .into());
        }

        let alive = Arc::new(AtomicBool::new(true));

        let thread_stop = Arc::clone(&stop);
        let thread_alive = Arc::clone(&alive);
        let thread_name = name.to_string();

        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(worker = %thread_name, "worker thread started");
                body(thread_stop);
                thread_alive.store(false, Ordering::SeqCst);
                debug!(worker = %thread_name, "worker thread stopped");
            })
            .map_err(|e| crate::error::ConnectionError::Setup {
                operation: "thread spawn",
                source: e,
            })?;

        let mut inner = self.inner.lock(&self.never_abort)?;
        inner.active.push(WorkerEntry {
            name: name.to_string(),
            kind,
            stop: Arc::clone(&stop),
            alive,
            join: Some(join),
        });

        Ok(stop)
    }

    /// Indexes a serial worker by its board tag for later lookup.
    pub fn register_serial(&self, worker: Arc<SerialWorker>) -> Result<()> {
        let mut inner = self.inner.lock(&self.never_abort)?;
        inner.serial.insert(worker.tag().to_string(), worker);
        Ok(())
    }

    /// Finds the serial worker for `tag`.
    ///
    /// # Errors
    ///
    /// [`crate::error::LogicError::NoWorker`] when no live worker carries
    /// the tag.
    pub fn serial_worker(&self, tag: &str) -> Result<Arc<SerialWorker>> {
        let inner = self.inner.lock(&self.never_abort)?;
        inner
            .serial
            .get(tag)
            .cloned()
            .ok_or_else(|| crate::error::LogicError::NoWorker { tag: tag.to_string() }.into())
    }

    /// Number of currently registered active workers.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock(&self.never_abort)
            .map(|inner| inner.active.len())
            .unwrap_or(0)
    }

    /// Reaps workers whose threads have exited.
    ///
    /// Dead serial workers are dropped from the tag index and reported to
    /// the io-death listener. Called periodically by the supervisor.
    pub fn cleanup(&self) -> Result<()> {
        if self.in_stop_all.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut reaped: Vec<WorkerEntry> = Vec::new();
        {
            let mut inner = self.inner.lock(&self.never_abort)?;
            let mut i = 0;
            while i < inner.active.len() {
                if inner.active[i].alive.load(Ordering::SeqCst) {
                    i += 1;
                } else {
                    let entry = inner.active.remove(i);
                    if entry.kind == WorkerKind::Serial {
                        inner.serial.remove(&entry.name);
                    }
                    reaped.push(entry);
                }
            }
        }

        for mut entry in reaped {
            debug!(worker = %entry.name, "reaping dead worker");
            if let Some(join) = entry.join.take() {
                if join.join().is_err() {
                    error!(worker = %entry.name, "worker thread panicked");
                }
            }

            if entry.kind == WorkerKind::Serial {
                if let Ok(listener) = self.io_death_listener.lock() {
                    if let Some(cb) = listener.as_ref() {
                        cb(&entry.name);
                    }
                }
            }

            let mut inner = self.inner.lock(&self.never_abort)?;
            inner.dead.push(entry);
        }

        // Joined entries carry no resources; the dead list is bookkeeping
        // for post-mortem logging and is bounded by trimming here.
        let mut inner = self.inner.lock(&self.never_abort)?;
        if inner.dead.len() > 64 {
            let excess = inner.dead.len() - 64;
            inner.dead.drain(..excess);
        }

        Ok(())
    }

    /// Flags every worker to stop, waits for acknowledgement, and joins.
    ///
    /// Each worker gets [`STOP_WAIT_PER_WORKER`] to observe its flag; one
    /// that exceeds the allowance is logged and abandoned so shutdown still
    /// completes. Re-entrant calls are no-ops.
    pub fn stop_all(&self) {
        if self.in_stop_all.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("stopping all workers");

        let entries: Vec<WorkerEntry> = match self.inner.lock(&self.never_abort) {
            Ok(mut inner) => {
                inner.serial.clear();
                inner.dead.clear();
                std::mem::take(&mut inner.active)
            }
            Err(e) => {
                error!("stop_all failed to lock registry: {e}");
                return;
            }
        };

        for entry in &entries {
            entry.stop.store(true, Ordering::SeqCst);
        }

        for mut entry in entries {
            let deadline = Instant::now() + STOP_WAIT_PER_WORKER;
            while entry.alive.load(Ordering::SeqCst) && Instant::now() < deadline {
                std::thread::sleep(STOP_POLL);
            }

            if entry.alive.load(Ordering::SeqCst) {
                warn!(worker = %entry.name, "worker did not acknowledge stop; abandoning");
                continue;
            }

            if let Some(join) = entry.join.take() {
                if join.join().is_err() {
                    error!(worker = %entry.name, "worker thread panicked");
                }
            }
        }

        self.in_stop_all.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}
