//! Bounded-retry locking and cooperative sleeping.
//!
//! Every stateful component in the system shares the same lock discipline:
//! a non-blocking acquire that backs off with a jittered sleep instead of
//! parking the thread, a hard attempt budget so a wedged holder surfaces as
//! an error instead of a deadlock, and an abort predicate so long waits
//! cooperate with coordinated shutdown.
//!
//! The jitter keeps the serial workers, the logic loop, and per-client
//! dispatch from accidentally synchronizing their retry cadence.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::LockError;

/// Maximum number of try-lock attempts before giving up.
const LOCK_ATTEMPTS: u32 = 400;

/// Minimum back-off between attempts.
const JITTER_FLOOR_NANOS: u64 = 1_000;

/// Maximum back-off between attempts.
const JITTER_CEIL_NANOS: u64 = 1_000_000;

/// Slice width for [`interruptible_sleep`]; bounds shutdown latency.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

thread_local! {
    static JITTER_STATE: Cell<u64> = Cell::new(jitter_seed());
}

fn jitter_seed() -> u64 {
    // Monotonic nanos mixed with the stack address of a local; cheap and
    // different per thread, which is all the jitter needs.
    let marker = 0u8;
    let nanos = monotonic_nanos();
    nanos ^ ((&raw const marker) as u64).rotate_left(17)
}

/// Nanoseconds from the monotonic clock, for jitter seeding and timestamps.
pub(crate) fn monotonic_nanos() -> u64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

/// One xorshift step; returns a back-off interval in the jitter window.
fn next_jitter() -> Duration {
    JITTER_STATE.with(|state| {
        let mut x = state.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        state.set(x);
        let nanos = (x % JITTER_CEIL_NANOS).max(JITTER_FLOOR_NANOS);
        Duration::from_nanos(nanos)
    })
}

/// A mutex-guarded value with bounded-retry acquisition.
///
/// `lock` never parks: it spins on `try_lock` with a jittered sleep between
/// attempts and fails with [`LockError::Exhausted`] once the budget runs
/// out, so one misbehaving holder cannot silently wedge the process.
#[derive(Debug)]
pub struct Guarded<T> {
    tag: String,
    inner: Mutex<T>,
}

impl<T> Guarded<T> {
    /// Wraps `value` under a lock tagged `tag` (used in error text and logs).
    pub fn new(tag: impl Into<String>, value: T) -> Self {
        Self {
            tag: tag.into(),
            inner: Mutex::new(value),
        }
    }

    /// Acquires the lock, backing off with jitter on contention.
    ///
    /// Aborts early with [`LockError::Aborted`] when `abort` becomes true,
    /// which threads the shutdown flag through every blocking point.
    ///
    /// # Errors
    ///
    /// [`LockError::Exhausted`] after the attempt budget,
    /// [`LockError::Poisoned`] if a holder panicked.
    pub fn lock(&self, abort: &AtomicBool) -> Result<MutexGuard<'_, T>, LockError> {
        let mut attempts: u32 = 0;

        while !abort.load(Ordering::Relaxed) {
            if attempts > 0 {
                std::thread::sleep(next_jitter());
            }

            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if attempts == LOCK_ATTEMPTS {
                        return Err(LockError::Exhausted {
                            tag: self.tag.clone(),
                            attempts,
                        });
                    }
                    attempts += 1;
                }
                Err(std::sync::TryLockError::Poisoned(_)) => {
                    return Err(LockError::Poisoned {
                        tag: self.tag.clone(),
                    });
                }
            }
        }

        Err(LockError::Aborted {
            tag: self.tag.clone(),
        })
    }

    /// Tag used in error text for this lock.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Releases `guard` to wait on `condvar`, reacquiring on wake or after
    /// `timeout`. Returns the guard and whether the wait timed out.
    ///
    /// Used for request-response pairing: the waiter holds the lock from
    /// send to wait, so the event loop cannot process the reply (it needs
    /// the same lock) until the waiter is actually waiting.
    pub fn wait_timeout<'a>(
        &'a self,
        guard: MutexGuard<'a, T>,
        condvar: &std::sync::Condvar,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        match condvar.wait_timeout(guard, timeout) {
            Ok((guard, result)) => (guard, result.timed_out()),
            Err(poisoned) => {
                let (guard, result) = poisoned.into_inner();
                (guard, result.timed_out())
            }
        }
    }
}

/// Sleeps for `interval`, waking early only when `abort` becomes true.
///
/// The sleep proceeds in small slices so a shutdown request is observed
/// within [`SLEEP_SLICE`] rather than at the end of the full interval.
/// Signal interruptions are absorbed by `std::thread::sleep`, which resumes
/// with the remaining time.
pub fn interruptible_sleep(interval: Duration, abort: &AtomicBool) {
    let mut remaining = interval;

    while !remaining.is_zero() {
        if abort.load(Ordering::Relaxed) {
            return;
        }

        let slice = remaining.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_uncontended_lock() {
        let guarded = Guarded::new("test", 41u32);
        let abort = AtomicBool::new(false);

        *guarded.lock(&abort).unwrap() += 1;
        assert_eq!(*guarded.lock(&abort).unwrap(), 42);
    }

    #[test]
    fn test_abort_predicate_short_circuits() {
        let guarded = Guarded::new("test", ());
        let abort = AtomicBool::new(true);

        match guarded.lock(&abort) {
            Err(LockError::Aborted { tag }) => assert_eq!(tag, "test"),
            other => panic!("expected Aborted, got {other:?}"),
        }
    }

    #[test]
    fn test_contended_lock_exhausts() {
        let guarded = Arc::new(Guarded::new("held", 0u8));
        let abort = AtomicBool::new(false);

        let holder = Arc::clone(&guarded);
        let hold_abort = AtomicBool::new(false);
        let guard = holder.lock(&hold_abort).unwrap();

        match guarded.lock(&abort) {
            Err(LockError::Exhausted { attempts, .. }) => assert_eq!(attempts, 400),
            other => panic!("expected Exhausted, got {other:?}"),
        }

        drop(guard);
        assert!(guarded.lock(&abort).is_ok());
    }

    #[test]
    fn test_interruptible_sleep_observes_abort() {
        let abort = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&abort);

        let start = Instant::now();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::Relaxed);
        });

        interruptible_sleep(Duration::from_secs(10), &abort);
        assert!(start.elapsed() < Duration::from_secs(2));
        waker.join().unwrap();
    }

    #[test]
    fn test_jitter_stays_in_window() {
        for _ in 0..1000 {
            let j = next_jitter();
            assert!(j >= Duration::from_nanos(JITTER_FLOOR_NANOS));
            assert!(j <= Duration::from_nanos(JITTER_CEIL_NANOS));
        }
    }
}
