//! Wake primitive shared between a pipe side and whoever waits on it.
//!
//! A `Signal` serves two kinds of waiters:
//! - application threads, suspended on a condition variable with an optional
//!   deadline (`wait_until`)
//! - at most one async task per signal (a connection driver), via `notified()`
//!
//! Notifiers never take the mutex unless a thread is actually parked, so the
//! enqueue/release hot path stays lock-free.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Condition-variable style wake-up with an async side channel.
#[derive(Default)]
pub struct Signal {
    /// Number of threads currently inside `wait_until`.
    parked: AtomicUsize,
    /// Bumped on every notification seen by parked threads.
    epoch: Mutex<u64>,
    cond: Condvar,
    /// Permit-based wake-up for the driver task.
    task: Notify,
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("parked", &self.parked.load(Ordering::Relaxed))
            .finish()
    }
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every parked thread and the driver task.
    ///
    /// Callers must make their state change visible (SeqCst) before calling.
    pub fn notify(&self) {
        self.task.notify_one();
        if self.parked.load(Ordering::SeqCst) > 0 {
            let mut epoch = self.epoch.lock();
            *epoch = epoch.wrapping_add(1);
            self.cond.notify_all();
        }
    }

    /// Future completing on the next notification (or immediately if one is
    /// pending). Only one task may wait on a given signal.
    pub fn notified(&self) -> Notified<'_> {
        self.task.notified()
    }

    /// Block the calling thread until `ready` returns true or `deadline` passes.
    ///
    /// `ready` is re-evaluated after every notification. Returns the last value
    /// of `ready`, so `false` means the deadline elapsed first. `None` waits
    /// forever.
    pub fn wait_until<F>(&self, mut ready: F, deadline: Option<Instant>) -> bool
    where
        F: FnMut() -> bool,
    {
        if ready() {
            return true;
        }

        self.parked.fetch_add(1, Ordering::SeqCst);
        let _guard = ParkGuard(&self.parked);

        loop {
            let seen = *self.epoch.lock();
            // Registered as parked before this check, so a notifier that changes
            // the condition after it also bumps the epoch.
            if ready() {
                return true;
            }

            let mut epoch = self.epoch.lock();
            while *epoch == seen {
                match deadline {
                    None => self.cond.wait(&mut epoch),
                    Some(deadline) => {
                        if self.cond.wait_until(&mut epoch, deadline).timed_out() {
                            drop(epoch);
                            return ready();
                        }
                    }
                }
            }
        }
    }
}

struct ParkGuard<'a>(&'a AtomicUsize);

impl Drop for ParkGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
