//! Waitable events and the process-wide shutdown flag.
//!
//! Every blocking wait in the engine goes through [`Event::wait`], which
//! composes "this event fired", "the timeout elapsed", and "shutdown was
//! triggered" into one outcome. Waits are chunked so a shutdown triggered
//! mid-wait is observed within [`SHUTDOWN_POLL`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Upper bound on how long a waiter can remain blind to shutdown
const SHUTDOWN_POLL: Duration = Duration::from_millis(25);

/// How a wait ended
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum WaitOutcome {
    Signaled,
    TimedOut,
    Shutdown,
}

/// A Win32-style event: manual-reset events stay signaled until `reset`,
/// auto-reset events release exactly one waiter per `set`
pub(crate) struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
    auto_reset: bool,
}

impl Event {
    pub(crate) fn manual() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            auto_reset: false,
        }
    }

    pub(crate) fn auto() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            auto_reset: true,
        }
    }

    pub(crate) fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        if self.auto_reset {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    pub(crate) fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Waits until the event is signaled, `timeout` elapses, or `shutdown`
    /// is triggered, whichever comes first
    pub(crate) fn wait(&self, timeout: Duration, shutdown: &Shutdown) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        loop {
            if shutdown.is_set() {
                return WaitOutcome::Shutdown;
            }
            if *signaled {
                if self.auto_reset {
                    *signaled = false;
                }
                return WaitOutcome::Signaled;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let chunk = (deadline - now).min(SHUTDOWN_POLL);
            let _ = self.cond.wait_for(&mut signaled, chunk);
        }
    }
}

/// Process-wide stop signal observed at every wait site
///
/// Triggering is one-way; threads notice within one poll interval and exit
/// without draining their queues.
pub(crate) struct Shutdown {
    flag: AtomicBool,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    pub(crate) fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Shutdown-aware sleep for polling paths with nothing to wait on
    pub(crate) fn sleep(&self, duration: Duration) -> WaitOutcome {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_set() {
                return WaitOutcome::Shutdown;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
        }
    }
}
