// src/relay/shutdown.rs
//
// Process-wide stop signal. Requesting shutdown raises the shared flag and
// runs the registered interrupters once (closing the stream socket so a
// blocked read returns); `shutdown()` additionally waits for the relay to
// report that it stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::core::lock::{lock_mutex, wait_condvar_timeout};

type Interrupter = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CoordinatorState {
    stopped: bool,
    interrupters: Vec<Interrupter>,
}

#[derive(Default)]
struct Inner {
    requested: Arc<AtomicBool>,
    state: Mutex<CoordinatorState>,
    stopped_cv: Condvar,
}

#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag raised on shutdown; shared with connection pools as their
    /// cancellation signal.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.inner.requested.clone()
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        lock_mutex(&self.inner.state, "shutdown.is_stopped").stopped
    }

    /// Registers `f` to run when shutdown is requested, or right away if it
    /// already was.
    pub fn on_interrupt<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = lock_mutex(&self.inner.state, "shutdown.on_interrupt");
            if !self.is_requested() {
                state.interrupters.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Raises the flag and interrupts; later calls do nothing.
    pub fn request(&self) {
        let interrupters = {
            let mut state = lock_mutex(&self.inner.state, "shutdown.request");
            if self.inner.requested.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut state.interrupters)
        };
        debug!("[relay] shutdown: running {} interrupters", interrupters.len());
        for interrupt in interrupters {
            interrupt();
        }
    }

    /// Requests shutdown and blocks until the relay stopped.
    pub fn shutdown(&self) {
        self.request();
        let mut state = lock_mutex(&self.inner.state, "shutdown.wait");
        while !state.stopped {
            state = wait_condvar_timeout(
                &self.inner.stopped_cv,
                state,
                Duration::from_millis(100),
                "shutdown.wait",
            );
        }
    }

    /// Like `shutdown`, giving up after `timeout`. Returns whether the relay stopped.
    pub fn shutdown_timeout(&self, timeout: Duration) -> bool {
        self.request();
        let deadline = Instant::now() + timeout;
        let mut state = lock_mutex(&self.inner.state, "shutdown.wait_timeout");
        while !state.stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = wait_condvar_timeout(
                &self.inner.stopped_cv,
                state,
                deadline - now,
                "shutdown.wait_timeout",
            );
        }
        true
    }

    pub fn mark_stopped(&self) {
        lock_mutex(&self.inner.state, "shutdown.mark_stopped").stopped = true;
        self.inner.stopped_cv.notify_all();
    }

    /// Marks the relay stopped when dropped, however the relay exits.
    pub fn stopped_guard(&self) -> StoppedGuard {
        StoppedGuard {
            coordinator: self.clone(),
        }
    }

    /// Routes SIGINT/SIGTERM into `shutdown()`.
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let coordinator = self.clone();
        ctrlc::set_handler(move || {
            info!("[relay] shutdown requested");
            coordinator.shutdown();
            info!("[relay] shutdown complete");
        })
    }
}

pub struct StoppedGuard {
    coordinator: ShutdownCoordinator,
}

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        self.coordinator.mark_stopped();
    }
}
