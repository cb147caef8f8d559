// src/relay/swap.rs
//
// Background worker that replaces a lane's standby connection. The lane
// flips to the standby itself, then asks the worker to retire the old
// connection and open the next one and waits for the answer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, warn};

use crate::core::error::RelayError;
use crate::core::lock::lock_mutex;

use super::pool::{ConnectionPool, SwapReport};

pub struct SwapWorker {
    lane: String,
    requests: Option<Sender<()>>,
    done: Receiver<Result<SwapReport, RelayError>>,
    thread: Option<JoinHandle<()>>,
}

impl SwapWorker {
    pub fn spawn(
        lane: &str,
        pool: Arc<Mutex<ConnectionPool>>,
        cancel: Arc<AtomicBool>,
        wake: Duration,
    ) -> std::io::Result<Self> {
        let (req_tx, req_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded(1);
        let name = lane.to_string();

        let thread = thread::Builder::new()
            .name(format!("swap-{}", lane))
            .spawn(move || worker_loop(&name, pool, cancel, req_rx, done_tx, wake))?;

        Ok(Self {
            lane: lane.to_string(),
            requests: Some(req_tx),
            done: done_rx,
            thread: Some(thread),
        })
    }

    /// Signals the worker and blocks until the swap finished.
    pub fn request_and_wait(&self) -> Result<SwapReport, RelayError> {
        let gone = || RelayError::SwapWorkerGone {
            lane: self.lane.clone(),
        };
        let requests = self.requests.as_ref().ok_or_else(gone)?;
        requests.send(()).map_err(|_| gone())?;
        self.done.recv().map_err(|_| gone())?
    }

    pub fn stop(&mut self) {
        self.requests.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("[relay] swap worker for {} panicked", self.lane);
            }
        }
    }
}

impl Drop for SwapWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    lane: &str,
    pool: Arc<Mutex<ConnectionPool>>,
    cancel: Arc<AtomicBool>,
    requests: Receiver<()>,
    done: Sender<Result<SwapReport, RelayError>>,
    wake: Duration,
) {
    debug!("[relay] swap worker for {} started", lane);
    loop {
        match requests.recv_timeout(wake) {
            Ok(()) => {
                let result = lock_mutex(&pool, "relay.swap.replace_standby").replace_standby();
                if done.send(result).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("[relay] swap worker for {} stopped", lane);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::pool::{PoolSettings, RetirePolicy};
    use crate::relay::retry::RetryBudget;
    use crate::sink::ChannelSet;
    use crate::testing::mocks::MockSinkService;

    fn rotating_pool(service: &MockSinkService, cancel: Arc<AtomicBool>) -> Arc<Mutex<ConnectionPool>> {
        let settings = PoolSettings {
            base_name: "Lane".into(),
            channels: ChannelSet::generated("c", 1),
            cache_frames: 10,
            archive_frames: 0,
            retained: 1,
            policy: RetirePolicy::Detach,
            budget: RetryBudget::default(),
            slow_op: Duration::from_secs(60),
        };
        let pool = ConnectionPool::open_rotating(Arc::new(service.clone()), settings, cancel).unwrap();
        Arc::new(Mutex::new(pool))
    }

    #[test]
    fn worker_replaces_standby_on_request() {
        let service = MockSinkService::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let pool = rotating_pool(&service, cancel.clone());
        let mut worker =
            SwapWorker::spawn("Lane", pool.clone(), cancel, Duration::from_millis(20)).unwrap();

        lock_mutex(&pool, "test").flip().unwrap();
        let report = worker.request_and_wait().unwrap();
        assert_eq!(report.retired, "Lane-0");
        assert_eq!(report.opened, "Lane-2");

        lock_mutex(&pool, "test").flip().unwrap();
        let report = worker.request_and_wait().unwrap();
        assert_eq!(report.retired, "Lane-1");
        assert_eq!(report.opened, "Lane-3");

        worker.stop();
        assert!(worker.request_and_wait().is_err());
    }

    #[test]
    fn worker_exits_on_cancel_after_wake() {
        let service = MockSinkService::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let pool = rotating_pool(&service, cancel.clone());
        let worker =
            SwapWorker::spawn("Lane", pool, cancel.clone(), Duration::from_millis(10)).unwrap();

        cancel.store(true, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while worker.thread.as_ref().is_some_and(|t| !t.is_finished())
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.thread.as_ref().is_some_and(|t| t.is_finished()));
    }

    #[test]
    fn cancelled_swap_reports_cancellation() {
        let service = MockSinkService::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let pool = rotating_pool(&service, cancel.clone());
        let worker =
            SwapWorker::spawn("Lane", pool.clone(), cancel.clone(), Duration::from_secs(10)).unwrap();

        lock_mutex(&pool, "test").flip().unwrap();
        cancel.store(true, Ordering::SeqCst);
        let err = worker.request_and_wait().unwrap_err();
        assert!(err.is_cancellation());
    }
}
