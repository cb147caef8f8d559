// src/relay/pool.rs
//
// Connection pool for one lane. Without rotation it holds a single primary
// connection. With rotation it holds two slots: the active connection that
// takes writes and a pre-opened standby for the next window, named
// `<base>-<n>` from a running counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::RelayConfig;
use crate::core::error::{RelayError, SinkError};
use crate::core::logging::{ComponentLogger, LogContext};
use crate::sink::{ArchiveMode, ChannelSet, HandleOptions, HandleState, Record, SinkHandle, SinkService};

use super::retry::{RetryBudget, RetryOutcome, run_with_retry};

/// What happens to a connection once its window is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetirePolicy {
    /// Clear the cache and detach so the archive keeps the window; evict the
    /// oldest retained connection beyond the retention count.
    Archive,
    /// Detach and leave the data to the service.
    Detach,
    /// Hard close; the service drops the window.
    Discard,
}

impl RetirePolicy {
    pub fn from_config(cfg: &RelayConfig) -> Self {
        if cfg.discard_retired {
            RetirePolicy::Discard
        } else if cfg.archive_enabled() && cfg.retained_connections >= 2 {
            RetirePolicy::Archive
        } else {
            RetirePolicy::Detach
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    ClearAndDetach,
    Detach,
    Close,
}

/// Shutdown treatment of one pooled connection.
pub fn release_action(holds_current_window: bool, abort: bool, policy: RetirePolicy) -> ReleaseAction {
    if abort {
        ReleaseAction::Close
    } else if holds_current_window && policy == RetirePolicy::Archive {
        ReleaseAction::ClearAndDetach
    } else {
        ReleaseAction::Detach
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub base_name: String,
    pub channels: ChannelSet,
    pub cache_frames: u32,
    pub archive_frames: u32,
    pub retained: u32,
    pub policy: RetirePolicy,
    pub budget: RetryBudget,
    /// Remote calls slower than this are logged.
    pub slow_op: Duration,
}

impl PoolSettings {
    pub fn from_config(cfg: &RelayConfig, base_name: &str, channels: ChannelSet) -> Self {
        let block = Duration::from_nanos(cfg.block_duration_ns());
        Self {
            base_name: base_name.to_string(),
            channels,
            cache_frames: cfg.cache_frames,
            archive_frames: cfg.archive_frames,
            retained: cfg.retained_connections,
            policy: RetirePolicy::from_config(cfg),
            budget: RetryBudget::default(),
            slow_op: block * 50,
        }
    }

    fn options(&self) -> HandleOptions {
        HandleOptions::new(self.cache_frames, self.archive_frames)
    }
}

pub struct PooledHandle {
    name: String,
    state: HandleState,
    handle: Box<dyn SinkHandle>,
}

impl PooledHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> HandleState {
        self.state
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapReport {
    pub retired: String,
    pub opened: String,
    pub evicted: Option<String>,
    pub elapsed: Duration,
}

pub struct ConnectionPool {
    service: Arc<dyn SinkService>,
    settings: PoolSettings,
    rotating: bool,
    slots: [Option<PooledHandle>; 2],
    active: usize,
    created: u64,
    cancel: Arc<AtomicBool>,
}

impl ComponentLogger for ConnectionPool {
    fn log_context(&self) -> LogContext {
        let ctx = LogContext::new("Pool", &self.settings.base_name);
        match self.active_slot() {
            Some(h) => ctx.with_connection(&h.name),
            None => ctx,
        }
    }
}

impl ConnectionPool {
    /// Opens the single connection used when rotation is off.
    pub fn open_primary(
        service: Arc<dyn SinkService>,
        settings: PoolSettings,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, RelayError> {
        let mut pool = Self {
            service,
            settings,
            rotating: false,
            slots: [None, None],
            active: 0,
            created: 0,
            cancel,
        };
        let name = pool.settings.base_name.clone();
        let channels = pool.settings.channels.clone();
        let options = pool.settings.options();
        let mut primary = pool.open_named(&name, &options, Some(&channels))?;
        primary.state = HandleState::Writable;
        pool.slots[0] = Some(primary);
        pool.info(&format!("opened connection to {}", pool.service.address()));
        Ok(pool)
    }

    /// Opens `<base>-0` as the active connection and `<base>-1` as standby.
    pub fn open_rotating(
        service: Arc<dyn SinkService>,
        settings: PoolSettings,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, RelayError> {
        let mut pool = Self {
            service,
            settings,
            rotating: true,
            slots: [None, None],
            active: 0,
            created: 0,
            cancel,
        };

        let mut first = pool.open_next()?;
        first.state = HandleState::Writable;
        pool.slots[0] = Some(first);

        match pool.open_next() {
            Ok(standby) => pool.slots[1] = Some(standby),
            Err(e) => {
                pool.release(true);
                return Err(e);
            }
        }

        pool.info(&format!(
            "opened rotating connections to {} (retaining {})",
            pool.service.address(),
            pool.settings.retained
        ));
        Ok(pool)
    }

    pub fn is_rotating(&self) -> bool {
        self.rotating
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Connections opened so far by the rotation counter.
    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active_slot().map(|h| h.name.as_str())
    }

    pub fn states(&self) -> Vec<(String, HandleState)> {
        self.slots
            .iter()
            .flatten()
            .map(|h| (h.name.clone(), h.state))
            .collect()
    }

    pub fn writable_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|h| h.state == HandleState::Writable)
            .count()
    }

    pub fn write(&mut self, record: &Record<'_>, sync: bool) -> Result<(), RelayError> {
        let slow_op = self.settings.slow_op;
        let lane = self.settings.base_name.clone();
        let slot = match self.slots[self.active].as_mut() {
            Some(slot) if slot.state == HandleState::Writable => slot,
            _ => return Err(RelayError::NoActiveConnection { lane }),
        };

        let started = Instant::now();
        let result = slot.handle.write(record, sync);
        let name = slot.name.clone();
        self.warn_if_slow(&format!("write to {}", name), started, slow_op);

        result.map_err(|source| RelayError::WriteFailed { name, source })
    }

    /// Makes the standby the active connection. The old active connection
    /// stops taking writes in the same step.
    pub fn flip(&mut self) -> Result<(), RelayError> {
        let standby = 1 - self.active;
        let ready = self.slots[standby]
            .as_ref()
            .is_some_and(|h| h.state == HandleState::Open);
        if !self.rotating || !ready {
            return Err(RelayError::NoActiveConnection {
                lane: self.settings.base_name.clone(),
            });
        }

        if let Some(old) = self.slots[self.active].as_mut() {
            old.state = HandleState::Draining;
        }
        if let Some(next) = self.slots[standby].as_mut() {
            next.state = HandleState::Writable;
        }
        self.active = standby;
        Ok(())
    }

    /// Retires the inactive connection and opens the next standby in its slot.
    pub fn replace_standby(&mut self) -> Result<SwapReport, RelayError> {
        let started = Instant::now();
        let inactive = 1 - self.active;
        let mut retired = self.slots[inactive].take();
        let retired_name = retired
            .as_ref()
            .map(|h| h.name.clone())
            .unwrap_or_default();

        let mut evicted = None;
        if let Some(old) = retired.as_mut() {
            match self.settings.policy {
                RetirePolicy::Archive => {
                    self.remote(old, "clear_cache", |h| h.clear_cache())?;
                    self.remote(old, "detach", |h| h.detach())?;
                    if self.created >= u64::from(self.settings.retained) {
                        let oldest = self.created - u64::from(self.settings.retained);
                        evicted = Some(self.evict(oldest)?);
                    }
                }
                RetirePolicy::Detach => self.remote(old, "detach", |h| h.detach())?,
                RetirePolicy::Discard => self.remote(old, "close", |h| h.close())?,
            }
            old.state = HandleState::Closed;
        }

        let standby = self.open_next()?;
        let opened = standby.name.clone();
        self.slots[inactive] = Some(standby);

        let report = SwapReport {
            retired: retired_name,
            opened,
            evicted,
            elapsed: started.elapsed(),
        };
        self.debug(&format!(
            "swap retired {} opened {} in {:.3}s",
            report.retired,
            report.opened,
            report.elapsed.as_secs_f64()
        ));
        Ok(report)
    }

    /// Flip followed by standby replacement on the calling thread.
    pub fn swap(&mut self) -> Result<SwapReport, RelayError> {
        self.flip()?;
        self.replace_standby()
    }

    /// Releases every connection. Failures are logged and swallowed.
    pub fn release(&mut self, abort: bool) {
        let policy = if self.rotating {
            self.settings.policy
        } else {
            RetirePolicy::Detach
        };

        for idx in 0..self.slots.len() {
            let Some(mut slot) = self.slots[idx].take() else {
                continue;
            };
            let holds_window = idx == self.active && slot.state == HandleState::Writable;
            let action = release_action(holds_window, abort, policy);
            let result = match action {
                ReleaseAction::ClearAndDetach => slot
                    .handle
                    .clear_cache()
                    .and_then(|_| slot.handle.detach()),
                ReleaseAction::Detach => slot.handle.detach(),
                ReleaseAction::Close => slot.handle.close(),
            };
            match result {
                Ok(()) => self.debug(&format!("released {} ({:?})", slot.name, action)),
                Err(e) => {
                    self.warn(&format!("release of {} failed: {}", slot.name, e));
                    let _ = slot.handle.close();
                }
            }
            slot.state = HandleState::Closed;
        }
    }

    fn active_slot(&self) -> Option<&PooledHandle> {
        self.slots[self.active].as_ref()
    }

    fn open_next(&mut self) -> Result<PooledHandle, RelayError> {
        let name = format!("{}-{}", self.settings.base_name, self.created);
        self.created += 1;
        let channels = self.settings.channels.with_marker();
        let options = self.settings.options();
        self.open_named(&name, &options, Some(&channels))
    }

    /// Forces the connection `<base>-<index>` closed on the service.
    fn evict(&mut self, index: u64) -> Result<String, RelayError> {
        let name = format!("{}-{}", self.settings.base_name, index);
        let options = self.settings.options().with_mode(ArchiveMode::Append);
        let mut oldest = self.open_named(&name, &options, None)?;
        self.remote(&mut oldest, "close", |h| h.close())?;
        self.debug(&format!("evicted {}", name));
        Ok(name)
    }

    fn open_named(
        &self,
        name: &str,
        options: &HandleOptions,
        channels: Option<&ChannelSet>,
    ) -> Result<PooledHandle, RelayError> {
        let mut handle = self.service.create_handle();
        let cancel = self.cancel.clone();

        let outcome = run_with_retry(
            self.settings.budget,
            || cancel.load(Ordering::SeqCst),
            |attempt| {
                let started = Instant::now();
                let result = handle.open(name, options);
                self.warn_if_slow(&format!("open of {}", name), started, self.settings.slow_op);
                if let Err(e) = &result {
                    self.warn(&format!("open of {} failed (attempt {}): {}", name, attempt, e));
                    let _ = handle.close();
                }
                result
            },
        );

        let assigned = match outcome {
            RetryOutcome::Success { value, attempts } => {
                if attempts > 1 {
                    self.info(&format!("opened {} after {} attempts", name, attempts));
                }
                value
            }
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                return Err(RelayError::OpenExhausted {
                    name: name.to_string(),
                    attempts,
                    source: last_error,
                });
            }
            RetryOutcome::Abandoned { .. } => {
                let _ = handle.close();
                return Err(RelayError::Cancelled {
                    name: name.to_string(),
                });
            }
        };

        if assigned != name {
            let _ = handle.close();
            return Err(RelayError::NameMismatch {
                requested: name.to_string(),
                assigned,
            });
        }

        if let Some(channels) = channels {
            if let Err(source) = handle.register(channels) {
                let _ = handle.close();
                return Err(RelayError::sink(name, "register", source));
            }
        }

        Ok(PooledHandle {
            name: name.to_string(),
            state: HandleState::Open,
            handle,
        })
    }

    fn remote<F>(&self, slot: &mut PooledHandle, op: &'static str, call: F) -> Result<(), RelayError>
    where
        F: FnOnce(&mut dyn SinkHandle) -> Result<(), SinkError>,
    {
        let started = Instant::now();
        let result = call(slot.handle.as_mut());
        self.warn_if_slow(&format!("{} of {}", op, slot.name), started, self.settings.slow_op);
        result.map_err(|source| RelayError::sink(&slot.name, op, source))
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if self.slots.iter().any(Option::is_some) {
            self.release(true);
        }
    }
}
