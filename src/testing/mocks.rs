// src/testing/mocks.rs
//
// Scriptable in-memory sink service. Every remote call lands in a shared
// event log that tests inspect after the relay is done with it.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::core::error::SinkError;
use crate::core::lock::lock_mutex;
use crate::sink::{ArchiveMode, ChannelSet, HandleOptions, Record, SinkHandle, SinkService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    OpenAttempt { name: String },
    Opened { name: String, mode: ArchiveMode },
    OpenFailed { name: String },
    Registered { name: String, channels: Vec<String> },
    Samples {
        name: String,
        start_ns: u64,
        duration_ns: u64,
        channels: Vec<Vec<u8>>,
        sync: bool,
    },
    Marker {
        name: String,
        time_ns: u64,
        value_ns: u64,
        sync: bool,
    },
    ClearCache { name: String },
    Detached { name: String },
    Closed { name: String },
}

impl SinkEvent {
    pub fn name(&self) -> &str {
        match self {
            SinkEvent::OpenAttempt { name }
            | SinkEvent::Opened { name, .. }
            | SinkEvent::OpenFailed { name }
            | SinkEvent::Registered { name, .. }
            | SinkEvent::Samples { name, .. }
            | SinkEvent::Marker { name, .. }
            | SinkEvent::ClearCache { name }
            | SinkEvent::Detached { name }
            | SinkEvent::Closed { name } => name,
        }
    }
}

#[derive(Default)]
struct MockState {
    events: Vec<SinkEvent>,
    open_failures: HashMap<String, u32>,
    renames: HashMap<String, String>,
    writes_before_failure: Option<usize>,
    writes: usize,
    open_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MockSinkService {
    state: Arc<Mutex<MockState>>,
}

impl MockSinkService {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` opens of `name` fail with a connection error.
    pub fn fail_opens(&self, name: &str, times: u32) {
        lock_mutex(&self.state, "mock.fail_opens")
            .open_failures
            .insert(name.to_string(), times);
    }

    /// Opens of `requested` come back under `assigned`.
    pub fn rename(&self, requested: &str, assigned: &str) {
        lock_mutex(&self.state, "mock.rename")
            .renames
            .insert(requested.to_string(), assigned.to_string());
    }

    /// Writes succeed `count` times, then every write fails.
    pub fn fail_writes_after(&self, count: usize) {
        lock_mutex(&self.state, "mock.fail_writes_after").writes_before_failure = Some(count);
    }

    /// Every successful open takes at least `delay`.
    pub fn delay_opens(&self, delay: Duration) {
        lock_mutex(&self.state, "mock.delay_opens").open_delay = Some(delay);
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        lock_mutex(&self.state, "mock.events").events.clone()
    }

    pub fn events_for(&self, name: &str) -> Vec<SinkEvent> {
        lock_mutex(&self.state, "mock.events_for")
            .events
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    pub fn open_attempts(&self, name: &str) -> usize {
        self.events_for(name)
            .iter()
            .filter(|e| matches!(e, SinkEvent::OpenAttempt { .. }))
            .count()
    }

    /// Names of successful opens, in order.
    pub fn opened_names(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Opened { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn registered(&self, name: &str) -> Option<Vec<String>> {
        self.events_for(name).into_iter().find_map(|e| match e {
            SinkEvent::Registered { channels, .. } => Some(channels),
            _ => None,
        })
    }

    /// Start times of sample writes on `name`.
    pub fn sample_times(&self, name: &str) -> Vec<u64> {
        self.events_for(name)
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Samples { start_ns, .. } => Some(start_ns),
                _ => None,
            })
            .collect()
    }

    /// `(time_ns, value_ns, sync)` of markers written on `name`.
    pub fn markers(&self, name: &str) -> Vec<(u64, u64, bool)> {
        self.events_for(name)
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Marker {
                    time_ns,
                    value_ns,
                    sync,
                    ..
                } => Some((time_ns, value_ns, sync)),
                _ => None,
            })
            .collect()
    }

    pub fn write_count(&self) -> usize {
        lock_mutex(&self.state, "mock.write_count").writes
    }
}

impl SinkService for MockSinkService {
    fn address(&self) -> &str {
        "mock"
    }

    fn create_handle(&self) -> Box<dyn SinkHandle> {
        Box::new(MockSinkHandle {
            state: self.state.clone(),
            name: None,
            open: false,
        })
    }
}

pub struct MockSinkHandle {
    state: Arc<Mutex<MockState>>,
    name: Option<String>,
    open: bool,
}

impl MockSinkHandle {
    fn open_name(&self) -> Result<String, SinkError> {
        match (&self.name, self.open) {
            (Some(name), true) => Ok(name.clone()),
            (name, _) => Err(SinkError::NotOpen {
                name: name.clone().unwrap_or_default(),
            }),
        }
    }

    fn record(&self, event: SinkEvent) {
        lock_mutex(&self.state, "mock.record").events.push(event);
    }
}

impl SinkHandle for MockSinkHandle {
    fn open(&mut self, name: &str, options: &HandleOptions) -> Result<String, SinkError> {
        self.name = Some(name.to_string());
        let (assigned, delay) = {
            let mut state = lock_mutex(&self.state, "mock.open");
            state.events.push(SinkEvent::OpenAttempt {
                name: name.to_string(),
            });
            let fail = match state.open_failures.get_mut(name) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            if fail {
                state.events.push(SinkEvent::OpenFailed {
                    name: name.to_string(),
                });
                return Err(SinkError::io(
                    name,
                    io::Error::new(io::ErrorKind::ConnectionRefused, "scripted failure"),
                ));
            }
            let assigned = state
                .renames
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.to_string());
            (assigned, state.open_delay)
        };

        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        self.name = Some(assigned.clone());
        self.open = true;
        self.record(SinkEvent::Opened {
            name: assigned.clone(),
            mode: options.archive_mode,
        });
        Ok(assigned)
    }

    fn register(&mut self, channels: &ChannelSet) -> Result<(), SinkError> {
        let name = self.open_name()?;
        self.record(SinkEvent::Registered {
            name,
            channels: channels.names().to_vec(),
        });
        Ok(())
    }

    fn write(&mut self, record: &Record<'_>, sync: bool) -> Result<(), SinkError> {
        let name = self.open_name()?;
        let mut state = lock_mutex(&self.state, "mock.write");
        if let Some(limit) = state.writes_before_failure {
            if state.writes >= limit {
                return Err(SinkError::io(
                    name,
                    io::Error::new(io::ErrorKind::BrokenPipe, "scripted write failure"),
                ));
            }
        }
        state.writes += 1;

        let event = match record {
            Record::Samples(batch) => SinkEvent::Samples {
                name,
                start_ns: batch.start_ns,
                duration_ns: batch.duration_ns,
                channels: batch.channels.iter().map(|c| c.to_vec()).collect(),
                sync,
            },
            Record::Marker { time_ns, value_ns } => SinkEvent::Marker {
                name,
                time_ns: *time_ns,
                value_ns: *value_ns,
                sync,
            },
        };
        state.events.push(event);
        Ok(())
    }

    fn clear_cache(&mut self) -> Result<(), SinkError> {
        let name = self.open_name()?;
        self.record(SinkEvent::ClearCache { name });
        Ok(())
    }

    fn detach(&mut self) -> Result<(), SinkError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if let Some(name) = self.name.take() {
            self.record(SinkEvent::Detached { name });
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.open = false;
        if let Some(name) = self.name.take() {
            self.record(SinkEvent::Closed { name });
        }
        Ok(())
    }
}
