// src/sink/mod.rs
//
// Remote sink abstraction. A `SinkService` hands out `SinkHandle`s; each
// handle is one named, stateful connection on the remote service.

pub mod tcp;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{SampleType, WordOrder};
use crate::core::error::{ConfigError, SinkError};

pub use tcp::{TcpSinkHandle, TcpSinkService};

/// Channel registered on rotating connections that carries boundary markers.
pub const MARKER_CHANNEL: &str = "time";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSet {
    names: Vec<String>,
}

impl ChannelSet {
    pub fn new(names: Vec<String>) -> Result<Self, ConfigError> {
        if names.is_empty() {
            return Err(ConfigError::message("at least one channel is required"));
        }
        let mut seen = HashSet::new();
        for name in &names {
            if name.trim().is_empty() {
                return Err(ConfigError::message("channel names must not be empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::message(format!(
                    "duplicate channel name '{}'",
                    name
                )));
            }
        }
        Ok(Self { names })
    }

    /// `<prefix>0 .. <prefix>(count-1)`
    pub fn generated(prefix: &str, count: usize) -> Self {
        Self {
            names: (0..count).map(|idx| format!("{}{}", prefix, idx)).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// The set restricted to the channels at `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            names: indices
                .iter()
                .filter_map(|&idx| self.names.get(idx).cloned())
                .collect(),
        }
    }

    /// The set plus the marker channel, as registered on rotating connections.
    pub fn with_marker(&self) -> Self {
        let mut names = self.names.clone();
        if !self.contains(MARKER_CHANNEL) {
            names.push(MARKER_CHANNEL.to_string());
        }
        Self { names }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveMode {
    None,
    Create,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleOptions {
    pub cache_frames: u32,
    pub archive_frames: u32,
    pub archive_mode: ArchiveMode,
}

impl HandleOptions {
    pub fn new(cache_frames: u32, archive_frames: u32) -> Self {
        let archive_mode = if archive_frames > 0 {
            ArchiveMode::Create
        } else {
            ArchiveMode::None
        };
        Self {
            cache_frames,
            archive_frames,
            archive_mode,
        }
    }

    pub fn with_mode(mut self, archive_mode: ArchiveMode) -> Self {
        self.archive_mode = archive_mode;
        self
    }
}

/// Lifecycle of a pooled connection as seen by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Opening,
    Open,
    Writable,
    Draining,
    Closed,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandleState::Opening => "opening",
            HandleState::Open => "open",
            HandleState::Writable => "writable",
            HandleState::Draining => "draining",
            HandleState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch<'a> {
    pub start_ns: u64,
    pub duration_ns: u64,
    pub sample_type: SampleType,
    pub word_order: WordOrder,
    /// One payload per registered data channel, in channel order.
    pub channels: Vec<&'a [u8]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record<'a> {
    Samples(SampleBatch<'a>),
    /// Zero-duration boundary marker on `MARKER_CHANNEL`.
    Marker { time_ns: u64, value_ns: u64 },
}

pub trait SinkHandle: Send {
    /// Opens the connection and returns the name the service assigned.
    fn open(&mut self, name: &str, options: &HandleOptions) -> Result<String, SinkError>;
    fn register(&mut self, channels: &ChannelSet) -> Result<(), SinkError>;
    fn write(&mut self, record: &Record<'_>, sync: bool) -> Result<(), SinkError>;
    fn clear_cache(&mut self) -> Result<(), SinkError>;
    /// Releases the connection while the service keeps its data.
    fn detach(&mut self) -> Result<(), SinkError>;
    /// Releases the connection and discards it on the service.
    fn close(&mut self) -> Result<(), SinkError>;
}

pub trait SinkService: Send + Sync {
    fn address(&self) -> &str;
    fn create_handle(&self) -> Box<dyn SinkHandle>;
}
