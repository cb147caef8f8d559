use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{FixedOffset, Local, Offset};
use serde::{Deserialize, Serialize};

use crate::core::error::ConfigError;
use crate::core::timestamp::{NANOS_PER_SEC, SECONDS_PER_DAY, secs_to_ns};
use crate::sink::{ChannelSet, MARKER_CHANNEL};

/// Retained rotation connections when rotation is on and none were asked for.
pub const DEFAULT_ROTATING_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl SampleType {
    pub fn width(self) -> usize {
        match self {
            SampleType::I8 => 1,
            SampleType::I16 => 2,
            SampleType::I32 | SampleType::F32 => 4,
            SampleType::I64 | SampleType::F64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SampleType::I8 => "i8",
            SampleType::I16 => "i16",
            SampleType::I32 => "i32",
            SampleType::I64 => "i64",
            SampleType::F32 => "f32",
            SampleType::F64 => "f64",
        }
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "i8" => Ok(SampleType::I8),
            "i16" => Ok(SampleType::I16),
            "i32" => Ok(SampleType::I32),
            "i64" => Ok(SampleType::I64),
            "f32" => Ok(SampleType::F32),
            "f64" => Ok(SampleType::F64),
            other => Err(ConfigError::message(format!(
                "unrecognized data type '{}', expected one of i8, i16, i32, i64, f32, f64",
                other
            ))),
        }
    }
}

/// Byte order of samples and of the optional block timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WordOrder {
    Msb,
    Lsb,
}

impl WordOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            WordOrder::Msb => "MSB",
            WordOrder::Lsb => "LSB",
        }
    }
}

impl fmt::Display for WordOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WordOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MSB" => Ok(WordOrder::Msb),
            "LSB" => Ok(WordOrder::Lsb),
            other => Err(ConfigError::message(format!(
                "unrecognized word order '{}', expected MSB or LSB",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// `0` binds an ephemeral port.
    pub listen_port: u16,
    /// `None` waits for a previous instance on the port for as long as it takes.
    pub port_wait_ms: Option<u64>,
    pub sink_address: String,
    pub source_name: String,
    pub channel_count: Option<usize>,
    pub channel_names: Option<Vec<String>>,
    pub channel_prefix: String,
    pub sample_type: SampleType,
    pub word_order: WordOrder,
    pub block_duration: f64,
    pub block_points: usize,
    pub frames_per_write: usize,
    pub cutoff_secs: f64,
    pub retained_connections: u32,
    pub cache_frames: u32,
    pub archive_frames: u32,
    /// Hard-close connections whose window is over instead of detaching them.
    pub discard_retired: bool,
    pub input_timestamps: bool,
    pub single_thread: bool,
    pub multiple_sources: bool,
    pub quiet: bool,
    pub swap_wake_interval_ms: u64,
    /// Fixed offset from UTC used for midnight alignment; the host's local
    /// offset at startup when unset.
    pub utc_offset_secs: Option<i32>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_port: 3000,
            port_wait_ms: None,
            sink_address: "localhost:3333".to_string(),
            source_name: "Proxy".to_string(),
            channel_count: None,
            channel_names: None,
            channel_prefix: "c".to_string(),
            sample_type: SampleType::I16,
            word_order: WordOrder::Msb,
            block_duration: 1.0,
            block_points: 1000,
            frames_per_write: 1,
            cutoff_secs: 0.0,
            retained_connections: 1,
            cache_frames: 1000,
            archive_frames: 0,
            discard_retired: false,
            input_timestamps: false,
            single_thread: false,
            multiple_sources: false,
            quiet: false,
            swap_wake_interval_ms: 10_000,
            utc_offset_secs: None,
        }
    }
}

pub fn load(path: impl AsRef<Path>) -> Result<RelayConfig, ConfigError> {
    let path = path.as_ref();
    let txt = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::with_context(format!("reading {}", path.display()), e))?;
    toml::from_str(&txt)
        .map_err(|e| ConfigError::with_context(format!("parsing {}", path.display()), e))
}

impl RelayConfig {
    /// Applies the connection-count defaults that depend on rotation.
    pub fn normalize(&mut self) {
        if self.rotation_enabled() {
            if self.retained_connections <= 1 {
                self.retained_connections = DEFAULT_ROTATING_CONNECTIONS;
            }
        } else {
            self.retained_connections = 1;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_name.trim().is_empty() {
            return Err(ConfigError::message("source name must not be empty"));
        }
        if self.sink_address.trim().is_empty() {
            return Err(ConfigError::message("sink address must not be empty"));
        }
        if !secs_to_ns(self.block_duration).is_some_and(|ns| ns > 0) {
            return Err(ConfigError::message(format!(
                "block duration must be at least 1 ns, got {} s",
                self.block_duration
            )));
        }
        if self.block_points == 0 {
            return Err(ConfigError::message("block points must be >= 1"));
        }
        if self.frames_per_write == 0 {
            return Err(ConfigError::message("frames per write must be >= 1"));
        }
        if self.retained_connections == 0 {
            return Err(ConfigError::message("number of connections must be >= 1"));
        }
        if self.swap_wake_interval_ms == 0 {
            return Err(ConfigError::message("swap wake interval must be > 0"));
        }
        if let Some(offset) = self.utc_offset_secs {
            if FixedOffset::east_opt(offset).is_none() {
                return Err(ConfigError::message(format!(
                    "utc offset {} seconds is out of range",
                    offset
                )));
            }
        }

        self.validate_cutoff()?;
        let channels = self.channel_set()?;
        if self.rotation_enabled() && channels.contains(MARKER_CHANNEL) {
            return Err(ConfigError::message(format!(
                "channel name '{}' is reserved for boundary markers when rotating",
                MARKER_CHANNEL
            )));
        }
        Ok(())
    }

    fn validate_cutoff(&self) -> Result<(), ConfigError> {
        let cutoff = self.cutoff_secs;
        if !cutoff.is_finite() || cutoff < 0.0 {
            return Err(ConfigError::message(format!(
                "cutoff must be >= 0 seconds, got {}",
                cutoff
            )));
        }
        if cutoff == 0.0 {
            return Ok(());
        }

        let cutoff_ms = (cutoff * 1000.0).round() as u64;
        if cutoff_ms % 1000 != 0 {
            return Err(ConfigError::message(format!(
                "cutoff {} must be a whole number of seconds",
                cutoff
            )));
        }
        let secs = cutoff_ms / 1000;
        if secs == 0 || secs > SECONDS_PER_DAY {
            return Err(ConfigError::message(format!(
                "cutoff {} s must be between 1 s and one day",
                secs
            )));
        }
        if SECONDS_PER_DAY % secs != 0 {
            return Err(ConfigError::message(format!(
                "cutoff {} s must evenly divide one day",
                secs
            )));
        }
        Ok(())
    }

    pub fn rotation_enabled(&self) -> bool {
        self.cutoff_secs > 0.0
    }

    pub fn cutoff_ns(&self) -> u64 {
        if !self.rotation_enabled() {
            return 0;
        }
        (self.cutoff_secs * 1000.0).round() as u64 / 1000 * NANOS_PER_SEC
    }

    pub fn block_duration_ns(&self) -> u64 {
        secs_to_ns(self.block_duration).unwrap_or(0)
    }

    pub fn archive_enabled(&self) -> bool {
        self.archive_frames > 0
    }

    pub fn utc_offset(&self) -> FixedOffset {
        match self.utc_offset_secs.and_then(FixedOffset::east_opt) {
            Some(offset) => offset,
            None => Local::now().offset().fix(),
        }
    }

    /// Resolves `channel_names`/`channel_count` into the registered channel list.
    pub fn channel_set(&self) -> Result<ChannelSet, ConfigError> {
        match (&self.channel_names, self.channel_count) {
            (Some(names), count) => {
                if let Some(count) = count {
                    if count != names.len() {
                        return Err(ConfigError::message(format!(
                            "channel count {} does not match {} channel names",
                            count,
                            names.len()
                        )));
                    }
                }
                ChannelSet::new(names.clone())
            }
            (None, count) => {
                let count = count.unwrap_or(1);
                if count == 0 {
                    return Err(ConfigError::message("channel count must be >= 1"));
                }
                if self.channel_prefix.trim().is_empty() {
                    return Err(ConfigError::message("channel prefix must not be empty"));
                }
                Ok(ChannelSet::generated(&self.channel_prefix, count))
            }
        }
    }
}
