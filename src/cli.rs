use std::path::PathBuf;

use clap::Parser;

use crate::config::{self, RelayConfig, SampleType, WordOrder};
use crate::core::error::ConfigError;

/// Command line flags. Every flag is optional and overrides the value from
/// `--config` (or the built-in default).
#[derive(Debug, Parser)]
#[command(
    name = "relay-node",
    version,
    about = "Relays a raw sample stream from a TCP socket into a sink service",
    long_about = "Accepts one TCP stream of fixed-size sample blocks and forwards it to a \
                  sink service, optionally rolling over to a new connection at \
                  calendar-aligned cutoffs."
)]
pub struct Cli {
    /// TOML file with relay settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port to accept the stream on
    #[arg(short = 'x', long = "port")]
    pub port: Option<u16>,

    /// Sink service address (host:port)
    #[arg(short = 'a', long = "address")]
    pub address: Option<String>,

    /// Source base name
    #[arg(short = 's', long = "source")]
    pub source: Option<String>,

    /// Number of channels
    #[arg(short = 'n', long = "channels")]
    pub channels: Option<usize>,

    /// Comma separated channel names
    #[arg(short = 'C', long = "channel-names", value_delimiter = ',')]
    pub channel_names: Option<Vec<String>>,

    /// Sample type: i8, i16, i32, i64, f32 or f64
    #[arg(short = 't', long = "type")]
    pub sample_type: Option<SampleType>,

    /// Word order of samples and timestamps: MSB or LSB
    #[arg(short = 'w', long = "word-order")]
    pub word_order: Option<WordOrder>,

    /// Block duration in seconds
    #[arg(short = 'b', long = "block-duration")]
    pub block_duration: Option<f64>,

    /// Points per channel per block
    #[arg(short = 'p', long = "points")]
    pub points: Option<usize>,

    /// Blocks per write
    #[arg(short = 'f', long = "frames")]
    pub frames: Option<usize>,

    /// Rotation period in seconds, 0 disables rotation
    #[arg(short = 'O', long = "cutoff")]
    pub cutoff: Option<f64>,

    /// Retained rotation connections
    #[arg(short = 'N', long = "connections")]
    pub connections: Option<u32>,

    /// Cache frames per connection
    #[arg(short = 'c', long = "cache")]
    pub cache: Option<u32>,

    /// Archive frames per connection, 0 disables archiving
    #[arg(short = 'd', long = "archive")]
    pub archive: Option<u32>,

    /// Blocks are prefixed with an 8 byte timestamp in seconds
    #[arg(short = 'T', long = "timestamps")]
    pub timestamps: bool,

    /// Toggle single-thread mode
    #[arg(short = 'S', long = "single-thread")]
    pub single_thread: bool,

    /// One source per channel
    #[arg(short = 'M', long = "multiple-sources")]
    pub multiple_sources: bool,

    /// Quiet: only warnings and errors
    #[arg(short = 'X', long = "quiet")]
    pub quiet: bool,

    /// Hard-close connections when their window ends
    #[arg(long)]
    pub discard_retired: bool,

    /// Give up if a previous instance keeps the port longer than this
    #[arg(long)]
    pub port_wait_ms: Option<u64>,

    /// Offset from UTC, in seconds, used to align windows to midnight
    #[arg(long, allow_hyphen_values = true)]
    pub utc_offset: Option<i32>,
}

impl Cli {
    /// Loads `--config` if given and applies the flags on top.
    pub fn into_config(self) -> Result<RelayConfig, ConfigError> {
        let mut cfg = match &self.config {
            Some(path) => config::load(path)?,
            None => RelayConfig::default(),
        };
        self.apply(&mut cfg);
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply(self, cfg: &mut RelayConfig) {
        if let Some(port) = self.port {
            cfg.listen_port = port;
        }
        if let Some(address) = self.address {
            cfg.sink_address = address;
        }
        if let Some(source) = self.source {
            cfg.source_name = source;
        }
        if let Some(count) = self.channels {
            cfg.channel_count = Some(count);
        }
        if let Some(names) = self.channel_names {
            cfg.channel_names = Some(names.into_iter().map(|n| n.trim().to_string()).collect());
        }
        if let Some(sample_type) = self.sample_type {
            cfg.sample_type = sample_type;
        }
        if let Some(word_order) = self.word_order {
            cfg.word_order = word_order;
        }
        if let Some(duration) = self.block_duration {
            cfg.block_duration = duration;
        }
        if let Some(points) = self.points {
            cfg.block_points = points;
        }
        if let Some(frames) = self.frames {
            cfg.frames_per_write = frames;
        }
        if let Some(cutoff) = self.cutoff {
            cfg.cutoff_secs = cutoff;
        }
        if let Some(connections) = self.connections {
            cfg.retained_connections = connections;
        }
        if let Some(cache) = self.cache {
            cfg.cache_frames = cache;
        }
        if let Some(archive) = self.archive {
            cfg.archive_frames = archive;
        }
        if self.timestamps {
            cfg.input_timestamps = true;
        }
        if self.single_thread {
            cfg.single_thread = !cfg.single_thread;
        }
        if self.multiple_sources {
            cfg.multiple_sources = true;
        }
        if self.quiet {
            cfg.quiet = true;
        }
        if self.discard_retired {
            cfg.discard_retired = true;
        }
        if let Some(wait) = self.port_wait_ms {
            cfg.port_wait_ms = Some(wait);
        }
        if let Some(offset) = self.utc_offset {
            cfg.utc_offset_secs = Some(offset);
        }
    }
}
