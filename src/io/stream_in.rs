// src/io/stream_in.rs
//
// Frames the raw inbound byte stream into fixed-size blocks. Wire layout of
// one write unit:
//
//   [f64 timestamp, seconds]          only with input timestamps
//   frames_per_write x {
//       channel 0: points x width bytes
//       ...
//       channel n-1
//   }
//
// No delimiters; both sides agree on the layout through configuration.

use std::io::{self, BufReader, ErrorKind, Read};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::config::{RelayConfig, WordOrder};
use crate::core::timestamp::{MAX_TIMESTAMP_NS, timestamp_to_ns, utc_ns_now};

const READ_BUFFER_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub seq: u64,
    /// First-block time plus `seq` block durations.
    pub stream_ns: u64,
    /// Decoded block timestamp, or `stream_ns` when the input carries none.
    pub input_ns: u64,
    pub duration_ns: u64,
    pub channels: Vec<Vec<u8>>,
}

impl Block {
    pub fn end_stream_ns(&self) -> u64 {
        self.stream_ns.saturating_add(self.duration_ns)
    }

    pub fn end_input_ns(&self) -> u64 {
        self.input_ns.saturating_add(self.duration_ns)
    }

    pub fn byte_len(&self) -> usize {
        self.channels.iter().map(Vec::len).sum()
    }
}

#[derive(Debug)]
pub enum NextBlock {
    Block(Block),
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub channels: usize,
    pub frames_per_write: usize,
    /// Bytes of one channel in one sub-block.
    pub sub_block_bytes: usize,
    pub timestamps: bool,
    pub word_order: WordOrder,
    pub duration_ns: u64,
}

impl FrameLayout {
    pub fn from_config(cfg: &RelayConfig, channels: usize) -> Self {
        Self {
            channels,
            frames_per_write: cfg.frames_per_write,
            sub_block_bytes: cfg.block_points * cfg.sample_type.width(),
            timestamps: cfg.input_timestamps,
            word_order: cfg.word_order,
            duration_ns: cfg.block_duration_ns(),
        }
    }

    pub fn channel_bytes(&self) -> usize {
        self.frames_per_write * self.sub_block_bytes
    }

    pub fn unit_bytes(&self) -> usize {
        let ts = if self.timestamps { 8 } else { 0 };
        ts + self.channels * self.channel_bytes()
    }
}

pub struct BlockFramer<R: Read> {
    reader: BufReader<R>,
    layout: FrameLayout,
    next_seq: u64,
    first_ns: Option<u64>,
    bytes_read: u64,
}

impl<R: Read> BlockFramer<R> {
    pub fn new(inner: R, layout: FrameLayout) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_BYTES, inner),
            layout,
            next_seq: 0,
            first_ns: None,
            bytes_read: 0,
        }
    }

    /// Pins the first block's stream time instead of sampling the wall clock.
    pub fn starting_at(mut self, first_ns: u64) -> Self {
        self.first_ns = Some(first_ns);
        self
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Reads one complete write unit. A clean end of input before the first
    /// byte of a unit is `EndOfStream`; anywhere else it is an error.
    pub fn next_block(&mut self) -> io::Result<NextBlock> {
        let mut timestamp_ns = None;
        let mut started = false;

        if self.layout.timestamps {
            let mut raw = [0u8; 8];
            if !self.read_unit_start(&mut raw)? {
                return Ok(NextBlock::EndOfStream);
            }
            started = true;
            let mut cursor = &raw[..];
            let seconds = match self.layout.word_order {
                WordOrder::Msb => cursor.read_f64::<BigEndian>()?,
                WordOrder::Lsb => cursor.read_f64::<LittleEndian>()?,
            };
            let ns = timestamp_to_ns(seconds).ok_or_else(|| {
                io::Error::new(
                    ErrorKind::InvalidData,
                    format!("invalid block timestamp {}", seconds),
                )
            })?;
            timestamp_ns = Some(ns);
        }

        let channel_bytes = self.layout.channel_bytes();
        let mut channels: Vec<Vec<u8>> = (0..self.layout.channels)
            .map(|_| vec![0u8; channel_bytes])
            .collect();

        for f in 0..self.layout.frames_per_write {
            let offset = f * self.layout.sub_block_bytes;
            for data in channels.iter_mut() {
                let slot = &mut data[offset..offset + self.layout.sub_block_bytes];
                if !started {
                    if !self.read_unit_start(slot)? {
                        return Ok(NextBlock::EndOfStream);
                    }
                    started = true;
                } else {
                    self.reader.read_exact(slot)?;
                    self.bytes_read += slot.len() as u64;
                }
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let first_ns = *self
            .first_ns
            .get_or_insert_with(|| timestamp_ns.unwrap_or_else(utc_ns_now));
        let stream_ns = seq
            .checked_mul(self.layout.duration_ns)
            .and_then(|offset| first_ns.checked_add(offset))
            .filter(|&ns| ns <= MAX_TIMESTAMP_NS)
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::InvalidData,
                    format!("stream time of block {} is out of range", seq),
                )
            })?;

        Ok(NextBlock::Block(Block {
            seq,
            stream_ns,
            input_ns: timestamp_ns.unwrap_or(stream_ns),
            duration_ns: self.layout.duration_ns,
            channels,
        }))
    }

    /// Fills `buf` from the start of a unit; `false` on a clean end of input.
    fn read_unit_start(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "stream ended inside a block",
                    ));
                }
                Ok(n) => {
                    filled += n;
                    self.bytes_read += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
