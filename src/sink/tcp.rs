// src/sink/tcp.rs
//
// Sink service client speaking newline-delimited JSON over TCP. Every
// request gets exactly one reply line: {"ok":true,...} or
// {"ok":false,"error":"..."}. Sample payloads travel base64 encoded.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{ArchiveMode, ChannelSet, HandleOptions, Record, SinkHandle, SinkService};
use crate::config::{SampleType, WordOrder};
use crate::core::error::SinkError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Open {
        name: &'a str,
        cache_frames: u32,
        archive_frames: u32,
        archive_mode: ArchiveMode,
    },
    Register {
        channels: &'a [String],
    },
    Write {
        sync: bool,
        record: WireRecord,
    },
    ClearCache,
    Detach,
    Close,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireRecord {
    Samples {
        start_ns: u64,
        duration_ns: u64,
        sample_type: SampleType,
        word_order: WordOrder,
        channels: Vec<String>,
    },
    Marker {
        time_ns: u64,
        value_ns: u64,
    },
}

impl WireRecord {
    fn from_record(record: &Record<'_>) -> Self {
        match record {
            Record::Samples(batch) => WireRecord::Samples {
                start_ns: batch.start_ns,
                duration_ns: batch.duration_ns,
                sample_type: batch.sample_type,
                word_order: batch.word_order,
                channels: batch
                    .channels
                    .iter()
                    .map(|data| general_purpose::STANDARD.encode(data))
                    .collect(),
            },
            Record::Marker { time_ns, value_ns } => WireRecord::Marker {
                time_ns: *time_ns,
                value_ns: *value_ns,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TcpSinkService {
    address: String,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpSinkService {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: CONNECT_TIMEOUT,
            io_timeout: IO_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, io_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.io_timeout = io_timeout;
        self
    }
}

impl SinkService for TcpSinkService {
    fn address(&self) -> &str {
        &self.address
    }

    fn create_handle(&self) -> Box<dyn SinkHandle> {
        Box::new(TcpSinkHandle {
            address: self.address.clone(),
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
            name: String::new(),
            conn: None,
        })
    }
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

pub struct TcpSinkHandle {
    address: String,
    connect_timeout: Duration,
    io_timeout: Duration,
    name: String,
    conn: Option<Connection>,
}

impl TcpSinkHandle {
    fn connect(&self) -> Result<Connection, SinkError> {
        let addrs = self
            .address
            .to_socket_addrs()
            .map_err(|e| SinkError::io(&self.name, e))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    stream
                        .set_read_timeout(Some(self.io_timeout))
                        .map_err(|e| SinkError::io(&self.name, e))?;
                    stream
                        .set_write_timeout(Some(self.io_timeout))
                        .map_err(|e| SinkError::io(&self.name, e))?;
                    let reader_stream =
                        stream.try_clone().map_err(|e| SinkError::io(&self.name, e))?;
                    return Ok(Connection {
                        reader: BufReader::new(reader_stream),
                        writer: BufWriter::new(stream),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) => SinkError::io(&self.name, e),
            None => SinkError::protocol(
                &self.name,
                format!("address '{}' did not resolve", self.address),
            ),
        })
    }

    fn call(&mut self, op: &'static str, request: &Request<'_>) -> Result<Reply, SinkError> {
        let name = self.name.clone();
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| SinkError::NotOpen { name: name.clone() })?;

        let mut line =
            serde_json::to_vec(request).map_err(|e| SinkError::protocol(&name, e.to_string()))?;
        line.push(b'\n');

        let exchange = (|| -> Result<String, std::io::Error> {
            conn.writer.write_all(&line)?;
            conn.writer.flush()?;
            let mut reply = String::new();
            let n = conn.reader.read_line(&mut reply)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "sink closed the connection",
                ));
            }
            Ok(reply)
        })();

        let reply_line = match exchange {
            Ok(reply) => reply,
            Err(e) => {
                self.conn = None;
                return Err(SinkError::io(name, e));
            }
        };

        let reply: Reply = serde_json::from_str(reply_line.trim_end())
            .map_err(|e| SinkError::protocol(&name, format!("bad reply to {}: {}", op, e)))?;
        if !reply.ok {
            return Err(SinkError::Remote {
                name,
                op,
                message: reply.error.unwrap_or_else(|| "unspecified error".into()),
            });
        }
        Ok(reply)
    }

    /// Sends a terminal request; the connection is gone afterwards either way.
    fn finish(&mut self, op: &'static str, request: &Request<'_>) -> Result<(), SinkError> {
        if self.conn.is_none() {
            return Ok(());
        }
        let result = self.call(op, request).map(|_| ());
        self.conn = None;
        result
    }
}

impl SinkHandle for TcpSinkHandle {
    fn open(&mut self, name: &str, options: &HandleOptions) -> Result<String, SinkError> {
        self.name = name.to_string();
        self.conn = None;
        self.conn = Some(self.connect()?);

        let reply = self.call(
            "open",
            &Request::Open {
                name,
                cache_frames: options.cache_frames,
                archive_frames: options.archive_frames,
                archive_mode: options.archive_mode,
            },
        );
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.conn = None;
                return Err(e);
            }
        };

        let assigned = reply.name.unwrap_or_else(|| name.to_string());
        debug!("[sink] {} opened '{}' as '{}'", self.address, name, assigned);
        self.name = assigned.clone();
        Ok(assigned)
    }

    fn register(&mut self, channels: &ChannelSet) -> Result<(), SinkError> {
        self.call(
            "register",
            &Request::Register {
                channels: channels.names(),
            },
        )
        .map(|_| ())
    }

    fn write(&mut self, record: &Record<'_>, sync: bool) -> Result<(), SinkError> {
        self.call(
            "write",
            &Request::Write {
                sync,
                record: WireRecord::from_record(record),
            },
        )
        .map(|_| ())
    }

    fn clear_cache(&mut self) -> Result<(), SinkError> {
        self.call("clear_cache", &Request::ClearCache).map(|_| ())
    }

    fn detach(&mut self) -> Result<(), SinkError> {
        self.finish("detach", &Request::Detach)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.finish("close", &Request::Close)
    }
}
