use std::error::Error as StdError;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{message}")]
    Message { message: String },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl ConfigError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

/// Failure of a single remote call against the sink service.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("connection '{name}' i/o: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sink rejected {op} on '{name}': {message}")]
    Remote {
        name: String,
        op: &'static str,
        message: String,
    },
    #[error("sink protocol error on '{name}': {message}")]
    Protocol { name: String, message: String },
    #[error("connection '{name}' is not open")]
    NotOpen { name: String },
}

impl SinkError {
    pub fn io(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            name: name.into(),
            source,
        }
    }

    pub fn protocol(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("could not open connection '{name}' after {attempts} attempts")]
    OpenExhausted {
        name: String,
        attempts: u32,
        #[source]
        source: SinkError,
    },
    #[error("did not get correct name: requested '{requested}', server assigned '{assigned}'")]
    NameMismatch { requested: String, assigned: String },
    #[error("open of '{name}' abandoned: shutdown requested")]
    Cancelled { name: String },
    #[error("write to '{name}' failed")]
    WriteFailed {
        name: String,
        #[source]
        source: SinkError,
    },
    #[error("{op} on '{name}' failed")]
    Sink {
        name: String,
        op: &'static str,
        #[source]
        source: SinkError,
    },
    #[error("stream read failed")]
    Stream(#[source] std::io::Error),
    #[error("no writable connection for '{lane}'")]
    NoActiveConnection { lane: String },
    #[error("swap worker for '{lane}' aborted")]
    SwapWorkerGone { lane: String },
    #[error("port {port} still held by another instance after {waited_ms} ms")]
    PortBusy { port: u16, waited_ms: u64 },
    #[error("listener on port {port}: {source}")]
    Listener {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

impl RelayError {
    pub fn sink(name: impl Into<String>, op: &'static str, source: SinkError) -> Self {
        Self::Sink {
            name: name.into(),
            op,
            source,
        }
    }

    /// Errors that were caused by a shutdown request rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
