// src/lib.rs
pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod io;
pub mod relay;
pub mod sink;
pub mod testing;

// Re-export the types callers need to embed a relay
pub use app::Server;
pub use config::{RelayConfig, SampleType, WordOrder};
pub use crate::core::timestamp::utc_ns_now;
pub use crate::core::{ComponentLogger, LogContext, RelayError};
pub use io::listener::PortRegistry;
pub use relay::{Relay, RelayReport, ShutdownCoordinator, StopReason};
pub use sink::{SinkHandle, SinkService, TcpSinkService};
