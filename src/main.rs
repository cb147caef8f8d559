// src/main.rs

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use relay_node::cli::Cli;
use relay_node::{PortRegistry, Server, ShutdownCoordinator, StopReason, TcpSinkService};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();

    // ------------------------------------------------------------
    // Config
    // ------------------------------------------------------------
    let cfg = cli.into_config().context("invalid configuration")?;
    info!(
        "[relay] source {} -> {}, listening on port {}",
        cfg.source_name, cfg.sink_address, cfg.listen_port
    );

    // ------------------------------------------------------------
    // Graceful shutdown
    // ------------------------------------------------------------
    let shutdown = ShutdownCoordinator::new();
    shutdown
        .install_signal_handler()
        .context("installing signal handler")?;
    let _stopped = shutdown.stopped_guard();

    // ------------------------------------------------------------
    // Serve
    // ------------------------------------------------------------
    let service = Arc::new(TcpSinkService::new(cfg.sink_address.clone()));
    let registry = PortRegistry::new();
    let report = Server::serve(cfg, service, &registry, shutdown.clone())
        .context("relay setup failed")?;

    match report.reason {
        StopReason::EndOfStream | StopReason::Interrupted => Ok(()),
        reason => {
            let detail = report
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("{:?}", reason));
            error!("[relay] stopped abnormally: {}", detail);
            Err(anyhow::anyhow!("relay stopped: {}", detail))
        }
    }
}
