// src/app.rs
//
// One serving instance: claims the port, connects the relay to the sink,
// accepts the stream and relays it until it ends or shutdown is requested.

use std::net::Shutdown;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::config::RelayConfig;
use crate::core::error::RelayError;
use crate::io::listener::{POLL_INTERVAL, PortClaim, PortRegistry, StreamListener};
use crate::io::stream_in::{BlockFramer, FrameLayout};
use crate::relay::{Relay, RelayReport, ShutdownCoordinator, StopReason};
use crate::sink::SinkService;

pub struct Server {
    config: RelayConfig,
    channels: usize,
    shutdown: ShutdownCoordinator,
    relay: Relay,
    // dropped before the claim so the port is free once the claim goes
    listener: StreamListener,
    claim: PortClaim,
}

impl Server {
    /// Claims the listen port, opens the sink connections and binds.
    pub fn prepare(
        config: RelayConfig,
        service: Arc<dyn SinkService>,
        registry: &PortRegistry,
        shutdown: ShutdownCoordinator,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        let channels = config.channel_set()?.len();
        let wait = config.port_wait_ms.map(Duration::from_millis);

        let early_claim = match config.listen_port {
            0 => None,
            port => Some(registry.claim(port, wait)?),
        };

        let mut relay = Relay::start(&config, service, &shutdown)?;

        let listener = match StreamListener::bind(config.listen_port) {
            Ok(listener) => listener,
            Err(e) => {
                relay.drain(StopReason::Fatal);
                return Err(e);
            }
        };
        let claim = match early_claim {
            Some(claim) => claim,
            None => match registry.claim(listener.local_port(), wait) {
                Ok(claim) => claim,
                Err(e) => {
                    relay.drain(StopReason::Fatal);
                    return Err(e);
                }
            },
        };

        Ok(Self {
            config,
            channels,
            shutdown,
            relay,
            listener,
            claim,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.listener.local_port()
    }

    /// Waits for the stream and relays it. Connections are released on
    /// every exit path.
    pub fn run(self) -> RelayReport {
        let Server {
            config,
            channels,
            shutdown,
            mut relay,
            listener,
            claim,
        } = self;

        let stop = shutdown.flag();
        let accepted = listener.accept(&claim, &stop);
        drop(listener);
        let (stream, peer) = match accepted {
            Ok(Some(conn)) => conn,
            Ok(None) => {
                relay.drain(StopReason::Interrupted);
                return idle_report(StopReason::Interrupted, None);
            }
            Err(e) => {
                relay.drain(StopReason::StreamError);
                return idle_report(StopReason::StreamError, Some(e));
            }
        };

        match stream.try_clone() {
            Ok(handle) => shutdown.on_interrupt(move || {
                // unblocks the reader; errors mean the socket is gone already
                let _ = handle.shutdown(Shutdown::Both);
            }),
            Err(e) => warn!("[relay] stream {} cannot be interrupted: {}", peer, e),
        }

        let done = Arc::new(AtomicBool::new(false));
        let watcher = watch_eviction(&claim, &shutdown, done.clone());

        let layout = FrameLayout::from_config(&config, channels);
        info!(
            "[relay] relaying {} from {} ({} bytes per write)",
            config.source_name,
            peer,
            layout.unit_bytes()
        );
        let mut framer = BlockFramer::new(stream, layout);
        let report = relay.run(&mut framer, &shutdown);

        done.store(true, Ordering::SeqCst);
        if let Some(handle) = watcher {
            let _ = handle.join();
        }
        info!(
            "[relay] {} done: {:?}, {} blocks, {} bytes, {} rotations",
            config.source_name, report.reason, report.blocks, framer.bytes_read(), report.rotations
        );
        report
    }

    /// `prepare` followed by `run`.
    pub fn serve(
        config: RelayConfig,
        service: Arc<dyn SinkService>,
        registry: &PortRegistry,
        shutdown: ShutdownCoordinator,
    ) -> Result<RelayReport, RelayError> {
        Ok(Self::prepare(config, service, registry, shutdown)?.run())
    }
}

fn idle_report(reason: StopReason, error: Option<RelayError>) -> RelayReport {
    RelayReport {
        blocks: 0,
        bytes: 0,
        rotations: 0,
        reason,
        error,
    }
}

/// Stops this instance when a newer one claims the port mid-stream.
fn watch_eviction(
    claim: &PortClaim,
    shutdown: &ShutdownCoordinator,
    done: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let evicted = claim.eviction_flag();
    let shutdown = shutdown.clone();
    let port = claim.port();
    let spawned = thread::Builder::new()
        .name(format!("evict-watch-{}", port))
        .spawn(move || {
            while !done.load(Ordering::SeqCst) {
                if evicted.load(Ordering::SeqCst) {
                    info!("[relay] port {} taken over by a new instance, stopping", port);
                    shutdown.request();
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("[relay] eviction watcher not started: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockSinkService, SinkEvent};

    fn config() -> RelayConfig {
        RelayConfig {
            listen_port: 0,
            block_points: 1,
            sample_type: crate::config::SampleType::I8,
            channel_count: Some(1),
            ..RelayConfig::default()
        }
    }

    #[test]
    fn connections_open_before_accept() {
        let service = MockSinkService::new();
        let registry = PortRegistry::new();
        let server = Server::prepare(
            config(),
            Arc::new(service.clone()),
            &registry,
            ShutdownCoordinator::new(),
        )
        .unwrap();

        assert_eq!(service.opened_names(), ["Proxy"]);
        assert!(registry.is_claimed(server.local_port()));
    }

    #[test]
    fn shutdown_during_accept_releases_connections() {
        let service = MockSinkService::new();
        let registry = PortRegistry::new();
        let shutdown = ShutdownCoordinator::new();
        let server = Server::prepare(
            config(),
            Arc::new(service.clone()),
            &registry,
            shutdown.clone(),
        )
        .unwrap();
        let port = server.local_port();

        shutdown.request();
        let report = server.run();
        assert_eq!(report.reason, StopReason::Interrupted);
        assert_eq!(report.blocks, 0);
        assert_eq!(
            service.events_for("Proxy").last(),
            Some(&SinkEvent::Detached { name: "Proxy".into() })
        );
        assert!(!registry.is_claimed(port));
    }

    #[test]
    fn invalid_config_is_rejected_before_claiming() {
        let service = MockSinkService::new();
        let registry = PortRegistry::new();
        let cfg = RelayConfig {
            listen_port: 4321,
            block_points: 0,
            ..config()
        };
        let err = Server::prepare(cfg, Arc::new(service.clone()), &registry, ShutdownCoordinator::new())
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Config(_)));
        assert!(!registry.is_claimed(4321));
        assert!(service.events().is_empty());
    }
}
