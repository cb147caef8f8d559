// src/relay/node.rs
//
// Relay core: reads blocks from the framer and hands them to every lane
// until the stream ends, fails, or shutdown is requested, then drains.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RelayConfig;
use crate::core::error::RelayError;
use crate::core::logging::{ComponentLogger, LogContext};
use crate::io::stream_in::{BlockFramer, NextBlock};
use crate::sink::SinkService;

use super::lane::Lane;
use super::shutdown::ShutdownCoordinator;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    Streaming,
    Rotating,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Interrupted,
    StreamError,
    /// A sink operation failed; connections were hard-closed.
    Fatal,
}

#[derive(Debug)]
pub struct RelayReport {
    pub blocks: u64,
    pub bytes: u64,
    pub rotations: u64,
    pub reason: StopReason,
    pub error: Option<RelayError>,
}

impl RelayReport {
    pub fn is_clean(&self) -> bool {
        matches!(self.reason, StopReason::EndOfStream | StopReason::Interrupted)
    }
}

pub struct Relay {
    name: String,
    lanes: Vec<Lane>,
    state: RelayState,
    slow_op: Duration,
}

impl ComponentLogger for Relay {
    fn log_context(&self) -> LogContext {
        LogContext::new("Relay", &self.name)
    }
}

impl Relay {
    /// Normalizes and validates a copy of `cfg`, then opens every lane's
    /// connections.
    pub fn start(
        cfg: &RelayConfig,
        service: Arc<dyn SinkService>,
        shutdown: &ShutdownCoordinator,
    ) -> Result<Self, RelayError> {
        let mut cfg = cfg.clone();
        cfg.normalize();
        let cfg = &cfg;
        cfg.validate()?;
        let channels = cfg.channel_set()?;
        let cancel = shutdown.flag();

        let plan: Vec<(String, Vec<usize>)> = if cfg.multiple_sources {
            channels
                .names()
                .iter()
                .enumerate()
                .map(|(idx, channel)| (format!("{}.{}", cfg.source_name, channel), vec![idx]))
                .collect()
        } else {
            vec![(cfg.source_name.clone(), (0..channels.len()).collect())]
        };

        let mut lanes: Vec<Lane> = Vec::with_capacity(plan.len());
        for (name, indices) in plan {
            let lane_channels = channels.subset(&indices);
            match Lane::open(cfg, &name, indices, lane_channels, service.clone(), cancel.clone()) {
                Ok(lane) => lanes.push(lane),
                Err(e) => {
                    log::error!("[relay] could not open {}: {}", name, e);
                    for lane in lanes.iter_mut() {
                        lane.release(true);
                    }
                    return Err(e);
                }
            }
        }

        let relay = Self {
            name: cfg.source_name.clone(),
            lanes,
            state: RelayState::Init,
            slow_op: Duration::from_nanos(cfg.block_duration_ns()) * 50,
        };
        relay.info(&format!(
            "{} lane(s) connected to {}, {} channel(s), rotation {}",
            relay.lanes.len(),
            service.address(),
            channels.len(),
            if cfg.rotation_enabled() {
                format!("every {} s", cfg.cutoff_ns() / 1_000_000_000)
            } else {
                "off".to_string()
            }
        ));
        Ok(relay)
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    /// Streams until end of input, a fatal error, or shutdown; then drains
    /// and releases every connection.
    pub fn run<R: Read>(
        &mut self,
        framer: &mut BlockFramer<R>,
        shutdown: &ShutdownCoordinator,
    ) -> RelayReport {
        let mut blocks = 0u64;
        let mut bytes = 0u64;
        let mut rotations = 0u64;
        let mut error = None;
        let mut last_stats = Instant::now();
        let mut blocks_since_stats = 0u64;

        self.state = RelayState::Streaming;

        let reason = loop {
            if shutdown.is_requested() {
                break StopReason::Interrupted;
            }

            let started = Instant::now();
            let block = match framer.next_block() {
                Ok(NextBlock::Block(block)) => block,
                Ok(NextBlock::EndOfStream) => {
                    if shutdown.is_requested() {
                        break StopReason::Interrupted;
                    }
                    self.info("end of stream");
                    break StopReason::EndOfStream;
                }
                Err(e) => {
                    if shutdown.is_requested() {
                        break StopReason::Interrupted;
                    }
                    self.error(&format!("error handling data, aborting: {}", e));
                    error = Some(RelayError::Stream(e));
                    break StopReason::StreamError;
                }
            };
            self.warn_if_slow("read", started, self.slow_op);

            if self.lanes.iter().any(|lane| lane.rotation_due(&block)) {
                self.state = RelayState::Rotating;
            }

            let started = Instant::now();
            let mut failure = None;
            for lane in self.lanes.iter_mut() {
                match lane.put_block(&block) {
                    Ok(true) => rotations += 1,
                    Ok(false) => {}
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failure {
                if e.is_cancellation() && shutdown.is_requested() {
                    break StopReason::Interrupted;
                }
                self.error(&format!("write failed, aborting: {}", e));
                error = Some(e);
                break StopReason::Fatal;
            }
            self.warn_if_slow("write", started, self.slow_op);
            self.state = RelayState::Streaming;

            blocks += 1;
            blocks_since_stats += 1;
            bytes += block.byte_len() as u64;

            if last_stats.elapsed() >= STATS_INTERVAL {
                self.info(&format!(
                    "{} blocks/min | total blocks={} bytes={} rotations={}",
                    blocks_since_stats, blocks, bytes, rotations
                ));
                blocks_since_stats = 0;
                last_stats = Instant::now();
            }
        };

        self.drain(reason);

        RelayReport {
            blocks,
            bytes,
            rotations,
            reason,
            error,
        }
    }

    /// Writes closing markers (unless `reason` is fatal) and releases every
    /// lane. `run` calls this itself; callers only need it when no stream
    /// ever arrived.
    pub fn drain(&mut self, reason: StopReason) {
        if self.state == RelayState::Stopped {
            return;
        }
        self.state = RelayState::Draining;
        let abort = reason == StopReason::Fatal;
        self.debug(&format!("draining after {:?}", reason));

        if !abort {
            for lane in self.lanes.iter_mut() {
                if let Err(e) = lane.finish() {
                    log::warn!("[relay] closing marker for {} failed: {}", lane.name(), e);
                }
            }
        }
        for lane in self.lanes.iter_mut() {
            lane.release(abort);
        }

        self.state = RelayState::Stopped;
        self.info(&format!("stopped ({:?})", reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::stream_in::FrameLayout;
    use crate::testing::mocks::{MockSinkService, SinkEvent};
    use std::io::Cursor;

    fn config() -> RelayConfig {
        RelayConfig {
            block_points: 2,
            sample_type: crate::config::SampleType::I8,
            channel_count: Some(2),
            ..RelayConfig::default()
        }
    }

    fn framer(cfg: &RelayConfig, bytes: Vec<u8>) -> BlockFramer<Cursor<Vec<u8>>> {
        let layout = FrameLayout::from_config(cfg, cfg.channel_set().unwrap().len());
        BlockFramer::new(Cursor::new(bytes), layout).starting_at(0)
    }

    #[test]
    fn relays_until_end_of_stream() {
        let cfg = config();
        let service = MockSinkService::new();
        let shutdown = ShutdownCoordinator::new();
        let mut relay = Relay::start(&cfg, Arc::new(service.clone()), &shutdown).unwrap();

        let mut input = framer(&cfg, (0u8..12).collect());
        let report = relay.run(&mut input, &shutdown);

        assert_eq!(report.reason, StopReason::EndOfStream);
        assert_eq!(report.blocks, 3);
        assert_eq!(report.bytes, 12);
        assert!(report.is_clean());
        assert_eq!(relay.state(), RelayState::Stopped);
        assert_eq!(service.sample_times("Proxy"), vec![0, 1_000_000_000, 2_000_000_000]);
        assert_eq!(
            service.events_for("Proxy").last(),
            Some(&SinkEvent::Detached { name: "Proxy".into() })
        );
    }

    #[test]
    fn multiple_sources_open_one_lane_per_channel() {
        let cfg = RelayConfig {
            multiple_sources: true,
            ..config()
        };
        let service = MockSinkService::new();
        let shutdown = ShutdownCoordinator::new();
        let mut relay = Relay::start(&cfg, Arc::new(service.clone()), &shutdown).unwrap();
        assert_eq!(relay.lanes().len(), 2);

        let mut input = framer(&cfg, vec![1, 1, 2, 2]);
        relay.run(&mut input, &shutdown);

        assert_eq!(service.opened_names(), ["Proxy.c0", "Proxy.c1"]);
        let c1 = service.events_for("Proxy.c1");
        assert!(c1.iter().any(|e| matches!(
            e,
            SinkEvent::Samples { channels, .. } if channels == &vec![vec![2u8, 2]]
        )));
    }

    #[test]
    fn write_failure_is_fatal_and_hard_closes() {
        let cfg = config();
        let service = MockSinkService::new();
        service.fail_writes_after(1);
        let shutdown = ShutdownCoordinator::new();
        let mut relay = Relay::start(&cfg, Arc::new(service.clone()), &shutdown).unwrap();

        let mut input = framer(&cfg, vec![0u8; 16]);
        let report = relay.run(&mut input, &shutdown);

        assert_eq!(report.reason, StopReason::Fatal);
        assert!(matches!(report.error, Some(RelayError::WriteFailed { .. })));
        assert_eq!(report.blocks, 1);
        assert_eq!(service.write_count(), 1);
        assert_eq!(
            service.events_for("Proxy").last(),
            Some(&SinkEvent::Closed { name: "Proxy".into() })
        );
    }

    #[test]
    fn truncated_stream_is_a_stream_error() {
        let cfg = config();
        let service = MockSinkService::new();
        let shutdown = ShutdownCoordinator::new();
        let mut relay = Relay::start(&cfg, Arc::new(service.clone()), &shutdown).unwrap();

        let mut input = framer(&cfg, vec![0u8; 6]);
        let report = relay.run(&mut input, &shutdown);
        assert_eq!(report.reason, StopReason::StreamError);
        assert!(!report.is_clean());
        // soft release
        assert_eq!(
            service.events_for("Proxy").last(),
            Some(&SinkEvent::Detached { name: "Proxy".into() })
        );
    }

    #[test]
    fn requested_shutdown_stops_before_reading() {
        let cfg = config();
        let service = MockSinkService::new();
        let shutdown = ShutdownCoordinator::new();
        let mut relay = Relay::start(&cfg, Arc::new(service.clone()), &shutdown).unwrap();
        shutdown.request();

        let mut input = framer(&cfg, vec![0u8; 8]);
        let report = relay.run(&mut input, &shutdown);
        assert_eq!(report.reason, StopReason::Interrupted);
        assert_eq!(report.blocks, 0);
    }

    #[test]
    fn later_lane_failure_releases_earlier_lanes() {
        let cfg = RelayConfig {
            multiple_sources: true,
            ..config()
        };
        let service = MockSinkService::new();
        service.rename("Proxy.c1", "Proxy.c1_2");
        let shutdown = ShutdownCoordinator::new();
        let err = Relay::start(&cfg, Arc::new(service.clone()), &shutdown)
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::NameMismatch { .. }));
        assert_eq!(
            service.events_for("Proxy.c0").last(),
            Some(&SinkEvent::Closed { name: "Proxy.c0".into() })
        );
    }

    #[test]
    fn rotating_config_gets_connection_defaults() {
        // not normalized: one retained connection would mean detach only
        let cfg = RelayConfig {
            cutoff_secs: 10.0,
            archive_frames: 100,
            utc_offset_secs: Some(0),
            ..config()
        };
        assert_eq!(cfg.retained_connections, 1);
        let service = MockSinkService::new();
        let shutdown = ShutdownCoordinator::new();
        let mut relay = Relay::start(&cfg, Arc::new(service.clone()), &shutdown).unwrap();

        let mut input = framer(&cfg, vec![0u8; 25 * 4]);
        let report = relay.run(&mut input, &shutdown);

        assert_eq!(report.rotations, 2);
        assert_eq!(service.opened_names(), ["Proxy-0", "Proxy-1", "Proxy-2", "Proxy-3"]);
        assert!(service
            .events_for("Proxy-0")
            .contains(&SinkEvent::ClearCache { name: "Proxy-0".into() }));
    }

    #[test]
    fn invalid_config_fails_before_connecting() {
        let cfg = RelayConfig {
            cutoff_secs: 7.0,
            ..config()
        };
        let service = MockSinkService::new();
        let err = Relay::start(&cfg, Arc::new(service.clone()), &ShutdownCoordinator::new())
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Config(_)));
        assert!(service.events().is_empty());
    }
}
