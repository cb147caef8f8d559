// src/relay/lane.rs
//
// One outbound source: a connection pool, its rotation state and, in
// multi-thread mode, the worker that replaces standby connections.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{RelayConfig, SampleType, WordOrder};
use crate::core::error::{RelayError, RelayResult};
use crate::core::lock::lock_mutex;
use crate::core::logging::{ComponentLogger, LogContext};
use crate::io::stream_in::Block;
use crate::sink::{ChannelSet, HandleState, Record, SampleBatch, SinkService};

use super::pool::{ConnectionPool, PoolSettings};
use super::scheduler::RotationScheduler;
use super::swap::SwapWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub index: u64,
    pub start_stream_ns: u64,
    pub start_input_ns: u64,
}

pub struct Lane {
    name: String,
    channel_indices: Vec<usize>,
    sample_type: SampleType,
    word_order: WordOrder,
    block_ns: u64,
    pool: Arc<Mutex<ConnectionPool>>,
    scheduler: Option<RotationScheduler>,
    window: Option<Window>,
    last_block: Option<(u64, u64)>,
    swapper: Option<SwapWorker>,
    rotations: u64,
}

impl ComponentLogger for Lane {
    fn log_context(&self) -> LogContext {
        LogContext::new("Lane", &self.name)
    }
}

impl Lane {
    /// Opens the lane's connections. `channel_indices` select the stream
    /// channels this lane carries; `channels` are their registered names.
    pub fn open(
        cfg: &RelayConfig,
        name: &str,
        channel_indices: Vec<usize>,
        channels: ChannelSet,
        service: Arc<dyn SinkService>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, RelayError> {
        let settings = PoolSettings::from_config(cfg, name, channels);
        let block_ns = cfg.block_duration_ns();

        let (pool, scheduler) = if cfg.rotation_enabled() {
            let pool = ConnectionPool::open_rotating(service, settings, cancel.clone())?;
            let scheduler = RotationScheduler::new(cfg.cutoff_ns(), block_ns, cfg.utc_offset());
            (pool, Some(scheduler))
        } else {
            (ConnectionPool::open_primary(service, settings, cancel.clone())?, None)
        };
        let pool = Arc::new(Mutex::new(pool));

        let swapper = if scheduler.is_some() && !cfg.single_thread {
            let wake = Duration::from_millis(cfg.swap_wake_interval_ms);
            match SwapWorker::spawn(name, pool.clone(), cancel, wake) {
                Ok(worker) => Some(worker),
                Err(e) => {
                    log::error!("[relay] could not start swap worker for {}: {}", name, e);
                    lock_mutex(&pool, "relay.lane.open").release(true);
                    return Err(RelayError::SwapWorkerGone {
                        lane: name.to_string(),
                    });
                }
            }
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            channel_indices,
            sample_type: cfg.sample_type,
            word_order: cfg.word_order,
            block_ns,
            pool,
            scheduler,
            window: None,
            last_block: None,
            swapper,
            rotations: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    pub fn window(&self) -> Option<Window> {
        self.window
    }

    /// Whether `block` will start a new window when written.
    pub fn rotation_due(&self, block: &Block) -> bool {
        self.window.is_some()
            && self
                .scheduler
                .as_ref()
                .is_some_and(|s| s.should_rotate(block.end_input_ns()))
    }

    pub fn pool_states(&self) -> Vec<(String, HandleState)> {
        lock_mutex(&self.pool, "relay.lane.pool_states").states()
    }

    /// Writes one block, rotating first when it belongs to the next window.
    /// Returns whether a rotation happened.
    pub fn put_block(&mut self, block: &Block) -> RelayResult<bool> {
        let rotate = match (self.scheduler.as_mut(), self.window) {
            (Some(scheduler), None) => {
                scheduler.arm(block.input_ns);
                log::debug!(
                    "[relay] {} first window ends at {}",
                    self.name,
                    scheduler.describe_cutoff()
                );
                self.window = Some(Window {
                    index: 0,
                    start_stream_ns: block.stream_ns,
                    start_input_ns: block.input_ns,
                });
                false
            }
            (Some(scheduler), Some(_)) => scheduler.should_rotate(block.end_input_ns()),
            (None, _) => false,
        };
        if rotate {
            self.rotate(block)?;
        }

        let channels = self
            .channel_indices
            .iter()
            .filter_map(|&idx| block.channels.get(idx).map(Vec::as_slice))
            .collect();
        let record = Record::Samples(SampleBatch {
            start_ns: block.stream_ns,
            duration_ns: block.duration_ns,
            sample_type: self.sample_type,
            word_order: self.word_order,
            channels,
        });
        lock_mutex(&self.pool, "relay.lane.put_block").write(&record, false)?;

        self.last_block = Some((block.stream_ns, block.input_ns));
        Ok(rotate)
    }

    fn rotate(&mut self, block: &Block) -> RelayResult<()> {
        let Some(window) = self.window else {
            return Ok(());
        };

        // Close the old window on its own connection before anything moves.
        self.write_markers(
            (window.start_stream_ns, window.start_input_ns),
            (block.stream_ns, block.input_ns),
        )?;

        lock_mutex(&self.pool, "relay.lane.flip").flip()?;

        // From here the active connection holds the new window, even if
        // the standby replacement below fails or is cancelled.
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.arm(block.input_ns);
        }
        self.window = Some(Window {
            index: window.index + 1,
            start_stream_ns: block.stream_ns,
            start_input_ns: block.input_ns,
        });

        let report = match self.swapper.as_ref() {
            Some(worker) => worker.request_and_wait()?,
            None => lock_mutex(&self.pool, "relay.lane.swap").replace_standby()?,
        };
        self.rotations += 1;

        let next = self
            .scheduler
            .as_ref()
            .map(RotationScheduler::describe_cutoff)
            .unwrap_or_default();
        self.info(&format!(
            "window {} started, retired {} opened {} (next cutoff {})",
            window.index + 1,
            report.retired,
            report.opened,
            next
        ));
        Ok(())
    }

    /// Boundary marker pair: the window's start, then its end.
    fn write_markers(&self, start: (u64, u64), end: (u64, u64)) -> Result<(), RelayError> {
        let mut pool = lock_mutex(&self.pool, "relay.lane.markers");
        pool.write(
            &Record::Marker {
                time_ns: start.0,
                value_ns: start.1,
            },
            false,
        )?;
        pool.write(
            &Record::Marker {
                time_ns: end.0,
                value_ns: end.1,
            },
            true,
        )
    }

    /// Closes the current window one block duration after the last block.
    /// A window that never received a block closes where it started.
    pub fn finish(&mut self) -> RelayResult<()> {
        let (Some(window), Some((stream_ns, input_ns))) = (self.window, self.last_block) else {
            return Ok(());
        };
        if self.scheduler.is_none() {
            return Ok(());
        }
        let end = (
            stream_ns
                .saturating_add(self.block_ns)
                .max(window.start_stream_ns),
            input_ns.saturating_add(self.block_ns).max(window.start_input_ns),
        );
        self.write_markers((window.start_stream_ns, window.start_input_ns), end)
    }

    pub fn release(&mut self, abort: bool) {
        if let Some(mut worker) = self.swapper.take() {
            worker.stop();
        }
        lock_mutex(&self.pool, "relay.lane.release").release(abort);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::timestamp::NANOS_PER_SEC;
    use crate::testing::mocks::MockSinkService;

    fn block(seq: u64, stream_ns: u64) -> Block {
        Block {
            seq,
            stream_ns,
            input_ns: stream_ns,
            duration_ns: NANOS_PER_SEC,
            channels: vec![vec![seq as u8; 2], vec![0xAA; 2]],
        }
    }

    fn rotating_config(single_thread: bool) -> RelayConfig {
        RelayConfig {
            cutoff_secs: 10.0,
            block_points: 1,
            single_thread,
            utc_offset_secs: Some(0),
            ..RelayConfig::default()
        }
    }

    fn open_lane(cfg: &RelayConfig, service: &MockSinkService) -> Lane {
        Lane::open(
            cfg,
            "Proxy",
            vec![0, 1],
            ChannelSet::generated("c", 2),
            Arc::new(service.clone()),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn plain_lane_writes_without_markers() {
        let service = MockSinkService::new();
        let cfg = RelayConfig {
            block_points: 1,
            ..RelayConfig::default()
        };
        let mut lane = open_lane(&cfg, &service);
        for seq in 0..3 {
            assert!(!lane.put_block(&block(seq, seq * NANOS_PER_SEC)).unwrap());
        }
        lane.finish().unwrap();
        lane.release(false);

        assert_eq!(service.sample_times("Proxy").len(), 3);
        assert!(service.markers("Proxy").is_empty());
        assert_eq!(
            service.events_for("Proxy").last(),
            Some(&crate::testing::SinkEvent::Detached { name: "Proxy".into() })
        );
    }

    #[test]
    fn rotation_writes_marker_pair_before_new_window() {
        for single_thread in [true, false] {
            let service = MockSinkService::new();
            let mut lane = open_lane(&rotating_config(single_thread), &service);

            // windows of 10 s starting at t=0: blocks 0..=9 in window 0
            let base = 1_000 * 86_400 * NANOS_PER_SEC;
            let mut rotations = 0;
            for seq in 0..15 {
                if lane.put_block(&block(seq, base + seq * NANOS_PER_SEC)).unwrap() {
                    rotations += 1;
                }
            }
            lane.finish().unwrap();
            lane.release(false);

            assert_eq!(rotations, 1);
            assert_eq!(lane.rotations(), 1);

            let first: Vec<u64> = service.sample_times("Proxy-0");
            let second: Vec<u64> = service.sample_times("Proxy-1");
            assert_eq!(first.len(), 10);
            assert_eq!(second.len(), 5);
            assert_eq!(second[0] - first[9], NANOS_PER_SEC);

            let cutoff = base + 10 * NANOS_PER_SEC;
            assert_eq!(
                service.markers("Proxy-0"),
                vec![(base, base, false), (cutoff, cutoff, true)]
            );
            // closing markers of the last window at last block + one block
            assert_eq!(
                service.markers("Proxy-1"),
                vec![
                    (cutoff, cutoff, false),
                    (base + 15 * NANOS_PER_SEC, base + 15 * NANOS_PER_SEC, true)
                ]
            );

            // markers precede the first block of the next window
            let events = service.events();
            let last_marker = events
                .iter()
                .rposition(|e| matches!(e, crate::testing::SinkEvent::Marker { name, .. } if name == "Proxy-0"))
                .unwrap();
            let first_new = events
                .iter()
                .position(|e| matches!(e, crate::testing::SinkEvent::Samples { name, .. } if name == "Proxy-1"))
                .unwrap();
            assert!(last_marker < first_new);
            assert_eq!(service.opened_names(), ["Proxy-0", "Proxy-1", "Proxy-2"]);
        }
    }

    #[test]
    fn cancelled_swap_leaves_new_window_to_the_active_connection() {
        for single_thread in [true, false] {
            let service = MockSinkService::new();
            let cancel = Arc::new(AtomicBool::new(false));
            let mut lane = Lane::open(
                &rotating_config(single_thread),
                "Proxy",
                vec![0, 1],
                ChannelSet::generated("c", 2),
                Arc::new(service.clone()),
                cancel.clone(),
            )
            .unwrap();

            let base = 1_000 * 86_400 * NANOS_PER_SEC;
            let cutoff = base + 10 * NANOS_PER_SEC;
            for seq in 0..10 {
                lane.put_block(&block(seq, base + seq * NANOS_PER_SEC)).unwrap();
            }
            assert_eq!(lane.window().map(|w| w.index), Some(0));
            assert_eq!(
                lane.pool_states(),
                vec![
                    ("Proxy-0".to_string(), HandleState::Writable),
                    ("Proxy-1".to_string(), HandleState::Open),
                ]
            );

            cancel.store(true, std::sync::atomic::Ordering::SeqCst);
            assert!(lane.put_block(&block(10, cutoff)).is_err());
            assert_eq!(
                lane.window(),
                Some(Window {
                    index: 1,
                    start_stream_ns: cutoff,
                    start_input_ns: cutoff,
                })
            );
            assert_eq!(lane.rotations(), 0);

            lane.finish().unwrap();
            lane.release(false);

            // window 0 is closed exactly once, on its own connection
            assert_eq!(
                service.markers("Proxy-0"),
                vec![(base, base, false), (cutoff, cutoff, true)]
            );
            assert_eq!(
                service.markers("Proxy-1"),
                vec![(cutoff, cutoff, false), (cutoff, cutoff, true)]
            );
            assert!(service.sample_times("Proxy-1").is_empty());
        }
    }

    #[test]
    fn per_channel_lane_carries_only_its_channel() {
        let service = MockSinkService::new();
        let cfg = RelayConfig {
            block_points: 1,
            ..RelayConfig::default()
        };
        let mut lane = Lane::open(
            &cfg,
            "Proxy.c1",
            vec![1],
            ChannelSet::generated("c", 2).subset(&[1]),
            Arc::new(service.clone()),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        lane.put_block(&block(0, 0)).unwrap();

        let written = service.events_for("Proxy.c1");
        assert!(written.iter().any(|e| matches!(
            e,
            crate::testing::SinkEvent::Samples { channels, .. } if channels == &vec![vec![0xAA, 0xAA]]
        )));
        assert_eq!(service.registered("Proxy.c1"), Some(vec!["c1".to_string()]));
    }
}
