use std::io::Cursor;
use std::sync::Arc;

use relay_node::config::{RelayConfig, SampleType};
use relay_node::io::stream_in::{BlockFramer, FrameLayout};
use relay_node::relay::{Relay, ShutdownCoordinator, StopReason};
use relay_node::sink::ArchiveMode;
use relay_node::testing::{MockSinkService, SinkEvent};

const SEC: u64 = 1_000_000_000;
// a UTC midnight
const DAY_START_SECS: u64 = 20_000 * 86_400;
const BASE: u64 = DAY_START_SECS * SEC;

fn rotating_config() -> RelayConfig {
    let mut cfg = RelayConfig {
        sample_type: SampleType::I8,
        block_points: 1,
        channel_count: Some(1),
        cutoff_secs: 10.0,
        input_timestamps: true,
        utc_offset_secs: Some(0),
        ..RelayConfig::default()
    };
    cfg.normalize();
    cfg
}

/// One write unit per offset: big-endian f64 seconds plus one i8 sample per channel.
fn stamped_stream(offsets: &[u64], channels: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    for (i, offset) in offsets.iter().enumerate() {
        let secs = (DAY_START_SECS + offset) as f64;
        bytes.extend_from_slice(&secs.to_be_bytes());
        for c in 0..channels {
            bytes.push((i * channels + c) as u8);
        }
    }
    bytes
}

fn run_relay(cfg: &RelayConfig, input: Vec<u8>, service: &MockSinkService) -> relay_node::RelayReport {
    let shutdown = ShutdownCoordinator::new();
    let mut relay = Relay::start(cfg, Arc::new(service.clone()), &shutdown).unwrap();
    let layout = FrameLayout::from_config(cfg, cfg.channel_set().unwrap().len());
    let mut framer = BlockFramer::new(Cursor::new(input), layout);
    relay.run(&mut framer, &shutdown)
}

#[test]
fn windows_follow_ten_second_cutoffs() {
    let cfg = RelayConfig {
        retained_connections: 2,
        archive_frames: 100,
        ..rotating_config()
    };
    let service = MockSinkService::new();
    let offsets: Vec<u64> = (0..25).collect();
    let report = run_relay(&cfg, stamped_stream(&offsets, 1), &service);

    assert_eq!(report.reason, StopReason::EndOfStream);
    assert_eq!(report.blocks, 25);
    assert_eq!(report.rotations, 2);

    assert_eq!(service.sample_times("Proxy-0").len(), 10);
    assert_eq!(service.sample_times("Proxy-1").len(), 10);
    assert_eq!(service.sample_times("Proxy-2").len(), 5);
    assert!(service.sample_times("Proxy-3").is_empty());

    assert_eq!(
        service.markers("Proxy-0"),
        vec![(BASE, BASE, false), (BASE + 10 * SEC, BASE + 10 * SEC, true)]
    );
    assert_eq!(
        service.markers("Proxy-1"),
        vec![
            (BASE + 10 * SEC, BASE + 10 * SEC, false),
            (BASE + 20 * SEC, BASE + 20 * SEC, true)
        ]
    );
    // the last window closes one block after the last block
    assert_eq!(
        service.markers("Proxy-2"),
        vec![
            (BASE + 20 * SEC, BASE + 20 * SEC, false),
            (BASE + 25 * SEC, BASE + 25 * SEC, true)
        ]
    );

    // two retained: every swap evicts the one retired before
    assert_eq!(
        service.opened_names(),
        ["Proxy-0", "Proxy-1", "Proxy-0", "Proxy-2", "Proxy-1", "Proxy-3"]
    );
    assert!(service.events_for("Proxy-0").contains(&SinkEvent::Opened {
        name: "Proxy-0".into(),
        mode: ArchiveMode::Append
    }));
    assert!(service.events_for("Proxy-2").contains(&SinkEvent::Opened {
        name: "Proxy-2".into(),
        mode: ArchiveMode::Create
    }));

    // current window is archived, the standby just detached
    let last = service.events_for("Proxy-2");
    assert_eq!(
        &last[last.len() - 2..],
        &[
            SinkEvent::ClearCache { name: "Proxy-2".into() },
            SinkEvent::Detached { name: "Proxy-2".into() }
        ]
    );
    assert_eq!(
        service.events_for("Proxy-3").last(),
        Some(&SinkEvent::Detached { name: "Proxy-3".into() })
    );
}

#[test]
fn every_rotating_connection_registers_the_marker_channel() {
    let service = MockSinkService::new();
    let offsets: Vec<u64> = (0..12).collect();
    run_relay(&rotating_config(), stamped_stream(&offsets, 1), &service);

    for name in ["Proxy-0", "Proxy-1", "Proxy-2"] {
        assert_eq!(
            service.registered(name),
            Some(vec!["c0".to_string(), "time".to_string()]),
            "{}",
            name
        );
    }
}

#[test]
fn gap_in_input_rotates_once() {
    let service = MockSinkService::new();
    let offsets = [0, 1, 2, 3, 4, 35, 36, 37, 38, 39];
    let report = run_relay(&rotating_config(), stamped_stream(&offsets, 1), &service);

    assert_eq!(report.rotations, 1);
    assert_eq!(service.sample_times("Proxy-0").len(), 5);
    assert_eq!(service.sample_times("Proxy-1").len(), 5);

    // markers are stamped in stream time and carry the input time
    let stream_at_gap = BASE + 5 * SEC;
    assert_eq!(
        service.markers("Proxy-0"),
        vec![(BASE, BASE, false), (stream_at_gap, BASE + 35 * SEC, true)]
    );
}

#[test]
fn thread_modes_produce_the_same_calls() {
    let offsets: Vec<u64> = (0..33).collect();
    let input = stamped_stream(&offsets, 1);

    let threaded = MockSinkService::new();
    run_relay(&rotating_config(), input.clone(), &threaded);

    let inline = MockSinkService::new();
    let cfg = RelayConfig {
        single_thread: true,
        ..rotating_config()
    };
    run_relay(&cfg, input, &inline);

    assert_eq!(threaded.events(), inline.events());
    assert_eq!(threaded.opened_names().len(), 5);
}

#[test]
fn per_channel_sources_rotate_independently_named() {
    let cfg = RelayConfig {
        channel_count: None,
        channel_names: Some(vec!["temp".into(), "wind".into()]),
        multiple_sources: true,
        ..rotating_config()
    };
    let service = MockSinkService::new();
    let offsets: Vec<u64> = (0..15).collect();
    let report = run_relay(&cfg, stamped_stream(&offsets, 2), &service);

    assert_eq!(report.blocks, 15);
    assert_eq!(report.rotations, 2);
    for lane in ["Proxy.temp", "Proxy.wind"] {
        assert_eq!(service.sample_times(&format!("{}-0", lane)).len(), 10);
        assert_eq!(service.sample_times(&format!("{}-1", lane)).len(), 5);
    }
    assert_eq!(
        service.registered("Proxy.wind-0"),
        Some(vec!["wind".to_string(), "time".to_string()])
    );
}

#[test]
fn rotation_disabled_uses_the_base_name() {
    let cfg = RelayConfig {
        cutoff_secs: 0.0,
        ..rotating_config()
    };
    let service = MockSinkService::new();
    let offsets: Vec<u64> = (0..30).collect();
    let report = run_relay(&cfg, stamped_stream(&offsets, 1), &service);

    assert_eq!(report.rotations, 0);
    assert_eq!(service.opened_names(), ["Proxy"]);
    assert_eq!(service.sample_times("Proxy").len(), 30);
    assert!(service.markers("Proxy").is_empty());
    assert_eq!(service.registered("Proxy"), Some(vec!["c0".to_string()]));
}
