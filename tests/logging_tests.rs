use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_node::config::{RelayConfig, SampleType};
use relay_node::io::stream_in::{BlockFramer, FrameLayout};
use relay_node::relay::{Relay, ShutdownCoordinator};
use relay_node::testing::MockSinkService;
use relay_node::{ComponentLogger, LogContext};

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

#[test]
fn test_log_context_creation() {
    let ctx = LogContext::new("Pool", "Proxy");

    assert_eq!(ctx.component, "Pool");
    assert_eq!(ctx.instance_id, "Proxy");
    assert!(ctx.sequence > 0);
    assert!(ctx.timestamp_ns > 0);
    assert!(ctx.connection.is_none());
}

#[test]
fn test_log_formatting_with_connection() {
    let ctx = LogContext::new("Lane", "Proxy").with_connection("Proxy-3");
    let formatted = ctx.format("WARN", "open took 2.000 seconds");

    assert!(formatted.starts_with("[WARN]"));
    assert!(formatted.contains("[Lane:Proxy conn=Proxy-3]"));
    assert!(formatted.ends_with("open took 2.000 seconds"));
}

#[test]
fn test_component_logger_trait() {
    struct Station {
        id: String,
    }

    impl ComponentLogger for Station {
        fn log_context(&self) -> LogContext {
            LogContext::new("Station", &self.id)
        }
    }

    init_logging();
    let station = Station { id: "north".into() };
    let ctx = station.log_context();
    assert_eq!(ctx.component, "Station");
    assert_eq!(ctx.instance_id, "north");

    station.info("connected");
    let elapsed = station.warn_if_slow("flush", Instant::now(), Duration::from_secs(60));
    assert!(elapsed < Duration::from_secs(60));
}

#[test]
fn test_rotating_relay_logs_through_a_run() -> anyhow::Result<()> {
    init_logging();
    let mut cfg = RelayConfig {
        sample_type: SampleType::I8,
        block_points: 1,
        cutoff_secs: 5.0,
        utc_offset_secs: Some(0),
        ..RelayConfig::default()
    };
    cfg.normalize();
    cfg.validate()?;

    let service = MockSinkService::new();
    let shutdown = ShutdownCoordinator::new();
    let mut relay = Relay::start(&cfg, Arc::new(service.clone()), &shutdown)?;

    let layout = FrameLayout::from_config(&cfg, 1);
    let mut framer = BlockFramer::new(Cursor::new(vec![0u8; 12]), layout).starting_at(0);
    let report = relay.run(&mut framer, &shutdown);

    assert!(report.is_clean());
    assert_eq!(report.rotations, 2);
    Ok(())
}
