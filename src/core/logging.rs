// src/core/logging.rs
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::timestamp::utc_ns_now;

// Globale Sequenznummer für Korrelation
static LOG_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct LogContext {
    pub component: String,
    pub instance_id: String,
    pub connection: Option<String>,
    pub sequence: u64,
    pub timestamp_ns: u64,
}

impl LogContext {
    pub fn new(component: &str, instance_id: &str) -> Self {
        Self {
            component: component.to_string(),
            instance_id: instance_id.to_string(),
            connection: None,
            sequence: LOG_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp_ns: utc_ns_now(),
        }
    }

    pub fn with_connection(mut self, connection: &str) -> Self {
        self.connection = Some(connection.to_string());
        self
    }

    pub fn format(&self, level: &str, message: &str) -> String {
        let connection_info = match &self.connection {
            Some(name) => format!(" conn={}", name),
            None => String::new(),
        };

        format!(
            "[{}][seq={:06}][{}:{}{}] {}",
            level, self.sequence, self.component, self.instance_id, connection_info, message
        )
    }
}

// Helper Trait für einheitliches Logging
pub trait ComponentLogger {
    fn log_context(&self) -> LogContext;

    fn debug(&self, message: &str) {
        let ctx = self.log_context();
        log::debug!("{}", ctx.format("DEBUG", message));
    }

    fn info(&self, message: &str) {
        let ctx = self.log_context();
        log::info!("{}", ctx.format("INFO", message));
    }

    fn warn(&self, message: &str) {
        let ctx = self.log_context();
        log::warn!("{}", ctx.format("WARN", message));
    }

    fn error(&self, message: &str) {
        let ctx = self.log_context();
        log::error!("{}", ctx.format("ERROR", message));
    }

    /// Warns when a remote or blocking operation ran longer than `limit`.
    fn warn_if_slow(&self, operation: &str, started: Instant, limit: Duration) -> Duration {
        let elapsed = started.elapsed();
        if elapsed > limit {
            self.warn(&format!(
                "{} took {:.3} seconds",
                operation,
                elapsed.as_secs_f64()
            ));
        }
        elapsed
    }
}
