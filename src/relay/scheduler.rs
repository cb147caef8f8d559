use chrono::FixedOffset;

use crate::core::timestamp::{NANOS_PER_SEC, format_in_offset, ns_since_midnight};

/// Decides when a lane's current window ends. Windows are aligned to
/// local midnight in a fixed UTC offset, so with a 10 minute period
/// every window starts at hh:m0:00.
#[derive(Debug, Clone)]
pub struct RotationScheduler {
    period_ns: u64,
    block_ns: u64,
    offset: FixedOffset,
    next_cutoff: Option<u64>,
}

impl RotationScheduler {
    pub fn new(period_ns: u64, block_ns: u64, offset: FixedOffset) -> Self {
        Self {
            period_ns,
            block_ns,
            offset,
            next_cutoff: None,
        }
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    pub fn next_cutoff(&self) -> Option<u64> {
        self.next_cutoff
    }

    /// First period boundary strictly after `reference_ns`, computed from
    /// the reference truncated to whole seconds. The local midnight may lie
    /// before the epoch; the boundary itself never does. Saturates at
    /// `u64::MAX`, which no block reaches.
    pub fn compute_next_cutoff(&self, reference_ns: u64) -> u64 {
        let t = reference_ns - reference_ns % NANOS_PER_SEC;
        let elapsed = i128::from(ns_since_midnight(t, self.offset));
        let period = i128::from(self.period_ns);
        let midnight = i128::from(t) - elapsed;
        let cutoff = midnight + (elapsed - elapsed % period + period);
        u64::try_from(cutoff).unwrap_or(u64::MAX)
    }

    /// Arms the next cutoff for a window whose first block starts at
    /// `block_start_ns`.
    pub fn arm(&mut self, block_start_ns: u64) -> u64 {
        let cutoff = self.compute_next_cutoff(block_start_ns.saturating_add(self.block_ns));
        self.next_cutoff = Some(cutoff);
        cutoff
    }

    /// A block ending past the armed cutoff belongs to the next window.
    pub fn should_rotate(&self, block_end_ns: u64) -> bool {
        self.next_cutoff.is_some_and(|cutoff| block_end_ns > cutoff)
    }

    pub fn describe_cutoff(&self) -> String {
        match self.next_cutoff {
            Some(cutoff) => format_in_offset(cutoff, self.offset),
            None => "unarmed".to_string(),
        }
    }
}
