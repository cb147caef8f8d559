use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
/// Latest instant accepted from the stream, the last nanosecond chrono can
/// represent (2262-04-11). Leaves headroom for block and period arithmetic.
pub const MAX_TIMESTAMP_NS: u64 = i64::MAX as u64;

pub fn utc_ns_now() -> u64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    d.as_secs() * NANOS_PER_SEC + d.subsec_nanos() as u64
}

pub fn format_utc_ns(utc_ns: u64) -> String {
    let seconds = utc_ns / NANOS_PER_SEC;
    let nanos = utc_ns % NANOS_PER_SEC;
    format!("{}.{:09}", seconds, nanos)
}

/// Human readable rendering in the given offset, for log lines.
pub fn format_in_offset(utc_ns: u64, offset: FixedOffset) -> String {
    let secs = (utc_ns / NANOS_PER_SEC) as i64;
    let nanos = (utc_ns % NANOS_PER_SEC) as u32;
    match DateTime::<Utc>::from_timestamp(secs, nanos) {
        Some(utc) => utc
            .with_timezone(&offset)
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        None => format_utc_ns(utc_ns),
    }
}

/// Nanoseconds elapsed since the most recent midnight in `offset`.
pub fn ns_since_midnight(utc_ns: u64, offset: FixedOffset) -> u64 {
    let day_ns = (SECONDS_PER_DAY * NANOS_PER_SEC) as i128;
    let local_ns = utc_ns as i128 + offset.local_minus_utc() as i128 * NANOS_PER_SEC as i128;
    local_ns.rem_euclid(day_ns) as u64
}

/// Converts floating point seconds (the wire representation of input
/// timestamps and configured durations) into nanoseconds.
pub fn secs_to_ns(seconds: f64) -> Option<u64> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let ns = (seconds * NANOS_PER_SEC as f64).round();
    if ns > u64::MAX as f64 {
        return None;
    }
    Some(ns as u64)
}

/// Converts a decoded block timestamp, rejecting instants past
/// `MAX_TIMESTAMP_NS`.
pub fn timestamp_to_ns(seconds: f64) -> Option<u64> {
    secs_to_ns(seconds).filter(|&ns| ns <= MAX_TIMESTAMP_NS)
}
