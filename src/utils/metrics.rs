//! Discovery Metrics
//!
//! Process-wide atomic counters for the codec and the unicast negotiation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Metrics {
    /// Datagrams produced by multicast encoders
    pub datagrams_encoded: AtomicU64,
    /// Bytes across all encoded datagrams
    pub bytes_encoded: AtomicU64,
    /// Datagrams successfully decoded
    pub datagrams_decoded: AtomicU64,
    /// Datagrams rejected while decoding
    pub decode_failures: AtomicU64,
    /// Unicast negotiations started by this process as client
    pub negotiations_total: AtomicU64,
    pub negotiations_success: AtomicU64,
    pub negotiations_failed: AtomicU64,
    /// Unicast requests answered as server
    pub unicast_served: AtomicU64,
    /// Unknown or unacceptable formats
    pub format_rejections: AtomicU64,
    /// Messages whose integrity tag did not verify
    pub integrity_failures: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            datagrams_encoded: AtomicU64::new(0),
            bytes_encoded: AtomicU64::new(0),
            datagrams_decoded: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            negotiations_total: AtomicU64::new(0),
            negotiations_success: AtomicU64::new(0),
            negotiations_failed: AtomicU64::new(0),
            unicast_served: AtomicU64::new(0),
            format_rejections: AtomicU64::new(0),
            integrity_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_encoded(&self, datagrams: u64, bytes: u64) {
        self.datagrams_encoded.fetch_add(datagrams, Ordering::Relaxed);
        self.bytes_encoded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_decoded(&self) {
        self.datagrams_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negotiation_started(&self) {
        self.negotiations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negotiation_succeeded(&self) {
        self.negotiations_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negotiation_failed(&self) {
        self.negotiations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unicast_served(&self) {
        self.unicast_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_format_rejection(&self) {
        self.format_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_encoded: self.datagrams_encoded.load(Ordering::Relaxed),
            bytes_encoded: self.bytes_encoded.load(Ordering::Relaxed),
            datagrams_decoded: self.datagrams_decoded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            negotiations_total: self.negotiations_total.load(Ordering::Relaxed),
            negotiations_success: self.negotiations_success.load(Ordering::Relaxed),
            negotiations_failed: self.negotiations_failed.load(Ordering::Relaxed),
            unicast_served: self.unicast_served.load(Ordering::Relaxed),
            format_rejections: self.format_rejections.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            datagrams_encoded = s.datagrams_encoded,
            bytes_encoded = s.bytes_encoded,
            datagrams_decoded = s.datagrams_decoded,
            decode_failures = s.decode_failures,
            negotiations_total = s.negotiations_total,
            negotiations_success = s.negotiations_success,
            negotiations_failed = s.negotiations_failed,
            unicast_served = s.unicast_served,
            format_rejections = s.format_rejections,
            integrity_failures = s.integrity_failures,
            uptime_seconds = s.uptime_seconds,
            "Discovery metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub datagrams_encoded: u64,
    pub bytes_encoded: u64,
    pub datagrams_decoded: u64,
    pub decode_failures: u64,
    pub negotiations_total: u64,
    pub negotiations_success: u64,
    pub negotiations_failed: u64,
    pub unicast_served: u64,
    pub format_rejections: u64,
    pub integrity_failures: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Logs how long the enclosing operation took when dropped
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_encoded(3, 900);
        metrics.record_encoded(1, 100);
        metrics.record_negotiation_started();
        metrics.record_negotiation_failed();
        let s = metrics.snapshot();
        assert_eq!(s.datagrams_encoded, 4);
        assert_eq!(s.bytes_encoded, 1000);
        assert_eq!(s.negotiations_total, 1);
        assert_eq!(s.negotiations_failed, 1);
        assert_eq!(s.negotiations_success, 0);
    }
}
