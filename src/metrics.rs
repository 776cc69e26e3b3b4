//! Runtime counters for the bridge.
//!
//! Counters are plain atomics shared through an `Arc`; they are observed by logging
//! and tests and never influence scheduling.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BridgeMetrics {
    open_attempts: AtomicU64,
    opens: AtomicU64,
    faults: AtomicU64,
    telemetry_forwarded: AtomicU64,
    downlink_written: AtomicU64,
    method_ok: AtomicU64,
    method_timeout: AtomicU64,
    method_rejected: AtomicU64,
    method_failed: AtomicU64,
}

/// Outcome of one method request, as counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodOutcome {
    Ok,
    Timeout,
    Rejected,
    Failed,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_open_attempt(&self) {
        self.open_attempts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_telemetry_forwarded(&self) {
        self.telemetry_forwarded.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_downlink_written(&self) {
        self.downlink_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_method(&self, outcome: MethodOutcome) {
        let counter = match outcome {
            MethodOutcome::Ok => &self.method_ok,
            MethodOutcome::Timeout => &self.method_timeout,
            MethodOutcome::Rejected => &self.method_rejected,
            MethodOutcome::Failed => &self.method_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            open_attempts: self.open_attempts.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            telemetry_forwarded: self.telemetry_forwarded.load(Ordering::Relaxed),
            downlink_written: self.downlink_written.load(Ordering::Relaxed),
            method_ok: self.method_ok.load(Ordering::Relaxed),
            method_timeout: self.method_timeout.load(Ordering::Relaxed),
            method_rejected: self.method_rejected.load(Ordering::Relaxed),
            method_failed: self.method_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub open_attempts: u64,
    pub opens: u64,
    pub faults: u64,
    pub telemetry_forwarded: u64,
    pub downlink_written: u64,
    pub method_ok: u64,
    pub method_timeout: u64,
    pub method_rejected: u64,
    pub method_failed: u64,
}

impl Snapshot {
    pub fn methods_total(&self) -> u64 {
        self.method_ok + self.method_timeout + self.method_rejected + self.method_failed
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "opens={}/{} faults={} telemetry={} downlink={} methods ok={} timeout={} rejected={} failed={}",
            self.opens,
            self.open_attempts,
            self.faults,
            self.telemetry_forwarded,
            self.downlink_written,
            self.method_ok,
            self.method_timeout,
            self.method_rejected,
            self.method_failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_outcomes_are_counted_separately() {
        let metrics = BridgeMetrics::new();
        metrics.record_method(MethodOutcome::Ok);
        metrics.record_method(MethodOutcome::Ok);
        metrics.record_method(MethodOutcome::Timeout);
        metrics.record_method(MethodOutcome::Failed);

        let snap = metrics.snapshot();
        assert_eq!(snap.method_ok, 2);
        assert_eq!(snap.method_timeout, 1);
        assert_eq!(snap.method_rejected, 0);
        assert_eq!(snap.method_failed, 1);
        assert_eq!(snap.methods_total(), 4);
    }
}
