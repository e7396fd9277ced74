//! Receiver clock and quality counters.
//!
//! Timestamps come from `CLOCK_MONOTONIC_RAW` on Linux (immune to NTP slew),
//! with an `Instant`-based fallback elsewhere. Staleness eviction is measured
//! against this clock, never wall time.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use crate::wire::ErrorKind;

/// Nanosecond timestamp via `CLOCK_MONOTONIC_RAW` (Linux) or `Instant` (other platforms).
#[inline(always)]
pub fn now_ns() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::time::Instant;
        static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

/// Convert a timeout in (fractional) seconds to nanoseconds. Negative and
/// non-finite values clamp to zero.
pub fn secs_to_ns(secs: f64) -> u64 {
    if !secs.is_finite() || secs <= 0.0 {
        return 0;
    }
    (secs * 1_000_000_000.0).round() as u64
}

/// Atomic per-listener counters.
/// All writes use Relaxed ordering; these are sampling metrics, not synchronisation.
pub struct ReceiverMetrics {
    // Ingestion
    pub datagrams_received: AtomicU64,
    pub bytes_received: AtomicU64,

    // Codec rejections
    pub rejected_truncated_header: AtomicU64,
    pub rejected_unsupported_type: AtomicU64,
    pub rejected_truncated_payload: AtomicU64,
    /// JSON-protocol datagrams that failed to parse.
    pub rejected_json: AtomicU64,

    // Reassembly
    pub chunks_accepted: AtomicU64,
    pub duplicate_chunks: AtomicU64,
    pub frames_completed: AtomicU64,
    pub frames_evicted: AtomicU64,
    /// Completed but older than the last delivered frame (monotonic gate).
    pub frames_dropped_stale: AtomicU64,

    // Delivery
    pub frames_delivered: AtomicU64,
    /// Delivered frames the sink could not accept (full or disconnected channel).
    pub frames_sink_dropped: AtomicU64,
    pub points_delivered: AtomicU64,
}

/// Plain-struct snapshot of [`ReceiverMetrics`] for display and JSONL logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverMetricsSnapshot {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub rejected_truncated_header: u64,
    pub rejected_unsupported_type: u64,
    pub rejected_truncated_payload: u64,
    pub rejected_json: u64,
    pub chunks_accepted: u64,
    pub duplicate_chunks: u64,
    pub frames_completed: u64,
    pub frames_evicted: u64,
    pub frames_dropped_stale: u64,
    pub frames_delivered: u64,
    pub frames_sink_dropped: u64,
    pub points_delivered: u64,
}

impl ReceiverMetricsSnapshot {
    pub fn rejected_total(&self) -> u64 {
        self.rejected_truncated_header
            + self.rejected_unsupported_type
            + self.rejected_truncated_payload
            + self.rejected_json
    }

    /// Fraction of completed frames that reached the sink, or None before any completed.
    pub fn delivery_pct(&self) -> Option<f64> {
        if self.frames_completed == 0 {
            return None;
        }
        Some(self.frames_delivered as f64 / self.frames_completed as f64 * 100.0)
    }
}

impl ReceiverMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            datagrams_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            rejected_truncated_header: AtomicU64::new(0),
            rejected_unsupported_type: AtomicU64::new(0),
            rejected_truncated_payload: AtomicU64::new(0),
            rejected_json: AtomicU64::new(0),
            chunks_accepted: AtomicU64::new(0),
            duplicate_chunks: AtomicU64::new(0),
            frames_completed: AtomicU64::new(0),
            frames_evicted: AtomicU64::new(0),
            frames_dropped_stale: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            frames_sink_dropped: AtomicU64::new(0),
            points_delivered: AtomicU64::new(0),
        })
    }

    pub fn record_datagram(&self, len: usize) {
        self.datagrams_received.fetch_add(1, Relaxed);
        self.bytes_received.fetch_add(len as u64, Relaxed);
    }

    pub fn record_rejection(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::TruncatedHeader => &self.rejected_truncated_header,
            ErrorKind::UnsupportedMessageType => &self.rejected_unsupported_type,
            ErrorKind::TruncatedPayload => &self.rejected_truncated_payload,
        };
        counter.fetch_add(1, Relaxed);
    }

    pub fn record_delivery(&self, points: usize, accepted: bool) {
        if accepted {
            self.frames_delivered.fetch_add(1, Relaxed);
            self.points_delivered.fetch_add(points as u64, Relaxed);
        } else {
            self.frames_sink_dropped.fetch_add(1, Relaxed);
        }
    }

    pub fn snapshot(&self) -> ReceiverMetricsSnapshot {
        ReceiverMetricsSnapshot {
            datagrams_received: self.datagrams_received.load(Relaxed),
            bytes_received: self.bytes_received.load(Relaxed),
            rejected_truncated_header: self.rejected_truncated_header.load(Relaxed),
            rejected_unsupported_type: self.rejected_unsupported_type.load(Relaxed),
            rejected_truncated_payload: self.rejected_truncated_payload.load(Relaxed),
            rejected_json: self.rejected_json.load(Relaxed),
            chunks_accepted: self.chunks_accepted.load(Relaxed),
            duplicate_chunks: self.duplicate_chunks.load(Relaxed),
            frames_completed: self.frames_completed.load(Relaxed),
            frames_evicted: self.frames_evicted.load(Relaxed),
            frames_dropped_stale: self.frames_dropped_stale.load(Relaxed),
            frames_delivered: self.frames_delivered.load(Relaxed),
            frames_sink_dropped: self.frames_sink_dropped.load(Relaxed),
            points_delivered: self.points_delivered.load(Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ns_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_secs_to_ns() {
        assert_eq!(secs_to_ns(0.3), 300_000_000);
        assert_eq!(secs_to_ns(2.0), 2_000_000_000);
        assert_eq!(secs_to_ns(-1.0), 0);
        assert_eq!(secs_to_ns(f64::NAN), 0);
    }

    #[test]
    fn test_rejection_counters() {
        let m = ReceiverMetrics::new();
        m.record_rejection(ErrorKind::TruncatedHeader);
        m.record_rejection(ErrorKind::TruncatedPayload);
        m.record_rejection(ErrorKind::TruncatedPayload);
        let s = m.snapshot();
        assert_eq!(s.rejected_truncated_header, 1);
        assert_eq!(s.rejected_unsupported_type, 0);
        assert_eq!(s.rejected_truncated_payload, 2);
        assert_eq!(s.rejected_total(), 3);
    }

    #[test]
    fn test_delivery_pct() {
        let m = ReceiverMetrics::new();
        assert!(m.snapshot().delivery_pct().is_none());
        m.frames_completed.store(4, Relaxed);
        m.record_delivery(100, true);
        m.record_delivery(100, true);
        m.record_delivery(100, true);
        m.record_delivery(100, false);
        let s = m.snapshot();
        assert_eq!(s.frames_delivered, 3);
        assert_eq!(s.frames_sink_dropped, 1);
        assert_eq!(s.points_delivered, 300);
        assert!((s.delivery_pct().unwrap() - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_snapshot() {
        let m = ReceiverMetrics::new();
        m.record_datagram(48);
        m.record_datagram(16);
        let s = m.snapshot();
        assert_eq!(s.datagrams_received, 2);
        assert_eq!(s.bytes_received, 64);
        assert_eq!(s.frames_delivered, 0);
    }
}
