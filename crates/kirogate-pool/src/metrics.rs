use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Per-credential runtime counters. Everything is atomic so the selection
/// hot path never takes a lock to read in-flight counts.
#[derive(Debug, Default)]
pub struct TokenMetrics {
    request_count: AtomicI64,
    failure_count: AtomicI64,
    total_latency_ns: AtomicI64,
    last_request_ns: AtomicI64,
    in_flight: AtomicI64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub request_count: i64,
    pub failure_count: i64,
    pub in_flight: i64,
    pub avg_latency_ms: f64,
}

impl TokenMetrics {
    pub fn record_request(&self, latency: Duration, success: bool) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ns
            .fetch_add(latency.as_nanos() as i64, Ordering::Relaxed);
        self.last_request_ns.store(
            time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64,
            Ordering::Relaxed,
        );
        if !success {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn increment_in_flight(&self) -> i64 {
        self.in_flight.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrement_in_flight(&self) -> i64 {
        self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> i64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> i64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.request_count();
        if count == 0 {
            return 0.0;
        }
        self.total_latency_ns.load(Ordering::Relaxed) as f64 / count as f64 / 1e6
    }

    pub fn failure_rate(&self) -> f64 {
        let count = self.request_count();
        if count == 0 {
            return 0.0;
        }
        self.failure_count() as f64 / count as f64
    }

    /// Seed counters from persisted accounting data at boot.
    pub fn restore(&self, requests: i64, failures: i64, total_latency_ms: i64) {
        self.request_count.store(requests, Ordering::Relaxed);
        self.failure_count.store(failures, Ordering::Relaxed);
        self.total_latency_ns
            .store(total_latency_ms.saturating_mul(1_000_000), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            request_count: self.request_count(),
            failure_count: self.failure_count(),
            in_flight: self.in_flight(),
            avg_latency_ms: self.avg_latency_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_balances(){
        let m = TokenMetrics::default();
        assert_eq!(m.increment_in_flight(), 1);
        assert_eq!(m.increment_in_flight(), 2);
        assert_eq!(m.decrement_in_flight(), 1);
        assert_eq!(m.decrement_in_flight(), 0);
        assert_eq!(m.in_flight(), 0);
    }

    #[test]
    fn latency_and_failure_accounting() {
        let m = TokenMetrics::default();
        m.record_request(Duration::from_millis(10), true);
        m.record_request(Duration::from_millis(30), false);
        assert_eq!(m.request_count(), 2);
        assert_eq!(m.failure_count(), 1);
        assert!((m.avg_latency_ms() - 20.0).abs() < 0.01);
        assert!((m.failure_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn restore_seeds_counters() {
        let m = TokenMetrics::default();
        m.restore(100, 7, 5_000);
        assert_eq!(m.request_count(), 100);
        assert_eq!(m.failure_count(), 7);
        assert!((m.avg_latency_ms() - 50.0).abs() < 0.01);
    }
}
