use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Token bucket over integer milli-tokens (1000 = one token), refilled by
/// elapsed wall time.
#[derive(Debug)]
struct TokenBucket {
    tokens_milli: u64,
    last_update: Instant,
    qps: f64,
    burst_milli: u64,
}

impl TokenBucket {
    fn new(qps: f64, burst: u32) -> Self {
        Self {
            tokens_milli: burst as u64 * 1000,
            last_update: Instant::now(),
            qps,
            burst_milli: burst as u64 * 1000,
        }
    }

    fn reconfigure(&mut self, qps: f64, burst: u32) {
        if (self.qps - qps).abs() > f64::EPSILON || self.burst_milli != burst as u64 * 1000 {
            self.qps = qps;
            self.burst_milli = burst as u64 * 1000;
            self.tokens_milli = self.tokens_milli.min(self.burst_milli);
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_update).as_millis() as u64;
        self.last_update = now;
        let refill = (elapsed_ms as f64 * self.qps) as u64;
        self.tokens_milli = (self.tokens_milli + refill).min(self.burst_milli);
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens_milli >= 1000 {
            self.tokens_milli -= 1000;
            true
        } else {
            false
        }
    }

    /// Delay until one full token is available, for `Retry-After`.
    fn reservation_delay(&self) -> Duration {
        let needed_milli = 1000u64.saturating_sub(self.tokens_milli);
        if self.qps <= 0.0 {
            return Duration::from_secs(1);
        }
        Duration::from_millis((needed_milli as f64 / self.qps).ceil() as u64)
    }
}

/// Global request limiter gating POSTs on `/v1/...`. Supports hot
/// reconfiguration of qps/burst from the settings surface.
pub struct GlobalRateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl GlobalRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(qps, burst)),
        }
    }

    /// `Err(delay)` carries the suggested `Retry-After`.
    pub fn check(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        if bucket.qps <= 0.0 {
            return Ok(());
        }
        if bucket.try_consume() {
            Ok(())
        } else {
            Err(bucket.reservation_delay())
        }
    }

    pub fn reconfigure(&self, qps: f64, burst: u32) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        bucket.reconfigure(qps, burst);
    }

    pub fn stats(&self) -> (f64, u32, f64) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        bucket.refill();
        (
            bucket.qps,
            (bucket.burst_milli / 1000) as u32,
            bucket.tokens_milli as f64 / 1000.0,
        )
    }
}

/// Lazily-created per-credential buckets keyed by refresh token; the
/// configuration is re-applied on every acquisition so settings changes
/// take effect without a restart.
#[derive(Default)]
pub struct PerTokenLimiters {
    buckets: Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl PerTokenLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the credential's bucket admits one request. Zero or
    /// negative qps/burst disables the control entirely.
    pub async fn acquire(&self, key: &str, qps: f64, burst: u32) {
        if key.is_empty() || qps <= 0.0 || burst == 0 {
            return;
        }
        let bucket = {
            let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
            let bucket = buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(qps, burst))))
                .clone();
            bucket
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .reconfigure(qps, burst);
            bucket
        };

        loop {
            let delay = {
                let mut bucket = bucket.lock().unwrap_or_else(|p| p.into_inner());
                if bucket.try_consume() {
                    return;
                }
                bucket.reservation_delay()
            };
            tokio::time::sleep(delay).await;
        }
    }
}

/// Released on drop; `Unlimited` means the control was disabled.
pub enum SemaphoreGuard {
    Unlimited,
    Permit(OwnedSemaphorePermit),
}

struct SemaphoreEntry {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Keyed semaphores for per-token and per-group upstream concurrency caps.
/// A capacity change replaces the semaphore; outstanding permits drain
/// against the retired one.
#[derive(Default)]
pub struct SemaphoreRegistry {
    entries: Mutex<HashMap<String, SemaphoreEntry>>,
}

impl SemaphoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str, capacity: u32) -> SemaphoreGuard {
        if key.is_empty() || capacity == 0 {
            return SemaphoreGuard::Unlimited;
        }
        let semaphore = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            let entry = entries.entry(key.to_string()).or_insert_with(|| SemaphoreEntry {
                semaphore: Arc::new(Semaphore::new(capacity as usize)),
                capacity: capacity as usize,
            });
            if entry.capacity != capacity as usize {
                entry.semaphore = Arc::new(Semaphore::new(capacity as usize));
                entry.capacity = capacity as usize;
            }
            entry.semaphore.clone()
        };
        match semaphore.acquire_owned().await {
            Ok(permit) => SemaphoreGuard::Permit(permit),
            Err(_) => SemaphoreGuard::Unlimited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_empty() {
        let limiter = GlobalRateLimiter::new(1000.0, 3);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        // Bucket drained faster than 1ms refill can restore a full token.
        match limiter.check() {
            Err(delay) => assert!(delay <= Duration::from_secs(1)),
            Ok(()) => panic!("expected bucket exhaustion"),
        }
    }

    #[test]
    fn admitted_requests_respect_burst_bound() {
        // P10: with a tiny window, admissions are bounded by burst (+0 refill).
        let limiter = GlobalRateLimiter::new(0.001, 5);
        let mut admitted = 0;
        for _ in 0..50 {
            if limiter.check().is_ok() {
                admitted += 1;
            }
        }
        assert!(admitted <= 5);
    }

    #[test]
    fn zero_qps_disables_the_limiter() {
        let limiter = GlobalRateLimiter::new(0.0, 0);
        for _ in 0..100 {
            assert!(limiter.check().is_ok());
        }
    }

    #[test]
    fn reconfigure_changes_take_effect() {
        let limiter = GlobalRateLimiter::new(10.0, 1);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
        limiter.reconfigure(10.0, 100);
        // New burst allows a fresh batch once refilled; stats reflect config.
        let (qps, burst, _) = limiter.stats();
        assert_eq!(qps, 10.0);
        assert_eq!(burst, 100);
    }

    #[tokio::test]
    async fn semaphore_registry_caps_concurrency() {
        let registry = SemaphoreRegistry::new();
        let g1 = registry.acquire("token-a", 2).await;
        let g2 = registry.acquire("token-a", 2).await;
        assert!(matches!(g1, SemaphoreGuard::Permit(_)));
        assert!(matches!(g2, SemaphoreGuard::Permit(_)));

        // A third acquisition would block; verify via try-race with timeout.
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            registry.acquire("token-a", 2),
        )
        .await;
        assert!(blocked.is_err());

        drop(g1);
        let unblocked = tokio::time::timeout(
            Duration::from_millis(200),
            registry.acquire("token-a", 2),
        )
        .await;
        assert!(unblocked.is_ok());
    }

    #[tokio::test]
    async fn disabled_semaphore_is_unlimited() {
        let registry = SemaphoreRegistry::new();
        assert!(matches!(
            registry.acquire("k", 0).await,
            SemaphoreGuard::Unlimited
        ));
        assert!(matches!(
            registry.acquire("", 5).await,
            SemaphoreGuard::Unlimited
        ));
    }
}
