use std::sync::Arc;
use std::time::Instant;

use kirogate_pool::{PoolError, TokenInfo, TokenPoolManager, TokenWithUsage};

/// Per-request credential bookkeeping: every acquisition is matched by
/// exactly one `end`, whatever the error path, and `end` is idempotent.
pub struct RequestLifecycle {
    pool: Arc<TokenPoolManager>,
    group: String,
    token: Option<TokenWithUsage>,
    start: Instant,
    started: bool,
    ended: bool,
}

impl RequestLifecycle {
    pub fn new(pool: Arc<TokenPoolManager>, group: &str) -> Self {
        Self {
            pool,
            group: if group.is_empty() {
                "default".to_string()
            } else {
                group.to_string()
            },
            token: None,
            start: Instant::now(),
            started: false,
            ended: false,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn token(&self) -> Option<&TokenInfo> {
        self.token.as_ref().map(|t| &t.token)
    }

    /// Acquire a credential from the pool and open the in-flight window.
    pub async fn acquire(&mut self) -> Result<TokenWithUsage, PoolError> {
        let selected = self.pool.get_best(&self.group).await?;
        self.pool.start_request(&selected.token).await;
        if !self.started {
            self.started = true;
            self.start = Instant::now();
        } else if let Some(previous) = &self.token {
            // Failover replaced the credential: the old one's window closes
            // as the new one's opens, keeping per-credential balance.
            self.pool.end_request(&previous.token).await;
        }
        self.token = Some(selected.clone());
        Ok(selected)
    }

    /// Failover: cool the current credential down and acquire a fresh one
    /// scoped to the same group.
    pub async fn switch_token(&mut self) -> Result<TokenWithUsage, PoolError> {
        self.mark_failed().await;
        self.acquire().await
    }

    pub async fn mark_failed(&self) {
        if let Some(current) = &self.token {
            self.pool.mark_failed(&current.token).await;
        }
    }

    /// Close the in-flight window and record latency/outcome. Safe to call
    /// more than once; only the first call observes anything.
    pub async fn end(&mut self, success: bool) {
        if !self.started || self.ended {
            return;
        }
        self.ended = true;
        if let Some(current) = &self.token {
            let latency = self.start.elapsed();
            self.pool.end_request(&current.token).await;
            self.pool
                .record_request(&current.token, latency, success)
                .await;
        }
    }

    pub fn latency_ms(&self) -> i64 {
        if self.started {
            self.start.elapsed().as_millis() as i64
        } else {
            0
        }
    }
}
