use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use kirogate_storage::TokenStore;

use crate::pool::TokenPoolManager;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const BATCH_SIZE: u64 = 50;
const BATCH_CONCURRENCY: usize = 10;
const SPAWN_PACING: Duration = Duration::from_millis(100);

/// Periodic verifier: every tick it refreshes the oldest-unverified batch,
/// repairs orphaned exhausted rows, and nudges the pool cache to converge.
pub struct BackgroundRefresher {
    pool: Arc<TokenPoolManager>,
    store: TokenStore,
    running: AtomicBool,
    stop: watch::Sender<bool>,
}

impl BackgroundRefresher {
    pub fn new(pool: Arc<TokenPoolManager>, store: TokenStore) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            pool,
            store,
            running: AtomicBool::new(false),
            stop,
        })
    }

    /// Idempotent: a second start is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let refresher = self.clone();
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so boot warm-up and
            // the loop do not double-refresh.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => refresher.refresh_batch().await,
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            tracing::info!("background refresher stopped");
                            return;
                        }
                    }
                }
            }
        });
        tracing::info!(
            interval_sec = REFRESH_INTERVAL.as_secs(),
            batch_size = BATCH_SIZE,
            "background refresher started"
        );
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.stop.send(true);
        }
    }

    pub async fn refresh_batch(&self) {
        let batch = match self.store.find_oldest_unverified(BATCH_SIZE).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(error = %err, "failed to load refresh batch");
                return;
            }
        };

        let mut refreshed = 0usize;
        let mut failed = 0usize;

        if !batch.is_empty() {
            let semaphore = Arc::new(tokio::sync::Semaphore::new(BATCH_CONCURRENCY));
            let mut handles = Vec::with_capacity(batch.len());
            for record in batch {
                let pool = self.pool.clone();
                let permit = semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let Ok(_permit) = permit.acquire_owned().await else {
                        return false;
                    };
                    match pool.refresh_credential(&record).await {
                        Ok(()) => true,
                        Err(err) => {
                            // Isolated failure: the row keeps its error_msg,
                            // the batch carries on.
                            tracing::debug!(token_id = record.id, error = %err, "batch refresh failed");
                            false
                        }
                    }
                }));
                tokio::time::sleep(SPAWN_PACING).await;
            }
            for handle in handles {
                match handle.await {
                    Ok(true) => refreshed += 1,
                    _ => failed += 1,
                }
            }
        }

        // Always runs, even on an empty batch: invariant repair is not
        // conditional on refresh traffic.
        match self.store.fix_orphaned_exhausted().await {
            Ok(0) => {}
            Ok(fixed) => tracing::info!(fixed, "repaired orphaned exhausted credentials"),
            Err(err) => tracing::error!(error = %err, "orphan repair failed"),
        }

        if refreshed > 0 {
            self.pool.trigger_async_refresh();
        }

        tracing::debug!(refreshed, failed, "background refresh batch complete");
    }

    /// Manual trigger from the admin surface.
    pub async fn refresh_now(&self, limit: u64) -> (usize, usize) {
        let batch = match self.store.find_oldest_unverified(limit).await {
            Ok(batch) => batch,
            Err(_) => return (0, 0),
        };
        let mut refreshed = 0;
        let mut failed = 0;
        for record in batch {
            match self.pool.refresh_credential(&record).await {
                Ok(()) => refreshed += 1,
                Err(_) => failed += 1,
            }
            tokio::time::sleep(SPAWN_PACING).await;
        }
        if refreshed > 0 {
            self.pool.trigger_async_refresh();
        }
        (refreshed, failed)
    }
}
