use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use kirogate_auth::{
    is_banned_error, is_suspended_error, usage_snapshot, AuthKind, RefreshClient, RefreshError,
};
use kirogate_common::Settings;
use kirogate_storage::{
    StoreError, TokenCounters, TokenRecord, TokenStatus, TokenStore, TokenUpdate,
};

use crate::cache::{CachedToken, TokenCache, TokenInfo, TokenWithUsage};
use crate::group::{GroupManager, DEFAULT_GROUP};
use crate::metrics::{MetricsSnapshot, TokenMetrics};
use crate::mirror::InflightMirror;

/// Access tokens older than this trigger an asynchronous cache refresh on
/// the next selection; selection itself never blocks on it.
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(300);
const SELECT_ROUNDS: usize = 5;
const ROUND_PAUSE: Duration = Duration::from_millis(50);
const DEFAULT_MAX_CONCURRENT: i64 = 5;
const WARMUP_CONCURRENCY: usize = 20;
const WARMUP_PACING: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no token in group {0}")]
    NoTokenInGroup(String),
    #[error("no available token in group {0}")]
    NoAvailableToken(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

/// Pool-side projection of a credential row, keyed by credential id; only
/// what selection reads is carried.
#[derive(Debug, Clone)]
pub struct PooledToken {
    pub id: i64,
    pub refresh_token: String,
    pub disabled: bool,
    pub status: TokenStatus,
    /// 0 = use the pool default.
    pub max_concurrent: i64,
}

impl From<&TokenRecord> for PooledToken {
    fn from(record: &TokenRecord) -> Self {
        Self {
            id: record.id,
            refresh_token: record.refresh_token.clone(),
            disabled: record.disabled,
            status: TokenStatus::from_column(&record.status),
            max_concurrent: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct GroupPoolSettings {
    cooldown_sec: i64,
}

struct GroupPool {
    name: String,
    tokens: Vec<PooledToken>,
    metrics: Mutex<HashMap<i64, Arc<TokenMetrics>>>,
    cooldown: Mutex<HashMap<i64, Instant>>,
    settings: GroupPoolSettings,
    round_robin: AtomicU64,
}

impl GroupPool {
    fn metrics_for(&self, id: i64) -> Arc<TokenMetrics> {
        let mut metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        metrics.entry(id).or_default().clone()
    }

    fn existing_metrics(&self, id: i64) -> Option<Arc<TokenMetrics>> {
        let metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        metrics.get(&id).cloned()
    }

    fn cooling_until(&self, id: i64) -> Option<Instant> {
        let cooldown = self.cooldown.lock().unwrap_or_else(|p| p.into_inner());
        cooldown.get(&id).copied()
    }

    fn set_cooldown(&self, id: i64, until: Instant) {
        let mut cooldown = self.cooldown.lock().unwrap_or_else(|p| p.into_inner());
        cooldown.insert(id, until);
    }

    fn cooldown_count(&self) -> usize {
        let now = Instant::now();
        let cooldown = self.cooldown.lock().unwrap_or_else(|p| p.into_inner());
        cooldown.values().filter(|until| **until > now).count()
    }

    fn contains(&self, id: i64) -> bool {
        self.tokens.iter().any(|t| t.id == id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub group: String,
    pub token_count: usize,
    pub cooldown_count: usize,
}

/// Process-wide credential pool: group-sharded round-robin selection over
/// cached access tokens, with quarantine transitions persisted before any
/// in-memory rebuild (the database is authoritative).
pub struct TokenPoolManager {
    pools: RwLock<HashMap<String, Arc<GroupPool>>>,
    cache: TokenCache,
    last_refresh: Mutex<Option<Instant>>,
    refreshing: AtomicBool,
    settings: Arc<ArcSwap<Settings>>,
    store: TokenStore,
    refresher: RefreshClient,
    groups: Arc<GroupManager>,
    mirror: Option<InflightMirror>,
}

impl TokenPoolManager {
    pub fn new(
        store: TokenStore,
        refresher: RefreshClient,
        groups: Arc<GroupManager>,
        settings: Arc<ArcSwap<Settings>>,
        mirror: Option<InflightMirror>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            cache: TokenCache::new(),
            last_refresh: Mutex::new(None),
            refreshing: AtomicBool::new(false),
            settings,
            store,
            refresher,
            groups,
            mirror,
        })
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Stamp the cache as freshly refreshed, suppressing the TTL-triggered
    /// async refresh for the next window.
    pub fn mark_cache_fresh(&self) {
        *self.last_refresh.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Re-project pools from the store, preserving runtime metrics and
    /// cooldowns for credentials that survive the rebuild.
    pub async fn reload(&self) -> Result<(), PoolError> {
        let records = self.store.list_all(100_000, 0).await?;
        self.rebuild_pools(&records).await;
        Ok(())
    }

    async fn rebuild_pools(&self, records: &[TokenRecord]) {
        let mut grouped: HashMap<String, Vec<PooledToken>> = HashMap::new();
        for record in records {
            let group = if record.group_name.is_empty() {
                DEFAULT_GROUP.to_string()
            } else {
                record.group_name.clone()
            };
            grouped.entry(group).or_default().push(PooledToken::from(record));
        }

        let mut pools = self.pools.write().await;
        let mut next: HashMap<String, Arc<GroupPool>> = HashMap::new();
        for (name, tokens) in grouped {
            let settings = match self.groups.get(&name).await {
                Some(g) => GroupPoolSettings {
                    cooldown_sec: g.cooldown_sec,
                },
                None => GroupPoolSettings::default(),
            };
            let (metrics, cooldown) = match pools.get(&name) {
                Some(old) => (
                    old.metrics.lock().unwrap_or_else(|p| p.into_inner()).clone(),
                    old.cooldown.lock().unwrap_or_else(|p| p.into_inner()).clone(),
                ),
                None => (HashMap::new(), HashMap::new()),
            };
            next.insert(
                name.clone(),
                Arc::new(GroupPool {
                    name,
                    tokens,
                    metrics: Mutex::new(metrics),
                    cooldown: Mutex::new(cooldown),
                    settings,
                    round_robin: AtomicU64::new(0),
                }),
            );
        }
        *pools = next;
    }

    /// Replace the projection wholesale: clear cached access tokens and
    /// force the next selection to kick a refresh.
    pub async fn update_configs(&self) -> Result<(), PoolError> {
        self.cache.clear().await;
        *self.last_refresh.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.reload().await
    }

    // ----- selection -----

    pub async fn get_best(self: &Arc<Self>, group: &str) -> Result<TokenWithUsage, PoolError> {
        let group = if group.is_empty() { DEFAULT_GROUP } else { group };
        self.maybe_trigger_refresh();

        let pool = self
            .pools
            .read()
            .await
            .get(group)
            .cloned()
            .ok_or_else(|| PoolError::NoTokenInGroup(group.to_string()))?;
        if pool.tokens.is_empty() {
            return Err(PoolError::NoTokenInGroup(group.to_string()));
        }

        // Several short rounds instead of one pass: transient in-flight caps
        // and cooldowns often clear within a few tens of milliseconds.
        for round in 0..SELECT_ROUNDS {
            if let Some(selected) = self.probe_round(&pool).await {
                return Ok(selected);
            }
            if round + 1 < SELECT_ROUNDS {
                tokio::time::sleep(ROUND_PAUSE).await;
            }
        }
        Err(PoolError::NoAvailableToken(group.to_string()))
    }

    async fn probe_round(&self, pool: &GroupPool) -> Option<TokenWithUsage> {
        let token_count = pool.tokens.len();
        for _ in 0..token_count {
            let slot = pool.round_robin.fetch_add(1, Ordering::Relaxed) as usize % token_count;
            let candidate = &pool.tokens[slot];

            if candidate.disabled || candidate.status != TokenStatus::Active {
                continue;
            }
            let now = Instant::now();
            if matches!(pool.cooling_until(candidate.id), Some(until) if until > now) {
                continue;
            }
            let Some(cached) = self.cache.get(candidate.id).await else {
                continue;
            };
            if !cached.is_usable() || cached.available <= 0.0 {
                continue;
            }
            let max_concurrent = if candidate.max_concurrent > 0 {
                candidate.max_concurrent
            } else {
                DEFAULT_MAX_CONCURRENT
            };
            if pool.metrics_for(candidate.id).in_flight() >= max_concurrent {
                continue;
            }

            let remaining = self
                .cache
                .consume_one(candidate.id)
                .await
                .unwrap_or(cached.available - 1.0);

            let store = self.store.clone();
            let id = candidate.id;
            tokio::spawn(async move {
                if let Err(err) = store.mark_used(id).await {
                    tracing::debug!(token_id = id, error = %err, "mark_used failed");
                }
            });

            return Some(TokenWithUsage {
                token: TokenInfo {
                    id: candidate.id,
                    access_token: cached.access_token,
                    refresh_token: candidate.refresh_token.clone(),
                    expires_at: Some(cached.expires_at),
                },
                available: remaining,
                is_usage_exceeded: remaining <= 0.0,
            });
        }
        None
    }

    // ----- mutation paths -----

    async fn pool_for_token(&self, id: i64) -> Option<Arc<GroupPool>> {
        let pools = self.pools.read().await;
        pools.values().find(|p| p.contains(id)).cloned()
    }

    /// Put a credential on cooldown after a retryable failure.
    pub async fn mark_failed(&self, token: &TokenInfo) {
        let Some(pool) = self.pool_for_token(token.id).await else {
            return;
        };
        let settings = self.settings.load();
        let cooldown_sec = settings.effective_cooldown_sec(pool.settings.cooldown_sec.max(0) as u64);
        pool.set_cooldown(token.id, Instant::now() + Duration::from_secs(cooldown_sec));
        pool.metrics_for(token.id).record_request(Duration::ZERO, false);
        tracing::warn!(
            token_id = token.id,
            group = %pool.name,
            cooldown_sec,
            "credential placed on cooldown"
        );
    }

    pub async fn record_request(&self, token: &TokenInfo, latency: Duration, success: bool) {
        if let Some(pool) = self.pool_for_token(token.id).await {
            pool.metrics_for(token.id).record_request(latency, success);
        }
    }

    pub async fn start_request(&self, token: &TokenInfo) {
        if let Some(pool) = self.pool_for_token(token.id).await {
            pool.metrics_for(token.id).increment_in_flight();
        }
        if let Some(mirror) = &self.mirror {
            mirror.incr(token.id);
        }
    }

    pub async fn end_request(&self, token: &TokenInfo) {
        if let Some(pool) = self.pool_for_token(token.id).await {
            pool.metrics_for(token.id).decrement_in_flight();
        }
        if let Some(mirror) = &self.mirror {
            mirror.decr(token.id);
        }
    }

    // ----- refresh -----

    fn maybe_trigger_refresh(self: &Arc<Self>) {
        let stale = {
            let last = self.last_refresh.lock().unwrap_or_else(|p| p.into_inner());
            match *last {
                Some(at) => at.elapsed() > TOKEN_CACHE_TTL,
                None => true,
            }
        };
        if stale {
            self.trigger_async_refresh();
        }
    }

    /// Kick one background refresh pass; a CAS keeps at most one in flight.
    pub fn trigger_async_refresh(self: &Arc<Self>) {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.do_refresh().await {
                tracing::warn!(error = %err, "async cache refresh failed");
            }
            *manager
                .last_refresh
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
            manager.refreshing.store(false, Ordering::SeqCst);
        });
    }

    async fn do_refresh(&self) -> Result<(), PoolError> {
        let records = self.store.list_all(100_000, 0).await?;
        for record in &records {
            if record.disabled || TokenStatus::from_column(&record.status) == TokenStatus::Banned {
                continue;
            }
            if let Err(err) = self.refresh_credential(record).await {
                tracing::debug!(token_id = record.id, error = %err, "credential refresh failed");
            }
        }
        self.reload().await
    }

    /// One full verification pass for a credential: exchange the refresh
    /// token, pull the quota snapshot, persist the outcome (including any
    /// quarantine transition), and only then update the live cache.
    pub async fn refresh_credential(&self, record: &TokenRecord) -> Result<(), PoolError> {
        let now = OffsetDateTime::now_utc();
        let refreshed = match AuthKind::parse(&record.auth_type) {
            AuthKind::Social => self.refresher.refresh_social(&record.refresh_token).await,
            AuthKind::Idc => {
                self.refresher
                    .refresh_idc(
                        &record.refresh_token,
                        record.client_id.as_deref().unwrap_or(""),
                        record.client_secret.as_deref().unwrap_or(""),
                    )
                    .await
            }
        };

        let refreshed = match refreshed {
            Err(err) => {
                let message = err.to_string();
                let mut update = TokenUpdate {
                    error_msg: Some(Some(message.clone())),
                    last_verified_at: Some(now),
                    ..Default::default()
                };
                if is_banned_error(&message) || is_suspended_error(&message) {
                    update.status = Some(TokenStatus::Banned);
                    update.group_name = Some("banned".to_string());
                    tracing::warn!(token_id = record.id, "credential banned by upstream");
                }
                // The cache entry (if any) is left alone: a stale-but-live
                // access token still beats none while the error is transient.
                self.store.update_fields(record.id, update).await?;
                return Err(err.into());
            }
            Ok(refreshed) => refreshed,
        };

        let mut update = TokenUpdate {
            access_token: Some(refreshed.access_token.clone()),
            access_token_expires_at: Some(refreshed.expires_at),
            last_verified_at: Some(now),
            error_msg: Some(None),
            ..Default::default()
        };
        let mut available = 0.0;
        let mut usage_limits = None;

        match self.refresher.usage_limits(&refreshed.access_token).await {
            Ok(limits) => {
                let snap = usage_snapshot(&limits);
                available = snap.available;
                update.available_usage = Some(snap.available);
                update.base_usage = Some(snap.base);
                update.free_trial_usage = Some(snap.free_trial);
                update.total_limit = Some(snap.total_limit);
                update.current_usage = Some(snap.current);
                if let Some(email) = snap.user_email {
                    update.user_email = Some(email);
                }

                let status = TokenStatus::from_column(&record.status);
                if snap.available <= 0.0 {
                    update.status = Some(TokenStatus::Exhausted);
                    update.group_name = Some("exhausted".to_string());
                } else if status != TokenStatus::Active {
                    update.status = Some(TokenStatus::Active);
                    if record.group_name == "exhausted" || record.group_name == "banned" {
                        update.group_name = Some(DEFAULT_GROUP.to_string());
                    }
                }
                usage_limits = Some(limits);
            }
            Err(err) => {
                let message = err.to_string();
                if is_suspended_error(&message) {
                    update.status = Some(TokenStatus::Banned);
                    update.group_name = Some("banned".to_string());
                    tracing::warn!(token_id = record.id, "credential suspended by upstream");
                }
            }
        }

        self.store.update_fields(record.id, update).await?;
        self.cache
            .set(
                record.id,
                CachedToken {
                    access_token: refreshed.access_token,
                    expires_at: refreshed.expires_at,
                    usage: usage_limits,
                    available,
                    cached_at: now,
                    last_used: None,
                },
            )
            .await;
        Ok(())
    }

    /// Startup warm-up: refresh every eligible credential with bounded
    /// concurrency so the first client request finds live tokens. Failures
    /// leave the cache entry unpopulated; selection skips those.
    pub async fn warm_up(self: &Arc<Self>) -> Result<usize, PoolError> {
        let records = self.store.list_all(100_000, 0).await?;
        let semaphore = Arc::new(tokio::sync::Semaphore::new(WARMUP_CONCURRENCY));
        let mut handles = Vec::new();

        for record in records {
            if record.disabled || TokenStatus::from_column(&record.status) != TokenStatus::Active {
                continue;
            }
            let manager = self.clone();
            let permit = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok()?;
                manager.refresh_credential(&record).await.ok()
            }));
            tokio::time::sleep(WARMUP_PACING).await;
        }

        let mut warmed = 0;
        for handle in handles {
            if matches!(handle.await, Ok(Some(()))) {
                warmed += 1;
            }
        }
        *self.last_refresh.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
        self.reload().await?;
        Ok(warmed)
    }

    // ----- introspection -----

    pub async fn pool_stats(&self) -> Vec<PoolStats> {
        let pools = self.pools.read().await;
        let mut stats: Vec<PoolStats> = pools
            .values()
            .map(|p| PoolStats {
                group: p.name.clone(),
                token_count: p.tokens.len(),
                cooldown_count: p.cooldown_count(),
            })
            .collect();
        stats.sort_by(|a, b| a.group.cmp(&b.group));
        stats
    }

    pub async fn all_metrics(&self) -> HashMap<i64, MetricsSnapshot> {
        let pools = self.pools.read().await;
        let mut out = HashMap::new();
        for pool in pools.values() {
            let metrics = pool.metrics.lock().unwrap_or_else(|p| p.into_inner());
            for (id, m) in metrics.iter() {
                out.insert(*id, m.snapshot());
            }
        }
        out
    }

    pub async fn metrics_for_token(&self, id: i64) -> MetricsSnapshot {
        match self.pool_for_token(id).await {
            Some(pool) => pool
                .existing_metrics(id)
                .map(|m| m.snapshot())
                .unwrap_or_default(),
            None => MetricsSnapshot::default(),
        }
    }

    pub async fn global_in_flight(&self) -> (i64, usize) {
        let pools = self.pools.read().await;
        let mut total = 0;
        let mut active_tokens = 0;
        for pool in pools.values() {
            let metrics = pool.metrics.lock().unwrap_or_else(|p| p.into_inner());
            for m in metrics.values() {
                let count = m.in_flight();
                total += count;
                if count > 0 {
                    active_tokens += 1;
                }
            }
        }
        (total, active_tokens)
    }

    /// Seed runtime counters from persisted accounting data.
    pub async fn restore_metrics(&self, counters: &[TokenCounters]) {
        let pools = self.pools.read().await;
        for counter in counters {
            for pool in pools.values() {
                if pool.contains(counter.token_id) {
                    pool.metrics_for(counter.token_id).restore(
                        counter.request_count,
                        counter.failure_count,
                        counter.total_latency_ms,
                    );
                    break;
                }
            }
        }
    }
}
