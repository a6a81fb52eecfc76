use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use kirogate_auth::{FingerprintManager, RefreshClient};
use kirogate_common::BootConfig;
use kirogate_core::{
    Accounting, AppContext, GlobalRateLimiter, SettingsManager, UpstreamExecutor,
};
use kirogate_pool::{
    ApiKeyManager, BackgroundRefresher, GroupManager, InflightMirror, TokenPoolManager,
};
use kirogate_storage::{connect_sqlite, migrate_legacy_json, LogStore, TokenStore};
use kirogate_translate::IdentityManager;

#[tokio::main]
async fn main() -> Result<()> {
    let boot = BootConfig::from_env().context("read environment configuration")?;

    let default_filter = if boot.debug_mode { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let token_db = connect_sqlite(&boot.db_path, false)
        .await
        .context("open credential database")?;
    let log_db = connect_sqlite(&boot.log_db_path, true)
        .await
        .context("open request-log database")?;
    let store = TokenStore::new(token_db);
    let logs = LogStore::new(log_db);

    // Converge invariant state left over from a previous run before
    // anything projects it into memory.
    match store.fix_orphaned_exhausted().await {
        Ok(0) => {}
        Ok(fixed) => tracing::info!(fixed, "repaired orphaned exhausted credentials at boot"),
        Err(err) => tracing::warn!(error = %err, "orphan repair at boot failed"),
    }

    // One-time migration of the legacy JSON config, if present.
    let legacy_path = boot.legacy_config_path();
    if let Err(err) = migrate_legacy_json(&store, &legacy_path).await {
        tracing::warn!(error = %err, "legacy config migration failed");
    }

    let settings = SettingsManager::new(store.clone());
    if let Err(err) = settings.load().await {
        tracing::warn!(error = %err, "settings load failed, using defaults");
    }
    let current = settings.get();

    let groups = Arc::new(
        GroupManager::load(store.clone())
            .await
            .context("load groups")?,
    );
    let api_keys = Arc::new(
        ApiKeyManager::load(store.clone())
            .await
            .context("load api keys")?,
    );

    let mirror = match &boot.redis_url {
        Some(url) => InflightMirror::connect(url).await,
        None => None,
    };

    let pool = TokenPoolManager::new(
        store.clone(),
        RefreshClient::new(),
        groups.clone(),
        settings.handle(),
        mirror,
    );
    pool.reload().await.context("build token pools")?;

    // Seed runtime counters from the accounting log, then warm the token
    // cache in the background so boot does not wait on upstream auth.
    match logs.token_counters().await {
        Ok(counters) => pool.restore_metrics(&counters).await,
        Err(err) => tracing::warn!(error = %err, "metrics restore failed"),
    }
    {
        let pool = pool.clone();
        tokio::spawn(async move {
            match pool.warm_up().await {
                Ok(warmed) => tracing::info!(warmed, "token cache warm-up complete"),
                Err(err) => tracing::warn!(error = %err, "token cache warm-up failed"),
            }
        });
    }

    let refresher = BackgroundRefresher::new(pool.clone(), store.clone());
    refresher.start();

    let fingerprints = Arc::new(FingerprintManager::new());
    let executor = UpstreamExecutor::new(settings.handle(), fingerprints.clone());
    let limiter = GlobalRateLimiter::new(current.rate_limit_qps, current.rate_limit_burst);
    let accounting = Accounting::new(logs.clone());

    let port = boot.port;
    let ctx = Arc::new(AppContext {
        boot,
        settings,
        store,
        logs,
        pool,
        groups,
        api_keys,
        identity: IdentityManager::new(),
        fingerprints,
        executor,
        limiter,
        accounting,
        refresher: refresher.clone(),
        started_at: Instant::now(),
    });

    let app = kirogate_router::app_router(ctx.clone());
    let bind: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "kirogate listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await
    .context("serve")?;

    refresher.stop();
    Ok(())
}
