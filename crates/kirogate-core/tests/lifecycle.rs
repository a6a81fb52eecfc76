use std::sync::Arc;

use arc_swap::ArcSwap;
use time::OffsetDateTime;

use kirogate_auth::RefreshClient;
use kirogate_common::Settings;
use kirogate_core::RequestLifecycle;
use kirogate_pool::{CachedToken, GroupManager, TokenPoolManager};
use kirogate_storage::{connect_memory, NewToken, TokenStatus, TokenStore};

async fn manager_with_tokens(count: usize) -> Arc<TokenPoolManager> {
    let store = TokenStore::new(connect_memory(false).await.expect("schema"));
    for i in 0..count {
        store
            .create(NewToken {
                auth_type: "Social".to_string(),
                refresh_token: format!("rt-{i}"),
                client_id: None,
                client_secret: None,
                disabled: false,
                group_name: "default".to_string(),
                name: None,
                status: TokenStatus::Active,
            })
            .await
            .expect("seed");
    }
    let groups = Arc::new(GroupManager::load(store.clone()).await.expect("groups"));
    let settings = Arc::new(ArcSwap::from_pointee(Settings::default()));
    let manager =
        TokenPoolManager::new(store.clone(), RefreshClient::new(), groups, settings, None);
    manager.reload().await.expect("reload");
    manager.mark_cache_fresh();

    for record in store.list_all(100, 0).await.expect("list") {
        manager
            .cache()
            .set(
                record.id,
                CachedToken {
                    access_token: format!("at-{}", record.id),
                    expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
                    usage: None,
                    available: 100.0,
                    cached_at: OffsetDateTime::now_utc(),
                    last_used: None,
                },
            )
            .await;
    }
    manager
}

#[tokio::test]
async fn acquire_and_end_balance_in_flight() {
    let pool = manager_with_tokens(1).await;
    let mut lifecycle = RequestLifecycle::new(pool.clone(), "default");

    let selected = lifecycle.acquire().await.expect("acquire");
    let snapshot = pool.metrics_for_token(selected.token.id).await;
    assert_eq!(snapshot.in_flight, 1);

    lifecycle.end(true).await;
    let snapshot = pool.metrics_for_token(selected.token.id).await;
    assert_eq!(snapshot.in_flight, 0);
    assert_eq!(snapshot.request_count, 1);
    assert_eq!(snapshot.failure_count, 0);
}

#[tokio::test]
async fn end_is_idempotent() {
    let pool = manager_with_tokens(1).await;
    let mut lifecycle = RequestLifecycle::new(pool.clone(), "default");
    let selected = lifecycle.acquire().await.expect("acquire");

    lifecycle.end(true).await;
    lifecycle.end(true).await;
    lifecycle.end(false).await;

    let snapshot = pool.metrics_for_token(selected.token.id).await;
    assert_eq!(snapshot.in_flight, 0);
    assert_eq!(snapshot.request_count, 1);
}

#[tokio::test]
async fn switch_token_transfers_in_flight_and_cools_the_old_one() {
    let pool = manager_with_tokens(2).await;
    let mut lifecycle = RequestLifecycle::new(pool.clone(), "default");

    let first = lifecycle.acquire().await.expect("first");
    let second = lifecycle.switch_token().await.expect("failover");
    assert_ne!(first.token.id, second.token.id);

    // The in-flight window moved to the replacement credential.
    assert_eq!(pool.metrics_for_token(first.token.id).await.in_flight, 0);
    assert_eq!(pool.metrics_for_token(second.token.id).await.in_flight, 1);
    // The failed credential took a failure sample and a cooldown.
    assert_eq!(pool.metrics_for_token(first.token.id).await.failure_count, 1);
    let stats = pool.pool_stats().await;
    assert_eq!(stats.iter().find(|s| s.group == "default").unwrap().cooldown_count, 1);

    lifecycle.end(true).await;
    assert_eq!(pool.metrics_for_token(second.token.id).await.in_flight, 0);
}

#[tokio::test]
async fn every_error_path_still_balances() {
    // Acquire against an empty group fails; end() on a lifecycle that never
    // started must be a no-op.
    let pool = manager_with_tokens(0).await;
    let mut lifecycle = RequestLifecycle::new(pool.clone(), "default");
    assert!(lifecycle.acquire().await.is_err());
    lifecycle.end(false).await;
    let (total, active) = pool.global_in_flight().await;
    assert_eq!(total, 0);
    assert_eq!(active, 0);
}
