use std::sync::Arc;

use arc_swap::ArcSwap;
use time::OffsetDateTime;

use kirogate_auth::RefreshClient;
use kirogate_common::Settings;
use kirogate_pool::{CachedToken, GroupManager, TokenPoolManager};
use kirogate_storage::{connect_memory, NewToken, TokenStatus, TokenStore};

async fn seeded_manager(tokens: &[(&str, &str)]) -> (Arc<TokenPoolManager>, TokenStore) {
    let store = TokenStore::new(connect_memory(false).await.expect("schema"));
    for (refresh, group) in tokens {
        store
            .create(NewToken {
                auth_type: "Social".to_string(),
                refresh_token: refresh.to_string(),
                client_id: None,
                client_secret: None,
                disabled: false,
                group_name: group.to_string(),
                name: None,
                status: TokenStatus::Active,
            })
            .await
            .expect("seed token");
    }

    let groups = Arc::new(GroupManager::load(store.clone()).await.expect("groups"));
    let settings = Arc::new(ArcSwap::from_pointee(Settings::default()));
    let manager = TokenPoolManager::new(
        store.clone(),
        RefreshClient::new(),
        groups,
        settings,
        None,
    );
    manager.reload().await.expect("reload");
    manager.mark_cache_fresh();
    (manager, store)
}

fn live_entry(access_token: &str, available: f64) -> CachedToken {
    CachedToken {
        access_token: access_token.to_string(),
        expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
        usage: None,
        available,
        cached_at: OffsetDateTime::now_utc(),
        last_used: None,
    }
}

#[tokio::test]
async fn empty_group_reports_no_token() {
    let (manager, _store) = seeded_manager(&[]).await;
    let err = manager.get_best("default").await.unwrap_err();
    assert!(err.to_string().contains("no token in group"));
}

#[tokio::test]
async fn selection_skips_unpopulated_cache() {
    let (manager, _store) = seeded_manager(&[("rt-1", "default")]).await;
    // No cache entry yet: the credential exists but is not selectable.
    let err = manager.get_best("default").await.unwrap_err();
    assert!(err.to_string().contains("no available token"));
}

#[tokio::test]
async fn round_robin_rotates_between_live_tokens() {
    let (manager, store) = seeded_manager(&[("rt-1", "default"), ("rt-2", "default")]).await;
    let records = store.list_all(10, 0).await.unwrap();
    manager.cache().set(records[0].id, live_entry("at-1", 100.0)).await;
    manager.cache().set(records[1].id, live_entry("at-2", 100.0)).await;

    let first = manager.get_best("default").await.unwrap();
    let second = manager.get_best("default").await.unwrap();
    assert_ne!(first.token.id, second.token.id);
}

#[tokio::test]
async fn selection_decrements_available_and_skips_at_zero() {
    let (manager, store) = seeded_manager(&[("rt-1", "default")]).await;
    let id = store.list_all(10, 0).await.unwrap()[0].id;
    manager.cache().set(id, live_entry("at-1", 0.5)).await;

    let picked = manager.get_best("default").await.unwrap();
    assert_eq!(picked.token.id, id);
    assert!(picked.is_usage_exceeded);

    // Balance is now zero: the credential no longer qualifies.
    let err = manager.get_best("default").await.unwrap_err();
    assert!(err.to_string().contains("no available token"));
}

#[tokio::test]
async fn expired_cache_entry_is_skipped() {
    let (manager, store) = seeded_manager(&[("rt-1", "default")]).await;
    let id = store.list_all(10, 0).await.unwrap()[0].id;
    let mut entry = live_entry("at-1", 10.0);
    entry.expires_at = OffsetDateTime::now_utc() - time::Duration::minutes(1);
    manager.cache().set(id, entry).await;

    assert!(manager.get_best("default").await.is_err());
}

#[tokio::test]
async fn mark_failed_puts_token_on_cooldown() {
    let (manager, store) = seeded_manager(&[("rt-1", "default"), ("rt-2", "default")]).await;
    let records = store.list_all(10, 0).await.unwrap();
    manager.cache().set(records[0].id, live_entry("at-1", 10.0)).await;
    manager.cache().set(records[1].id, live_entry("at-2", 10.0)).await;

    let first = manager.get_best("default").await.unwrap();
    manager.mark_failed(&first.token).await;

    // The cooled credential is skipped; every subsequent pick is the other.
    for _ in 0..3 {
        let next = manager.get_best("default").await.unwrap();
        assert_ne!(next.token.id, first.token.id);
    }

    let stats = manager.pool_stats().await;
    let default_stats = stats.iter().find(|s| s.group == "default").unwrap();
    assert_eq!(default_stats.cooldown_count, 1);

    let snapshot = manager.metrics_for_token(first.token.id).await;
    assert_eq!(snapshot.failure_count, 1);
}

#[tokio::test]
async fn in_flight_cap_excludes_saturated_tokens() {
    let (manager, store) = seeded_manager(&[("rt-1", "default")]).await;
    let id = store.list_all(10, 0).await.unwrap()[0].id;
    manager.cache().set(id, live_entry("at-1", 100.0)).await;

    let token = manager.get_best("default").await.unwrap().token;
    // Saturate the default per-token cap of 5.
    for _ in 0..5 {
        manager.start_request(&token).await;
    }
    assert!(manager.get_best("default").await.is_err());

    manager.end_request(&token).await;
    assert!(manager.get_best("default").await.is_ok());
}

#[tokio::test]
async fn start_end_balance_returns_in_flight_to_zero() {
    let (manager, store) = seeded_manager(&[("rt-1", "default")]).await;
    let id = store.list_all(10, 0).await.unwrap()[0].id;
    manager.cache().set(id, live_entry("at-1", 10.0)).await;
    let token = manager.get_best("default").await.unwrap().token;

    manager.start_request(&token).await;
    manager.start_request(&token).await;
    manager.end_request(&token).await;
    manager.end_request(&token).await;

    let (total, active) = manager.global_in_flight().await;
    assert_eq!(total, 0);
    assert_eq!(active, 0);
}

#[tokio::test]
async fn grouped_tokens_are_isolated() {
    let (manager, store) = seeded_manager(&[("rt-pro", "pro"), ("rt-def", "default")]).await;
    let records = store.list_all(10, 0).await.unwrap();
    for record in &records {
        manager.cache().set(record.id, live_entry("at", 10.0)).await;
    }

    let pro = manager.get_best("pro").await.unwrap();
    let pro_record = records.iter().find(|r| r.group_name == "pro").unwrap();
    assert_eq!(pro.token.id, pro_record.id);

    assert!(manager.get_best("missing-group").await.is_err());
}

#[tokio::test]
async fn reload_preserves_metrics_across_rebuild() {
    let (manager, store) = seeded_manager(&[("rt-1", "default")]).await;
    let id = store.list_all(10, 0).await.unwrap()[0].id;
    manager.cache().set(id, live_entry("at-1", 10.0)).await;
    let token = manager.get_best("default").await.unwrap().token;
    manager
        .record_request(&token, std::time::Duration::from_millis(25), true)
        .await;

    manager.reload().await.unwrap();

    let snapshot = manager.metrics_for_token(id).await;
    assert_eq!(snapshot.request_count, 1);
}
