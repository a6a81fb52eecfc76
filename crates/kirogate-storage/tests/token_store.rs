use kirogate_storage::{
    connect_memory, migrate_legacy_json, GroupRecord, NewToken, StoreError, TokenStatus,
    TokenStore, TokenUpdate,
};
use time::OffsetDateTime;

fn new_token(refresh: &str, group: &str) -> NewToken {
    NewToken {
        auth_type: "Social".to_string(),
        refresh_token: refresh.to_string(),
        client_id: None,
        client_secret: None,
        disabled: false,
        group_name: group.to_string(),
        name: None,
        status: TokenStatus::Active,
    }
}

async fn store() -> TokenStore {
    TokenStore::new(connect_memory(false).await.expect("schema"))
}

#[tokio::test]
async fn refresh_token_uniqueness_is_enforced() {
    let store = store().await;
    store.create(new_token("rt-1", "default")).await.unwrap();
    let err = store.create(new_token("rt-1", "pro")).await.unwrap_err();
    assert!(matches!(err, StoreError::Duplicate));
}

#[tokio::test]
async fn bulk_insert_reports_inserted_and_duplicates() {
    let store = store().await;
    store.create(new_token("rt-a", "default")).await.unwrap();

    let report = store
        .bulk_insert(vec![
            new_token("rt-a", "default"),
            new_token("rt-b", "default"),
            new_token("rt-c", "pro"),
        ])
        .await
        .unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.duplicates, 1);
    assert_eq!(store.count_all().await.unwrap(), 3);
}

#[tokio::test]
async fn fix_orphaned_exhausted_converges_invariant() {
    let store = store().await;
    let orphan = store.create(new_token("rt-orphan", "default")).await.unwrap();
    let healthy = store.create(new_token("rt-healthy", "default")).await.unwrap();
    let unverified = store.create(new_token("rt-new", "default")).await.unwrap();

    store
        .update_fields(
            orphan.id,
            TokenUpdate {
                available_usage: Some(0.0),
                last_verified_at: Some(OffsetDateTime::now_utc()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
        .update_fields(
            healthy.id,
            TokenUpdate {
                available_usage: Some(42.0),
                last_verified_at: Some(OffsetDateTime::now_utc()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let fixed = store.fix_orphaned_exhausted().await.unwrap();
    assert_eq!(fixed, 1);

    let orphan = store.get_by_id(orphan.id).await.unwrap();
    assert_eq!(orphan.status, "exhausted");
    assert_eq!(orphan.group_name, "exhausted");

    // Never verified: not an orphan even at zero credit.
    let unverified = store.get_by_id(unverified.id).await.unwrap();
    assert_eq!(unverified.status, "");

    // Idempotent: a second pass finds nothing.
    assert_eq!(store.fix_orphaned_exhausted().await.unwrap(), 0);
}

#[tokio::test]
async fn find_oldest_unverified_puts_nulls_first() {
    let store = store().await;
    let verified = store.create(new_token("rt-v", "default")).await.unwrap();
    let fresh = store.create(new_token("rt-f", "default")).await.unwrap();
    store
        .update_fields(
            verified.id,
            TokenUpdate {
                last_verified_at: Some(OffsetDateTime::now_utc()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let batch = store.find_oldest_unverified(10).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].id, fresh.id);
    assert_eq!(batch[1].id, verified.id);
}

#[tokio::test]
async fn rename_group_moves_tokens_atomically() {
    let store = store().await;
    store
        .create_group(&GroupRecord {
            name: "team-a".to_string(),
            display_name: None,
            priority: 0,
            rate_limit_qps: 0.0,
            rate_limit_burst: 0,
            cooldown_sec: 0,
        })
        .await
        .unwrap();
    store.create(new_token("rt-1", "team-a")).await.unwrap();
    store.create(new_token("rt-2", "team-a")).await.unwrap();

    store.rename_group("team-a", "team-b").await.unwrap();

    let moved = store.list_by_group("team-b", 100, 0).await.unwrap();
    assert_eq!(moved.len(), 2);
    assert!(store.list_by_group("team-a", 100, 0).await.unwrap().is_empty());
    let groups = store.list_groups().await.unwrap();
    assert!(groups.iter().any(|g| g.name == "team-b"));
}

#[tokio::test]
async fn reserved_group_names_are_rejected() {
    let store = store().await;
    for name in ["banned", "exhausted"] {
        let err = store
            .create_group(&GroupRecord {
                name: name.to_string(),
                display_name: None,
                priority: 0,
                rate_limit_qps: 0.0,
                rate_limit_burst: 0,
                cooldown_sec: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReservedGroup(_)));
    }
    assert!(matches!(
        store.delete_group("default").await.unwrap_err(),
        StoreError::ReservedGroup(_)
    ));
    assert!(matches!(
        store.rename_group("default", "other").await.unwrap_err(),
        StoreError::ReservedGroup(_)
    ));
    assert!(matches!(
        store.rename_group("some", "banned").await.unwrap_err(),
        StoreError::ReservedGroup(_)
    ));
}

#[tokio::test]
async fn settings_roundtrip() {
    let store = store().await;
    assert!(store.load_settings_json().await.unwrap().is_none());
    store.save_settings_json("{\"max_retries\":5}").await.unwrap();
    store.save_settings_json("{\"max_retries\":7}").await.unwrap();
    assert_eq!(
        store.load_settings_json().await.unwrap().as_deref(),
        Some("{\"max_retries\":7}")
    );
}

#[tokio::test]
async fn legacy_json_config_migrates_once() {
    let store = store().await;

    let path = std::env::temp_dir().join(format!(
        "kirogate_migrate_test_{}.json",
        std::process::id()
    ));
    std::fs::write(
        &path,
        serde_json::json!({
            "default_group": "default",
            "groups": {
                "pro": {"display_name": "Pro", "settings": {"cooldown_sec": 60}}
            },
            "api_keys": [
                {"key": "sk-test", "name": "ci", "allowed_groups": ["pro"]}
            ],
            "tokens": [
                {"auth": "Social", "refreshToken": "rt-legacy-1", "group": "pro"},
                {"auth": "IdC", "refreshToken": "rt-legacy-2", "clientId": "c", "clientSecret": "s"}
            ]
        })
        .to_string(),
    )
    .unwrap();

    let report = migrate_legacy_json(&store, &path).await.unwrap();
    assert_eq!(report.tokens_inserted, 2);
    assert_eq!(report.groups, 1);
    assert_eq!(report.api_keys, 1);
    assert!(!path.exists(), "legacy file should be renamed away");

    // The credential set round-trips through the migration.
    let all = store.list_all(100, 0).await.unwrap();
    let mut refresh_tokens: Vec<&str> =
        all.iter().map(|t| t.refresh_token.as_str()).collect();
    refresh_tokens.sort();
    assert_eq!(refresh_tokens, vec!["rt-legacy-1", "rt-legacy-2"]);
    assert_eq!(
        all.iter().find(|t| t.refresh_token == "rt-legacy-2").unwrap().auth_type,
        "IdC"
    );

    let keys = store.list_api_keys().await.unwrap();
    assert_eq!(keys[0].allowed_groups, vec!["pro".to_string()]);

    if let Some(backup) = report.backed_up_to {
        let _ = std::fs::remove_file(backup);
    }
}
