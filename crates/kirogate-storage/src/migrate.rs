use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::token_store::{
    ApiKeyRecord, GroupRecord, NewToken, StoreError, TokenStatus, TokenStore, DEFAULT_GROUP,
};

#[derive(Debug, Default)]
pub struct MigrateReport {
    pub tokens_inserted: usize,
    pub tokens_skipped: usize,
    pub groups: usize,
    pub api_keys: usize,
    pub backed_up_to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyToken {
    #[serde(default, alias = "auth")]
    auth_type: Option<String>,
    #[serde(alias = "refreshToken")]
    refresh_token: String,
    #[serde(default, alias = "clientId")]
    client_id: Option<String>,
    #[serde(default, alias = "clientSecret")]
    client_secret: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyGroupSettings {
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    rate_limit_qps: f64,
    #[serde(default)]
    rate_limit_burst: i32,
    #[serde(default)]
    cooldown_sec: i64,
}

#[derive(Debug, Deserialize)]
struct LegacyGroup {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    settings: Option<LegacyGroupSettings>,
}

#[derive(Debug, Deserialize)]
struct LegacyKey {
    key: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    allowed_groups: Vec<String>,
}

/// Object-shaped config file (newer layout).
#[derive(Debug, Deserialize)]
struct LegacyGlobalConfig {
    #[serde(default)]
    default_group: Option<String>,
    #[serde(default)]
    groups: HashMap<String, LegacyGroup>,
    #[serde(default)]
    api_keys: Vec<LegacyKey>,
    #[serde(default)]
    tokens: Vec<LegacyToken>,
}

/// Migrate a legacy `auth_config.json` into the database, then rename the
/// file so it is never read again. No-op when the file is absent or the DB
/// already holds credentials.
pub async fn migrate_legacy_json(
    store: &TokenStore,
    json_path: &Path,
) -> Result<MigrateReport, StoreError> {
    let mut report = MigrateReport::default();

    if !json_path.exists() {
        return Ok(report);
    }
    if store.count_all().await? > 0 {
        tracing::info!(path = %json_path.display(), "database already populated, skipping legacy migration");
        return Ok(report);
    }

    let raw = match std::fs::read_to_string(json_path) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(error = %err, "failed to read legacy config, skipping");
            return Ok(report);
        }
    };

    let (tokens, groups, api_keys) = parse_legacy(&raw);
    if tokens.is_empty() && groups.is_empty() && api_keys.is_empty() {
        tracing::info!("legacy config carries no usable entries");
        return Ok(report);
    }

    for (name, group) in &groups {
        let settings = group.settings.as_ref();
        let record = GroupRecord {
            name: name.clone(),
            display_name: group.display_name.clone(),
            priority: settings.map(|s| s.priority).unwrap_or(0),
            rate_limit_qps: settings.map(|s| s.rate_limit_qps).unwrap_or(0.0),
            rate_limit_burst: settings.map(|s| s.rate_limit_burst).unwrap_or(0),
            cooldown_sec: settings.map(|s| s.cooldown_sec).unwrap_or(0),
        };
        match store.create_group(&record).await {
            Ok(()) => report.groups += 1,
            Err(StoreError::Duplicate) | Err(StoreError::ReservedGroup(_)) => {}
            Err(err) => tracing::warn!(group = %name, error = %err, "group migration failed"),
        }
    }

    for key in &api_keys {
        let record = ApiKeyRecord {
            key: key.key.clone(),
            name: key.name.clone(),
            allowed_groups: key.allowed_groups.clone(),
        };
        match store.save_api_key(&record).await {
            Ok(()) => report.api_keys += 1,
            Err(err) => tracing::warn!(error = %err, "api key migration failed"),
        }
    }

    let batch: Vec<NewToken> = tokens
        .into_iter()
        .filter(|t| !t.refresh_token.is_empty())
        .map(|t| NewToken {
            auth_type: t.auth_type.unwrap_or_else(|| "Social".to_string()),
            refresh_token: t.refresh_token,
            client_id: t.client_id,
            client_secret: t.client_secret,
            disabled: t.disabled,
            group_name: t
                .group
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            name: t.name,
            status: TokenStatus::from_column(t.status.as_deref().unwrap_or("")),
        })
        .collect();
    if !batch.is_empty() {
        let inserted = store.bulk_insert(batch).await?;
        report.tokens_inserted = inserted.inserted;
        report.tokens_skipped = inserted.duplicates;
    }

    // Rename, never delete: the original stays recoverable.
    let stamp_format = format_description!("[year][month][day]_[hour][minute][second]");
    let stamp = OffsetDateTime::now_utc()
        .format(&stamp_format)
        .unwrap_or_else(|_| "migrated".to_string());
    let backup = json_path.with_file_name(format!(
        "{}.migrated.{stamp}",
        json_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "auth_config.json".to_string())
    ));
    match std::fs::rename(json_path, &backup) {
        Ok(()) => report.backed_up_to = Some(backup.display().to_string()),
        Err(err) => tracing::warn!(error = %err, "failed to back up legacy config"),
    }

    tracing::info!(
        inserted = report.tokens_inserted,
        duplicates = report.tokens_skipped,
        groups = report.groups,
        api_keys = report.api_keys,
        "legacy config migrated"
    );
    Ok(report)
}

fn parse_legacy(
    raw: &str,
) -> (
    Vec<LegacyToken>,
    HashMap<String, LegacyGroup>,
    Vec<LegacyKey>,
) {
    if let Ok(global) = serde_json::from_str::<LegacyGlobalConfig>(raw) {
        if !global.tokens.is_empty() || !global.groups.is_empty() || !global.api_keys.is_empty() {
            let _ = global.default_group;
            return (global.tokens, global.groups, global.api_keys);
        }
    }
    if let Ok(array) = serde_json::from_str::<Vec<LegacyToken>>(raw) {
        return (array, HashMap::new(), Vec::new());
    }
    if let Ok(single) = serde_json::from_str::<LegacyToken>(raw) {
        return (vec![single], HashMap::new(), Vec::new());
    }
    (Vec::new(), HashMap::new(), Vec::new())
}
