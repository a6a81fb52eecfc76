use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use kirogate_common::{ErrorResponse, Settings};
use kirogate_core::AppContext;
use kirogate_storage::{ApiKeyRecord, GroupRecord, NewToken, StoreError, TokenStatus};

fn store_error(err: StoreError) -> Response {
    let (status, message) = match &err {
        StoreError::Duplicate => (StatusCode::CONFLICT, "already exists".to_string()),
        StoreError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
        StoreError::ReservedGroup(name) => (
            StatusCode::BAD_REQUEST,
            format!("reserved group name: {name}"),
        ),
        StoreError::Db(err) => {
            tracing::error!(error = %err, "admin store operation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
        }
    };
    (
        status,
        Json(ErrorResponse::from_status(status.as_u16(), &message)),
    )
        .into_response()
}

// ----- tokens -----

#[derive(Debug, Deserialize)]
pub struct ListTokensQuery {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

fn default_limit() -> u64 {
    100
}

pub async fn list_tokens(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListTokensQuery>,
) -> Response {
    let result = match &query.group {
        Some(group) => ctx.store.list_by_group(group, query.limit, query.offset).await,
        None => ctx.store.list_all(query.limit, query.offset).await,
    };
    let tokens = match result {
        Ok(tokens) => tokens,
        Err(err) => return store_error(err),
    };
    let metrics = ctx.pool.all_metrics().await;
    let total = ctx.store.count_all().await.unwrap_or(0);

    let rows: Vec<serde_json::Value> = tokens
        .into_iter()
        .map(|t| {
            let m = metrics.get(&t.id).cloned().unwrap_or_default();
            json!({
                "id": t.id,
                "auth_type": t.auth_type,
                // The secret itself stays server-side; expose a prefix for
                // identification only.
                "refresh_token_prefix": t.refresh_token.chars().take(12).collect::<String>(),
                "disabled": t.disabled,
                "group_name": t.group_name,
                "name": t.name,
                "status": t.status,
                "user_email": t.user_email,
                "available_usage": t.available_usage,
                "total_limit": t.total_limit,
                "current_usage": t.current_usage,
                "last_verified_at": t.last_verified_at,
                "last_used_at": t.last_used_at,
                "error_msg": t.error_msg,
                "request_count": m.request_count,
                "failure_count": m.failure_count,
                "in_flight": m.in_flight,
                "avg_latency_ms": m.avg_latency_ms,
            })
        })
        .collect();
    Json(json!({ "total": total, "tokens": rows })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct AddTokenBody {
    #[serde(default)]
    pub auth_type: Option<String>,
    pub refresh_token: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl AddTokenBody {
    fn into_new_token(self) -> NewToken {
        NewToken {
            auth_type: self.auth_type.unwrap_or_else(|| "Social".to_string()),
            refresh_token: self.refresh_token,
            client_id: self.client_id,
            client_secret: self.client_secret,
            disabled: self.disabled,
            group_name: self
                .group_name
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| "default".to_string()),
            name: self.name,
            status: TokenStatus::Active,
        }
    }
}

pub async fn add_token(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<AddTokenBody>,
) -> Response {
    if body.refresh_token.is_empty() {
        return store_error(StoreError::NotFound);
    }
    let new = body.into_new_token();
    if new.auth_type == "IdC"
        && (new.client_id.as_deref().unwrap_or("").is_empty()
            || new.client_secret.as_deref().unwrap_or("").is_empty())
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::from_status(
                400,
                "IdC credentials require client_id and client_secret",
            )),
        )
            .into_response();
    }
    match ctx.store.create(new).await {
        Ok(record) => {
            if let Err(err) = ctx.pool.update_configs().await {
                tracing::warn!(error = %err, "pool rebuild after token add failed");
            }
            Json(json!({ "id": record.id })).into_response()
        }
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkTokensBody {
    pub tokens: Vec<AddTokenBody>,
}

pub async fn add_tokens_bulk(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<BulkTokensBody>,
) -> Response {
    let batch: Vec<NewToken> = body
        .tokens
        .into_iter()
        .filter(|t| !t.refresh_token.is_empty())
        .map(AddTokenBody::into_new_token)
        .collect();
    match ctx.store.bulk_insert(batch).await {
        Ok(report) => {
            if let Err(err) = ctx.pool.update_configs().await {
                tracing::warn!(error = %err, "pool rebuild after bulk import failed");
            }
            Json(json!({
                "inserted": report.inserted,
                "duplicates": report.duplicates,
            }))
            .into_response()
        }
        Err(err) => store_error(err),
    }
}

pub async fn delete_token(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
) -> Response {
    match ctx.store.delete(id).await {
        Ok(()) => {
            if let Err(err) = ctx.pool.update_configs().await {
                tracing::warn!(error = %err, "pool rebuild after token delete failed");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateTokenBody {
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn update_token(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateTokenBody>,
) -> Response {
    if let Some(disabled) = body.disabled {
        if let Err(err) = ctx.store.set_disabled(id, disabled).await {
            return store_error(err);
        }
    }
    if let Some(name) = body.name {
        if let Err(err) = ctx.store.set_name(id, Some(name)).await {
            return store_error(err);
        }
    }
    if let Err(err) = ctx.pool.update_configs().await {
        tracing::warn!(error = %err, "pool rebuild after token update failed");
    }
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Deserialize)]
pub struct MoveTokenBody {
    pub group_name: String,
}

pub async fn move_token(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
    Json(body): Json<MoveTokenBody>,
) -> Response {
    match ctx.store.move_to_group(id, &body.group_name).await {
        Ok(()) => {
            if let Err(err) = ctx.pool.update_configs().await {
                tracing::warn!(error = %err, "pool rebuild after token move failed");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct RefreshTokensBody {
    #[serde(default = "default_refresh_limit")]
    pub limit: u64,
}

fn default_refresh_limit() -> u64 {
    50
}

pub async fn refresh_tokens(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<RefreshTokensBody>,
) -> Response {
    let (refreshed, failed) = ctx.refresher.refresh_now(body.limit).await;
    Json(json!({ "refreshed": refreshed, "failed": failed })).into_response()
}

// ----- groups -----

pub async fn list_groups(State(ctx): State<Arc<AppContext>>) -> Response {
    let groups = ctx.groups.list().await;
    let stats = ctx.store.group_stats().await.unwrap_or_default();
    let rows: Vec<serde_json::Value> = groups
        .into_iter()
        .map(|g| {
            let stat = stats.iter().find(|s| s.group_name == g.name);
            json!({
                "name": g.name,
                "display_name": g.display_name,
                "priority": g.priority,
                "rate_limit_qps": g.rate_limit_qps,
                "rate_limit_burst": g.rate_limit_burst,
                "cooldown_sec": g.cooldown_sec,
                "token_count": stat.map(|s| s.total).unwrap_or(0),
                "active_count": stat.map(|s| s.active).unwrap_or(0),
            })
        })
        .collect();
    Json(json!({ "groups": rows })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct GroupBody {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub rate_limit_qps: f64,
    #[serde(default)]
    pub rate_limit_burst: i32,
    #[serde(default)]
    pub cooldown_sec: i64,
}

impl GroupBody {
    fn into_record(self) -> GroupRecord {
        GroupRecord {
            name: self.name,
            display_name: self.display_name,
            priority: self.priority,
            rate_limit_qps: self.rate_limit_qps,
            rate_limit_burst: self.rate_limit_burst,
            cooldown_sec: self.cooldown_sec,
        }
    }
}

pub async fn create_group(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<GroupBody>,
) -> Response {
    match ctx.groups.create(body.into_record()).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => store_error(err),
    }
}

pub async fn update_group(
    State(ctx): State<Arc<AppContext>>,
    Path(name): Path<String>,
    Json(mut body): Json<GroupBody>,
) -> Response {
    body.name = name;
    match ctx.groups.update(body.into_record()).await {
        Ok(()) => {
            if let Err(err) = ctx.pool.reload().await {
                tracing::warn!(error = %err, "pool reload after group update failed");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct RenameGroupBody {
    pub new_name: String,
}

pub async fn rename_group(
    State(ctx): State<Arc<AppContext>>,
    Path(name): Path<String>,
    Json(body): Json<RenameGroupBody>,
) -> Response {
    match ctx.groups.rename(&name, &body.new_name).await {
        Ok(()) => {
            if let Err(err) = ctx.pool.update_configs().await {
                tracing::warn!(error = %err, "pool rebuild after group rename failed");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => store_error(err),
    }
}

pub async fn delete_group(
    State(ctx): State<Arc<AppContext>>,
    Path(name): Path<String>,
) -> Response {
    match ctx.groups.delete(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

// ----- api keys -----

pub async fn list_keys(State(ctx): State<Arc<AppContext>>) -> Response {
    let keys = ctx.api_keys.list().await;
    let rows: Vec<serde_json::Value> = keys
        .into_iter()
        .map(|k| {
            json!({
                "key": k.key,
                "name": k.name,
                "allowed_groups": k.allowed_groups,
            })
        })
        .collect();
    Json(json!({ "keys": rows })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct KeyBody {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
}

pub async fn create_key(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<KeyBody>,
) -> Response {
    if body.key.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::from_status(400, "key must not be empty")),
        )
            .into_response();
    }
    let record = ApiKeyRecord {
        key: body.key,
        name: body.name,
        allowed_groups: body.allowed_groups,
    };
    match ctx.api_keys.save(record).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateKeyBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub allowed_groups: Option<Vec<String>>,
}

pub async fn update_key(
    State(ctx): State<Arc<AppContext>>,
    Path(key): Path<String>,
    Json(body): Json<UpdateKeyBody>,
) -> Response {
    let Some(mut record) = ctx.api_keys.get(&key).await else {
        return store_error(StoreError::NotFound);
    };
    if let Some(name) = body.name {
        record.name = Some(name);
    }
    if let Some(groups) = body.allowed_groups {
        record.allowed_groups = groups;
    }
    match ctx.api_keys.save(record).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

pub async fn delete_key(
    State(ctx): State<Arc<AppContext>>,
    Path(key): Path<String>,
) -> Response {
    match ctx.api_keys.delete(&key).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => store_error(StoreError::NotFound),
        Err(err) => store_error(err),
    }
}

// ----- settings / stats / logs -----

pub async fn get_settings(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(ctx.settings.get().as_ref().clone()).into_response()
}

pub async fn update_settings(
    State(ctx): State<Arc<AppContext>>,
    Json(settings): Json<Settings>,
) -> Response {
    match ctx.settings.update(settings.clone()).await {
        Ok(()) => {
            ctx.limiter
                .reconfigure(settings.rate_limit_qps, settings.rate_limit_burst);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => store_error(err),
    }
}

pub async fn stats(State(ctx): State<Arc<AppContext>>) -> Response {
    let summary = ctx.logs.summary().await.unwrap_or_default();
    let pool_stats = ctx.pool.pool_stats().await;
    let (in_flight, active_tokens) = ctx.pool.global_in_flight().await;
    let (qps, burst, available) = ctx.limiter.stats();
    Json(json!({
        "requests": summary,
        "pools": pool_stats,
        "in_flight": in_flight,
        "active_tokens": active_tokens,
        "rate_limiter": { "qps": qps, "burst": burst, "available": available },
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_logs_limit")]
    pub limit: u64,
    #[serde(default)]
    pub group: Option<String>,
}

fn default_logs_limit() -> u64 {
    100
}

pub async fn logs(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let limit = query.limit.min(1000);
    let result = match &query.group {
        Some(group) => ctx.logs.recent_for_group(group, limit).await,
        None => ctx.logs.recent(limit).await,
    };
    match result {
        Ok(rows) => Json(json!({ "logs": rows })).into_response(),
        Err(err) => store_error(err),
    }
}
