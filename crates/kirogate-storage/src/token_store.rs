use std::sync::Arc;

use sea_orm::sea_query::{NullOrdering, OnConflict};
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    DbErr, EntityTrait, FromQueryResult, Order, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Statement, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::entities::{self, api_keys, groups, settings, tokens};

pub const RESERVED_GROUP_BANNED: &str = "banned";
pub const RESERVED_GROUP_EXHAUSTED: &str = "exhausted";
pub const DEFAULT_GROUP: &str = "default";
const SETTINGS_KEY: &str = "global_settings";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("token already exists")]
    Duplicate,
    #[error("record not found")]
    NotFound,
    #[error("reserved group name: {0}")]
    ReservedGroup(String),
    #[error(transparent)]
    Db(#[from] DbErr),
}

fn map_insert_err(err: DbErr) -> StoreError {
    if err.to_string().contains("UNIQUE constraint failed") {
        StoreError::Duplicate
    } else {
        StoreError::Db(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Active,
    Exhausted,
    Banned,
}

impl TokenStatus {
    /// Column encoding: active credentials carry an empty status string.
    pub fn as_column(&self) -> &'static str {
        match self {
            TokenStatus::Active => "",
            TokenStatus::Exhausted => "exhausted",
            TokenStatus::Banned => "banned",
        }
    }

    pub fn from_column(value: &str) -> Self {
        match value {
            "exhausted" => TokenStatus::Exhausted,
            "banned" => TokenStatus::Banned,
            _ => TokenStatus::Active,
        }
    }
}

pub type TokenRecord = tokens::Model;

/// Insert payload for a credential; cache/quota fields start empty.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub auth_type: String,
    pub refresh_token: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub disabled: bool,
    pub group_name: String,
    pub name: Option<String>,
    pub status: TokenStatus,
}

/// Refresher write-back after one verification pass.
#[derive(Debug, Clone, Default)]
pub struct TokenUpdate {
    pub status: Option<TokenStatus>,
    pub group_name: Option<String>,
    pub user_email: Option<String>,
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<OffsetDateTime>,
    pub available_usage: Option<f64>,
    pub base_usage: Option<f64>,
    pub free_trial_usage: Option<f64>,
    pub total_limit: Option<f64>,
    pub current_usage: Option<f64>,
    pub last_verified_at: Option<OffsetDateTime>,
    pub error_msg: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct BulkInsertReport {
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub display_name: Option<String>,
    pub priority: i32,
    pub rate_limit_qps: f64,
    pub rate_limit_burst: i32,
    pub cooldown_sec: i64,
}

impl From<groups::Model> for GroupRecord {
    fn from(m: groups::Model) -> Self {
        Self {
            name: m.name,
            display_name: m.display_name,
            priority: m.priority,
            rate_limit_qps: m.rate_limit_qps,
            rate_limit_burst: m.rate_limit_burst,
            cooldown_sec: m.cooldown_sec,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub name: Option<String>,
    pub allowed_groups: Vec<String>,
}

#[derive(Debug, Clone, FromQueryResult)]
pub struct GroupStat {
    pub group_name: String,
    pub total: i64,
    pub active: i64,
}

/// System of record for credentials, groups, API keys, and settings.
///
/// WAL already permits one writer alongside readers; the in-process mutex on
/// top keeps concurrent mutations from ever seeing SQLITE_BUSY.
#[derive(Clone)]
pub struct TokenStore {
    db: DatabaseConnection,
    write_lock: Arc<Mutex<()>>,
}

impl TokenStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn health(&self) -> Result<(), StoreError> {
        entities::SettingsRows::find().one(&self.db).await?;
        Ok(())
    }

    // ----- credentials -----

    pub async fn create(&self, new: NewToken) -> Result<TokenRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let now = OffsetDateTime::now_utc();
        let active = tokens::ActiveModel {
            auth_type: ActiveValue::Set(new.auth_type),
            refresh_token: ActiveValue::Set(new.refresh_token),
            client_id: ActiveValue::Set(new.client_id),
            client_secret: ActiveValue::Set(new.client_secret),
            disabled: ActiveValue::Set(new.disabled),
            group_name: ActiveValue::Set(new.group_name),
            name: ActiveValue::Set(new.name),
            status: ActiveValue::Set(new.status.as_column().to_string()),
            available_usage: ActiveValue::Set(0.0),
            base_usage: ActiveValue::Set(0.0),
            free_trial_usage: ActiveValue::Set(0.0),
            total_limit: ActiveValue::Set(0.0),
            current_usage: ActiveValue::Set(0.0),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        active.insert(&self.db).await.map_err(map_insert_err)
    }

    pub async fn bulk_insert(&self, batch: Vec<NewToken>) -> Result<BulkInsertReport, StoreError> {
        let _guard = self.write_lock.lock().await;
        let now = OffsetDateTime::now_utc();
        let txn = self.db.begin().await?;
        let mut report = BulkInsertReport::default();

        for new in batch {
            let active = tokens::ActiveModel {
                auth_type: ActiveValue::Set(new.auth_type),
                refresh_token: ActiveValue::Set(new.refresh_token),
                client_id: ActiveValue::Set(new.client_id),
                client_secret: ActiveValue::Set(new.client_secret),
                disabled: ActiveValue::Set(new.disabled),
                group_name: ActiveValue::Set(new.group_name),
                name: ActiveValue::Set(new.name),
                status: ActiveValue::Set(new.status.as_column().to_string()),
                available_usage: ActiveValue::Set(0.0),
                base_usage: ActiveValue::Set(0.0),
                free_trial_usage: ActiveValue::Set(0.0),
                total_limit: ActiveValue::Set(0.0),
                current_usage: ActiveValue::Set(0.0),
                created_at: ActiveValue::Set(now),
                updated_at: ActiveValue::Set(now),
                ..Default::default()
            };
            let affected = entities::Tokens::insert(active)
                .on_conflict(
                    OnConflict::column(tokens::Column::RefreshToken)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;
            if affected > 0 {
                report.inserted += 1;
            } else {
                report.duplicates += 1;
            }
        }

        txn.commit().await?;
        Ok(report)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<TokenRecord, StoreError> {
        entities::Tokens::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn get_by_refresh_token(&self, refresh_token: &str) -> Result<TokenRecord, StoreError> {
        entities::Tokens::find()
            .filter(tokens::Column::RefreshToken.eq(refresh_token))
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn list_all(&self, limit: u64, offset: u64) -> Result<Vec<TokenRecord>, StoreError> {
        Ok(entities::Tokens::find()
            .order_by_asc(tokens::Column::Id)
            .limit(limit)
            .offset(offset)
            .all(&self.db)
            .await?)
    }

    pub async fn list_by_group(
        &self,
        group: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<TokenRecord>, StoreError> {
        Ok(entities::Tokens::find()
            .filter(tokens::Column::GroupName.eq(group))
            .order_by_asc(tokens::Column::Id)
            .limit(limit)
            .offset(offset)
            .all(&self.db)
            .await?)
    }

    pub async fn count_all(&self) -> Result<u64, StoreError> {
        Ok(entities::Tokens::find().count(&self.db).await?)
    }

    pub async fn count_active(&self) -> Result<u64, StoreError> {
        Ok(entities::Tokens::find()
            .filter(tokens::Column::Disabled.eq(false))
            .filter(tokens::Column::Status.eq(""))
            .count(&self.db)
            .await?)
    }

    pub async fn find_oldest_unverified(&self, limit: u64) -> Result<Vec<TokenRecord>, StoreError> {
        Ok(entities::Tokens::find()
            .filter(tokens::Column::Disabled.eq(false))
            .filter(tokens::Column::Status.eq(""))
            .order_by_with_nulls(tokens::Column::LastVerifiedAt, Order::Asc, NullOrdering::First)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn update_fields(&self, id: i64, update: TokenUpdate) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut active = tokens::ActiveModel {
            id: ActiveValue::Unchanged(id),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        if let Some(status) = update.status {
            active.status = ActiveValue::Set(status.as_column().to_string());
        }
        if let Some(group) = update.group_name {
            active.group_name = ActiveValue::Set(group);
        }
        if let Some(email) = update.user_email {
            active.user_email = ActiveValue::Set(Some(email));
        }
        if let Some(token) = update.access_token {
            active.access_token = ActiveValue::Set(Some(token));
        }
        if let Some(expires) = update.access_token_expires_at {
            active.access_token_expires_at = ActiveValue::Set(Some(expires));
        }
        if let Some(v) = update.available_usage {
            active.available_usage = ActiveValue::Set(v);
        }
        if let Some(v) = update.base_usage {
            active.base_usage = ActiveValue::Set(v);
        }
        if let Some(v) = update.free_trial_usage {
            active.free_trial_usage = ActiveValue::Set(v);
        }
        if let Some(v) = update.total_limit {
            active.total_limit = ActiveValue::Set(v);
        }
        if let Some(v) = update.current_usage {
            active.current_usage = ActiveValue::Set(v);
        }
        if let Some(v) = update.last_verified_at {
            active.last_verified_at = ActiveValue::Set(Some(v));
        }
        if let Some(v) = update.error_msg {
            active.error_msg = ActiveValue::Set(v);
        }
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        id: i64,
        status: TokenStatus,
        group_name: &str,
    ) -> Result<(), StoreError> {
        self.update_fields(
            id,
            TokenUpdate {
                status: Some(status),
                group_name: Some(group_name.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_disabled(&self, id: i64, disabled: bool) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let active = tokens::ActiveModel {
            id: ActiveValue::Unchanged(id),
            disabled: ActiveValue::Set(disabled),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn set_name(&self, id: i64, name: Option<String>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let active = tokens::ActiveModel {
            id: ActiveValue::Unchanged(id),
            name: ActiveValue::Set(name),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn move_to_group(&self, id: i64, group: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let active = tokens::ActiveModel {
            id: ActiveValue::Unchanged(id),
            group_name: ActiveValue::Set(group.to_string()),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn mark_used(&self, id: i64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let active = tokens::ActiveModel {
            id: ActiveValue::Unchanged(id),
            last_used_at: ActiveValue::Set(Some(OffsetDateTime::now_utc())),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        active.update(&self.db).await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        entities::Tokens::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    /// Enforce the quarantine invariant in one statement: a verified, active,
    /// enabled credential with no remaining credit converges to EXHAUSTED.
    pub async fn fix_orphaned_exhausted(&self) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let result = entities::Tokens::update_many()
            .col_expr(
                tokens::Column::Status,
                sea_orm::sea_query::Expr::value(RESERVED_GROUP_EXHAUSTED),
            )
            .col_expr(
                tokens::Column::GroupName,
                sea_orm::sea_query::Expr::value(RESERVED_GROUP_EXHAUSTED),
            )
            .col_expr(
                tokens::Column::UpdatedAt,
                sea_orm::sea_query::Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(tokens::Column::AvailableUsage.lte(0.0))
            .filter(tokens::Column::LastVerifiedAt.is_not_null())
            .filter(
                Condition::all()
                    .add(tokens::Column::Status.ne(RESERVED_GROUP_EXHAUSTED))
                    .add(tokens::Column::Status.ne(RESERVED_GROUP_BANNED)),
            )
            .filter(
                Condition::all()
                    .add(tokens::Column::GroupName.ne(RESERVED_GROUP_EXHAUSTED))
                    .add(tokens::Column::GroupName.ne(RESERVED_GROUP_BANNED)),
            )
            .filter(tokens::Column::Disabled.eq(false))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    // ----- groups -----

    pub async fn list_groups(&self) -> Result<Vec<GroupRecord>, StoreError> {
        Ok(entities::Groups::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(GroupRecord::from)
            .collect())
    }

    pub async fn create_group(&self, group: &GroupRecord) -> Result<(), StoreError> {
        if group.name == RESERVED_GROUP_BANNED || group.name == RESERVED_GROUP_EXHAUSTED {
            return Err(StoreError::ReservedGroup(group.name.clone()));
        }
        let _guard = self.write_lock.lock().await;
        let active = groups::ActiveModel {
            name: ActiveValue::Set(group.name.clone()),
            display_name: ActiveValue::Set(group.display_name.clone()),
            priority: ActiveValue::Set(group.priority),
            rate_limit_qps: ActiveValue::Set(group.rate_limit_qps),
            rate_limit_burst: ActiveValue::Set(group.rate_limit_burst),
            cooldown_sec: ActiveValue::Set(group.cooldown_sec),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        active.insert(&self.db).await.map_err(map_insert_err)?;
        Ok(())
    }

    /// Insert without the reserved-name check, for the system-managed rows.
    pub async fn ensure_group(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let active = groups::ActiveModel {
            name: ActiveValue::Set(name.to_string()),
            display_name: ActiveValue::Set(None),
            priority: ActiveValue::Set(0),
            rate_limit_qps: ActiveValue::Set(0.0),
            rate_limit_burst: ActiveValue::Set(0),
            cooldown_sec: ActiveValue::Set(0),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        entities::Groups::insert(active)
            .on_conflict(
                OnConflict::column(groups::Column::Name)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    pub async fn update_group(&self, group: &GroupRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let active = groups::ActiveModel {
            name: ActiveValue::Unchanged(group.name.clone()),
            display_name: ActiveValue::Set(group.display_name.clone()),
            priority: ActiveValue::Set(group.priority),
            rate_limit_qps: ActiveValue::Set(group.rate_limit_qps),
            rate_limit_burst: ActiveValue::Set(group.rate_limit_burst),
            cooldown_sec: ActiveValue::Set(group.cooldown_sec),
            ..Default::default()
        };
        active.update(&self.db).await?;
        Ok(())
    }

    /// Atomically rename a group and repoint every member credential.
    pub async fn rename_group(&self, old: &str, new: &str) -> Result<(), StoreError> {
        if old == DEFAULT_GROUP {
            return Err(StoreError::ReservedGroup(old.to_string()));
        }
        if new == RESERVED_GROUP_BANNED || new == RESERVED_GROUP_EXHAUSTED {
            return Err(StoreError::ReservedGroup(new.to_string()));
        }
        let _guard = self.write_lock.lock().await;
        let txn = self.db.begin().await?;
        entities::Groups::update_many()
            .col_expr(groups::Column::Name, sea_orm::sea_query::Expr::value(new))
            .filter(groups::Column::Name.eq(old))
            .exec(&txn)
            .await?;
        entities::Tokens::update_many()
            .col_expr(tokens::Column::GroupName, sea_orm::sea_query::Expr::value(new))
            .col_expr(
                tokens::Column::UpdatedAt,
                sea_orm::sea_query::Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(tokens::Column::GroupName.eq(old))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    pub async fn delete_group(&self, name: &str) -> Result<(), StoreError> {
        if name == DEFAULT_GROUP
            || name == RESERVED_GROUP_BANNED
            || name == RESERVED_GROUP_EXHAUSTED
        {
            return Err(StoreError::ReservedGroup(name.to_string()));
        }
        let _guard = self.write_lock.lock().await;
        entities::Groups::delete_by_id(name).exec(&self.db).await?;
        Ok(())
    }

    pub async fn group_stats(&self) -> Result<Vec<GroupStat>, StoreError> {
        let stmt = Statement::from_string(
            self.db.get_database_backend(),
            "SELECT group_name, COUNT(*) AS total, \
             SUM(CASE WHEN disabled = 0 AND status = '' THEN 1 ELSE 0 END) AS active \
             FROM tokens GROUP BY group_name",
        );
        Ok(GroupStat::find_by_statement(stmt).all(&self.db).await?)
    }

    // ----- api keys -----

    pub async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let rows = entities::ApiKeys::find().all(&self.db).await?;
        Ok(rows
            .into_iter()
            .map(|row| ApiKeyRecord {
                allowed_groups: serde_json::from_str(&row.allowed_groups).unwrap_or_default(),
                key: row.key,
                name: row.name,
            })
            .collect())
    }

    pub async fn save_api_key(&self, record: &ApiKeyRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let allowed = serde_json::to_string(&record.allowed_groups)
            .unwrap_or_else(|_| "[]".to_string());
        let active = api_keys::ActiveModel {
            key: ActiveValue::Set(record.key.clone()),
            name: ActiveValue::Set(record.name.clone()),
            allowed_groups: ActiveValue::Set(allowed),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        entities::ApiKeys::insert(active)
            .on_conflict(
                OnConflict::column(api_keys::Column::Key)
                    .update_columns([api_keys::Column::Name, api_keys::Column::AllowedGroups])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_api_key(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        entities::ApiKeys::delete_by_id(key).exec(&self.db).await?;
        Ok(())
    }

    // ----- settings -----

    pub async fn load_settings_json(&self) -> Result<Option<String>, StoreError> {
        Ok(entities::SettingsRows::find_by_id(SETTINGS_KEY)
            .one(&self.db)
            .await?
            .map(|row| row.value))
    }

    pub async fn save_settings_json(&self, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let active = settings::ActiveModel {
            key: ActiveValue::Set(SETTINGS_KEY.to_string()),
            value: ActiveValue::Set(value.to_string()),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        entities::SettingsRows::insert(active)
            .on_conflict(
                OnConflict::column(settings::Column::Key)
                    .update_columns([settings::Column::Value, settings::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}
