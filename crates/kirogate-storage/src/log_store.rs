use sea_orm::{
    ActiveValue, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, FromQueryResult,
    QueryFilter, QueryOrder, QuerySelect, Statement,
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::entities::{self, request_logs};
use crate::token_store::StoreError;

/// One accounting record as produced by the request pipeline. Derived
/// columns (actual/calculated tokens, cache-hit) are computed on insert.
#[derive(Debug, Clone, Default)]
pub struct RequestLogRecord {
    pub request_id: String,
    pub timestamp: Option<OffsetDateTime>,
    pub method: String,
    pub path: String,
    pub request_type: Option<String>,
    pub model: Option<String>,
    pub stream: bool,
    pub status_code: i32,
    pub latency_ms: i64,
    pub ttfb_ms: i64,
    pub credit_usage: f64,
    pub context_usage_percent: f64,
    pub estimated_input_tokens: i64,
    pub estimated_output_tokens: i64,
    pub token_id: i64,
    pub conversation_id: Option<String>,
    pub group_name: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, FromQueryResult)]
pub struct LogQuerySummary {
    pub total_requests: i64,
    pub success_requests: i64,
    pub failed_requests: i64,
    pub avg_latency_ms: Option<f64>,
    pub total_credit: Option<f64>,
}

#[derive(Debug, Clone, FromQueryResult)]
pub struct TokenCounters {
    pub token_id: i64,
    pub request_count: i64,
    pub failure_count: i64,
    pub total_latency_ms: i64,
}

#[derive(Clone)]
pub struct LogStore {
    db: DatabaseConnection,
}

impl LogStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn insert(&self, record: RequestLogRecord) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();

        // Context usage is a percentage of the 200k window.
        let actual_input_tokens = (record.context_usage_percent / 100.0 * 200_000.0) as i64;
        // Back out output tokens from metered credit:
        // credit = (input * 3 + output * 15) / 1e6.
        let mut calculated_output_tokens = 0i64;
        let mut cache_hit = false;
        if record.credit_usage > 0.0 && actual_input_tokens > 0 {
            calculated_output_tokens = ((record.credit_usage * 1_000_000.0
                - actual_input_tokens as f64 * 3.0)
                / 15.0) as i64;
            if calculated_output_tokens < 0 {
                // Cheaper than uncached input alone: prompt cache served it.
                calculated_output_tokens = 0;
            }
            let expected_credit = actual_input_tokens as f64 * 3.0 / 1_000_000.0
                + record.estimated_output_tokens as f64 * 15.0 / 1_000_000.0;
            if record.credit_usage < expected_credit * 0.6 {
                cache_hit = true;
            }
        }

        let active = request_logs::ActiveModel {
            request_id: ActiveValue::Set(record.request_id),
            timestamp: ActiveValue::Set(record.timestamp.unwrap_or(now)),
            method: ActiveValue::Set(record.method),
            path: ActiveValue::Set(record.path),
            request_type: ActiveValue::Set(record.request_type),
            model: ActiveValue::Set(record.model),
            stream: ActiveValue::Set(record.stream),
            status_code: ActiveValue::Set(record.status_code),
            latency_ms: ActiveValue::Set(record.latency_ms),
            ttfb_ms: ActiveValue::Set(record.ttfb_ms),
            credit_usage: ActiveValue::Set(record.credit_usage),
            context_usage_percent: ActiveValue::Set(record.context_usage_percent),
            actual_input_tokens: ActiveValue::Set(actual_input_tokens),
            calculated_output_tokens: ActiveValue::Set(calculated_output_tokens),
            estimated_input_tokens: ActiveValue::Set(record.estimated_input_tokens),
            estimated_output_tokens: ActiveValue::Set(record.estimated_output_tokens),
            cache_hit: ActiveValue::Set(cache_hit),
            token_id: ActiveValue::Set(record.token_id),
            conversation_id: ActiveValue::Set(record.conversation_id),
            group_name: ActiveValue::Set(record.group_name),
            error: ActiveValue::Set(record.error),
            created_at: ActiveValue::Set(now),
            ..Default::default()
        };
        entities::RequestLogs::insert(active)
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    pub async fn recent(&self, limit: u64) -> Result<Vec<request_logs::Model>, StoreError> {
        Ok(entities::RequestLogs::find()
            .order_by_desc(request_logs::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn recent_for_group(
        &self,
        group: &str,
        limit: u64,
    ) -> Result<Vec<request_logs::Model>, StoreError> {
        Ok(entities::RequestLogs::find()
            .filter(request_logs::Column::GroupName.eq(group))
            .order_by_desc(request_logs::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn summary(&self) -> Result<LogQuerySummary, StoreError> {
        let stmt = Statement::from_string(
            self.db.get_database_backend(),
            "SELECT COUNT(*) AS total_requests, \
             COALESCE(SUM(CASE WHEN status_code < 400 THEN 1 ELSE 0 END), 0) AS success_requests, \
             COALESCE(SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END), 0) AS failed_requests, \
             AVG(latency_ms) AS avg_latency_ms, \
             SUM(credit_usage) AS total_credit \
             FROM request_logs",
        );
        Ok(LogQuerySummary::find_by_statement(stmt)
            .one(&self.db)
            .await?
            .unwrap_or_default())
    }

    /// Per-token counters for restoring pool metrics at boot.
    pub async fn token_counters(&self) -> Result<Vec<TokenCounters>, StoreError> {
        let stmt = Statement::from_string(
            self.db.get_database_backend(),
            "SELECT token_id, COUNT(*) AS request_count, \
             SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END) AS failure_count, \
             COALESCE(SUM(latency_ms), 0) AS total_latency_ms \
             FROM request_logs WHERE token_id > 0 GROUP BY token_id",
        );
        Ok(TokenCounters::find_by_statement(stmt).all(&self.db).await?)
    }
}
