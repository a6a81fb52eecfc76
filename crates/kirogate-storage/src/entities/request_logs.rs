use sea_orm::entity::prelude::*;
use serde::Serialize;
use time::OffsetDateTime;

/// Append-only accounting row. Lives in its own database file so log growth
/// never contends with credential writes.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: String,
    pub timestamp: OffsetDateTime,
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
    pub actual_input_tokens: i64,
    pub calculated_output_tokens: i64,
    pub estimated_input_tokens: i64,
    pub estimated_output_tokens: i64,
    pub cache_hit: bool,
    pub token_id: i64,
    pub conversation_id: Option<String>,
    pub group_name: String,
    pub error: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
