use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Tenancy partition. Zero-valued settings fall through to the globals.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "groups")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub name: String,
    pub display_name: Option<String>,
    pub priority: i32,
    pub rate_limit_qps: f64,
    pub rate_limit_burst: i32,
    pub cooldown_sec: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
