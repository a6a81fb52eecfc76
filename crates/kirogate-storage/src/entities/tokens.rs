use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One upstream credential. `refresh_token` is globally unique; a violated
/// insert is reported as "already exists", not a server error.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub auth_type: String,
    #[sea_orm(unique)]
    pub refresh_token: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub disabled: bool,
    pub group_name: String,
    pub name: Option<String>,
    /// Empty string = active; "exhausted" / "banned" are quarantine states.
    pub status: String,

    pub user_email: Option<String>,
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<OffsetDateTime>,
    pub available_usage: f64,
    pub base_usage: f64,
    pub free_trial_usage: f64,
    pub total_limit: f64,
    pub current_usage: f64,
    pub last_verified_at: Option<OffsetDateTime>,
    pub last_used_at: Option<OffsetDateTime>,
    pub error_msg: Option<String>,

    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
