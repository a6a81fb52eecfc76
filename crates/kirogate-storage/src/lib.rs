pub mod entities;

mod db;
mod log_store;
mod migrate;
mod token_store;

pub use db::{connect_memory, connect_sqlite, SqliteConnectError};
pub use log_store::{LogQuerySummary, LogStore, RequestLogRecord, TokenCounters};
pub use migrate::{migrate_legacy_json, MigrateReport};
pub use token_store::{
    ApiKeyRecord, BulkInsertReport, GroupRecord, GroupStat, NewToken, StoreError, TokenRecord,
    TokenStatus, TokenStore, TokenUpdate,
};
