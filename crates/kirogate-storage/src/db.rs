use std::path::Path;
use std::time::Duration;

use sea_orm::sea_query::{Index, SqliteQueryBuilder, TableCreateStatement};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr,
    EntityTrait, Schema,
};

use crate::entities;

#[derive(Debug, thiserror::Error)]
pub enum SqliteConnectError {
    #[error("create database directory: {0}")]
    CreateDir(#[from] std::io::Error),
    #[error(transparent)]
    Db(#[from] DbErr),
}

/// Open (creating if missing) one of the two SQLite stores and bring its
/// schema up to date. WAL gives one writer plus unbounded readers; the pool
/// stays small because the writer is additionally serialized in-process.
pub async fn connect_sqlite(path: &Path, log_db: bool) -> Result<DatabaseConnection, SqliteConnectError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let dsn = format!("sqlite://{}?mode=rwc", path.display());
    let mut options = ConnectOptions::new(dsn);
    options
        .max_connections(5)
        .min_connections(2)
        .max_lifetime(Duration::from_secs(3600))
        .sqlx_logging(false);
    let db = Database::connect(options).await?;

    db.execute_unprepared("PRAGMA journal_mode = WAL").await?;
    db.execute_unprepared("PRAGMA busy_timeout = 5000").await?;
    db.execute_unprepared("PRAGMA foreign_keys = ON").await?;

    if log_db {
        sync_log_schema(&db).await?;
    } else {
        sync_token_schema(&db).await?;
    }
    Ok(db)
}

/// In-memory store for tests.
pub async fn connect_memory(log_db: bool) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect("sqlite::memory:").await?;
    if log_db {
        sync_log_schema(&db).await?;
    } else {
        sync_token_schema(&db).await?;
    }
    Ok(db)
}

async fn sync_token_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table(db, entities::Tokens).await?;
    create_table(db, entities::Groups).await?;
    create_table(db, entities::ApiKeys).await?;
    create_table(db, entities::SettingsRows).await?;

    use entities::tokens::Column;
    let indexes = [
        ("idx_tokens_group", Column::GroupName),
        ("idx_tokens_status", Column::Status),
        ("idx_tokens_disabled", Column::Disabled),
        ("idx_tokens_last_verified", Column::LastVerifiedAt),
    ];
    for (name, column) in indexes {
        let stmt = Index::create()
            .name(name)
            .table(entities::Tokens)
            .col(column)
            .if_not_exists()
            .to_owned();
        let sql = stmt.to_string(SqliteQueryBuilder);
        db.execute_unprepared(&sql).await?;
    }
    Ok(())
}

async fn sync_log_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table(db, entities::RequestLogs).await?;

    use entities::request_logs::Column;
    let indexes = [
        ("idx_logs_timestamp", Column::Timestamp),
        ("idx_logs_model", Column::Model),
        ("idx_logs_group", Column::GroupName),
        ("idx_logs_request_id", Column::RequestId),
    ];
    for (name, column) in indexes {
        let stmt = Index::create()
            .name(name)
            .table(entities::RequestLogs)
            .col(column)
            .if_not_exists()
            .to_owned();
        let sql = stmt.to_string(SqliteQueryBuilder);
        db.execute_unprepared(&sql).await?;
    }
    Ok(())
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), DbErr> {
    let schema = Schema::new(DatabaseBackend::Sqlite);
    let mut stmt: TableCreateStatement = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    let sql = stmt.to_string(SqliteQueryBuilder);
    db.execute_unprepared(&sql).await?;
    Ok(())
}
