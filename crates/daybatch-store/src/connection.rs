//! Database connection and schema bootstrap.

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Schema,
    Statement,
};
use std::time::Duration;
use tracing::info;

use crate::entity;
use crate::error::StoreResult;

/// Connect, enable WAL on SQLite, and create missing tables and indexes.
pub async fn establish_connection(db_url: &str) -> StoreResult<DatabaseConnection> {
    let mut opt = ConnectOptions::new(db_url.to_owned());
    // An in-memory database lives and dies with its connection; the pool
    // must not fan out across several of them.
    let pool_size = if db_url.contains(":memory:") { 1 } else { 10 };
    opt.max_connections(pool_size)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;

    if db.get_database_backend() == DatabaseBackend::Sqlite {
        db.execute(Statement::from_string(
            DatabaseBackend::Sqlite,
            "PRAGMA journal_mode=WAL;".to_string(),
        ))
        .await?;
        db.execute(Statement::from_string(
            DatabaseBackend::Sqlite,
            "PRAGMA foreign_keys=ON;".to_string(),
        ))
        .await?;
    }

    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    macro_rules! ensure_table {
        ($entity:path) => {
            let stmt = builder.build(schema.create_table_from_entity($entity).if_not_exists());
            db.execute(stmt).await?;
        };
    }

    ensure_table!(entity::batch_job::Entity);
    ensure_table!(entity::batch_item::Entity);
    ensure_table!(entity::order::Entity);
    ensure_table!(entity::fill::Entity);
    ensure_table!(entity::oco_group::Entity);
    ensure_table!(entity::position_snapshot::Entity);
    ensure_table!(entity::scheduler_run::Entity);
    ensure_table!(entity::event_log::Entity);
    ensure_table!(entity::audit_log::Entity);

    // Correctness-critical indexes: duplicate broker ids and batch codes
    // must fail at the store, and the scheduler scan stays cheap.
    for ddl in [
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_broker_order_id ON orders(broker_order_id);",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_batch_jobs_batch_code ON batch_jobs(batch_code);",
        "CREATE INDEX IF NOT EXISTS idx_batch_jobs_status_scheduled_at ON batch_jobs(status, scheduled_at);",
        "CREATE INDEX IF NOT EXISTS idx_oco_groups_item_status ON oco_groups(batch_item_id, status);",
        "CREATE INDEX IF NOT EXISTS idx_batch_items_job_status ON batch_items(batch_job_id, status);",
        "CREATE INDEX IF NOT EXISTS idx_fills_order_id ON fills(order_id);",
    ] {
        db.execute(Statement::from_string(builder, ddl.to_string()))
            .await?;
    }

    info!(db_url, "Database ready (WAL, schema and indexes ensured)");

    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_in_memory() {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        // Bootstrapping twice is a no-op.
        drop(db);
        let db = establish_connection("sqlite::memory:").await.unwrap();
        let rows = db
            .query_all(Statement::from_string(
                DatabaseBackend::Sqlite,
                "SELECT name FROM sqlite_master WHERE type='table';".to_string(),
            ))
            .await
            .unwrap();
        let names: Vec<String> = rows
            .iter()
            .filter_map(|r| r.try_get::<String>("", "name").ok())
            .collect();
        for table in [
            "batch_jobs",
            "batch_items",
            "orders",
            "fills",
            "oco_groups",
            "position_snapshots",
            "scheduler_runs",
            "event_logs",
            "audit_logs",
        ] {
            assert!(names.iter().any(|n| n == table), "missing table {table}");
        }
    }
}
