//! Connection pool and catalog helpers

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgExecutor;
use std::collections::HashSet;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::query::Statement;

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Whether `table_name` exists in the connection's current schema
pub async fn table_exists<'e, E>(executor: E, table_name: &str) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM information_schema.tables
            WHERE table_schema = current_schema()
              AND table_name = $1
        )
        "#,
    )
    .bind(table_name.to_ascii_lowercase())
    .fetch_one(executor)
    .await
}

/// Lowercased column names of a table in the current schema
pub async fn live_columns<'e, E>(executor: E, table_name: &str) -> Result<HashSet<String>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let names = sqlx::query_scalar::<_, String>(
        r#"
        SELECT CAST(column_name AS TEXT)
        FROM information_schema.columns
        WHERE table_schema = current_schema()
          AND table_name = $1
        "#,
    )
    .bind(table_name.to_ascii_lowercase())
    .fetch_all(executor)
    .await?;

    Ok(names.into_iter().map(|n| n.to_ascii_lowercase()).collect())
}

/// Run a generated statement with its text binds; returns rows affected
pub async fn execute<'e, E>(executor: E, statement: &Statement) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let mut query = sqlx::query(&statement.sql);
    for value in &statement.binds {
        query = query.bind(value.as_str());
    }
    let result = query.execute(executor).await?;
    Ok(result.rows_affected())
}

/// Run a `(entity TEXT, partitions BIGINT)` count query
pub async fn fetch_partition_counts<'e, E>(
    executor: E,
    statement: &Statement,
) -> Result<Vec<(String, i64)>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let mut query = sqlx::query_as::<_, (String, i64)>(&statement.sql);
    for value in &statement.binds {
        query = query.bind(value.as_str());
    }
    query.fetch_all(executor).await
}
