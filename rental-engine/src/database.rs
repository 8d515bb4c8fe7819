//! Database connection pool management and schema bootstrap

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Acquire, Executor, Sqlite, SqlitePool};

use crate::config::DatabaseConfig;
use crate::error::{sanitize_url, DatabaseError, DatabaseErrorKind, DatabaseOperation, Error, Result};
use crate::repository::EntitySchema;

/// Create a SQLite connection pool with retry logic
///
/// Retries according to `max_retries`/`retry_delay_secs`, then creates the
/// catalog tables when `create_schema` is set.
pub async fn create_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let pool = create_pool_with_retries(config, config.max_retries).await?;
    if config.create_schema {
        ensure_schema(&pool, &crate::entities::catalog()).await?;
    }
    Ok(pool)
}

/// Create a SQLite connection pool with configurable retries
///
/// Uses exponential backoff strategy for retries
async fn create_pool_with_retries(config: &DatabaseConfig, max_retries: u32) -> Result<SqlitePool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Database connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Database connection pool created: max={}, min={}",
                        config.max_connections,
                        config.min_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > max_retries {
                    tracing::error!(
                        "Failed to connect to database after {} attempts: {}",
                        max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay_multiplier = 2_u32.pow(attempt.saturating_sub(1));
                let delay = base_delay * delay_multiplier;

                tracing::warn!(
                    "Database connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Attempt to create a database pool (single try)
async fn try_create_pool(config: &DatabaseConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| {
            Error::Database(
                DatabaseError::new(
                    DatabaseOperation::Connect,
                    DatabaseErrorKind::Configuration,
                    e.to_string(),
                )
                .add_context(sanitize_url(&config.url)),
            )
        })?
        .create_if_missing(true)
        .foreign_keys(true);

    let mut pool_options = SqlitePoolOptions::new()
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs));

    // Every connection to ":memory:" is a separate database
    if is_in_memory(&config.url) {
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        pool_options = pool_options.max_connections(config.max_connections);
    }

    let pool = pool_options.connect_with(options).await.map_err(|e| {
        Error::Internal(format!(
            "Failed to open database at '{}': {}\n\n\
            Troubleshooting:\n\
            1. Check connection URL format: sqlite://path/to/rentals.db or sqlite::memory:\n\
            2. Verify the directory exists and is writable\n\
            3. Check that no other process holds an exclusive lock on the file\n\
            4. Raise connection_timeout_secs ({}) if the file is busy\n\n\
            Original error: {}",
            sanitize_url(&config.url),
            categorize_db_error(&e),
            config.connection_timeout_secs,
            e
        ))
    })?;

    Ok(pool)
}

/// Categorize database error for better user guidance
fn categorize_db_error(err: &sqlx::Error) -> &'static str {
    use sqlx::Error;
    match err {
        Error::Configuration(_) => "Configuration error",
        Error::Database(_) => "Database error - check file permissions and locks",
        Error::Io(_) => "I/O error - check the path and disk",
        Error::PoolTimedOut => "Connection pool timeout - database may be busy",
        Error::PoolClosed => "Connection pool closed",
        Error::WorkerCrashed => "Database worker crashed",
        _ => "Connection error",
    }
}

/// Create the tables (and join tables) of `schemas` if they do not exist
///
/// Intended for development and tests; production migrations are managed
/// outside this crate. Accepts a pool, a connection or a transaction.
pub async fn ensure_schema<'c, A>(conn: A, schemas: &[&'static EntitySchema]) -> Result<()>
where
    A: Acquire<'c, Database = Sqlite>,
{
    let mut conn = conn.acquire().await?;
    for schema in schemas {
        for statement in schema.create_table_sql() {
            conn.execute(statement.as_str()).await.map_err(|e| {
                let mut err = DatabaseError::from(e).add_context(schema.table);
                err.operation = DatabaseOperation::Schema;
                Error::Database(err)
            })?;
        }
        tracing::debug!(table = schema.table, "schema ensured");
    }
    Ok(())
}
