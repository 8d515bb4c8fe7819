//! Optimistic concurrency for updates and relation changes
//!
//! Writes are conditional on `id` and, when the caller supplies one, the
//! version it last read. A write that touches no row is a conflict, and so
//! is a write SQLite refuses because another connection committed first
//! (`SQLITE_BUSY_SNAPSHOT` and friends). The guard then decides after the
//! failed transaction rolled back whether the row was deleted (`NotFound`)
//! or changed (`ConcurrencyConflict`).

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::error::{
    RepositoryError, RepositoryErrorKind, RepositoryOperation, RepositoryResult, SqlResultExt,
};
use super::schema::EntitySchema;

/// Conflict detection and classification for one entity
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyGuard {
    schema: &'static EntitySchema,
}

impl ConcurrencyGuard {
    /// Guard for rows of `schema`
    pub fn new(schema: &'static EntitySchema) -> Self {
        Self { schema }
    }

    /// Append ` WHERE id = ? [AND version = ?]`
    pub(crate) fn push_condition<'a>(
        &self,
        builder: &mut QueryBuilder<'a, Sqlite>,
        id: &'a str,
        expected_version: Option<i64>,
    ) {
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        if let Some(version) = expected_version {
            builder.push(" AND version = ");
            builder.push_bind(version);
        }
    }

    /// Turn zero affected rows into a conflict
    pub(crate) fn check_written(
        &self,
        rows_affected: u64,
        id: &str,
        operation: RepositoryOperation,
    ) -> RepositoryResult<()> {
        if rows_affected == 0 {
            return Err(RepositoryError::concurrency_conflict(
                operation,
                self.schema.name,
                id,
            ));
        }
        Ok(())
    }

    /// Increment the row's version, conditional on `expected_version`
    pub async fn bump(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        expected_version: Option<i64>,
        operation: RepositoryOperation,
    ) -> RepositoryResult<()> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {} SET version = version + 1",
            self.schema.table
        ));
        self.push_condition(&mut builder, id, expected_version);
        let result = builder.build().execute(&mut *conn).await.during(operation)?;
        self.check_written(result.rows_affected(), id, operation)
    }

    /// Classify the result of a guarded write
    ///
    /// Must run on the connection the write used, after its transaction
    /// has rolled back. Conflicts on a row that no longer exists become
    /// `NotFound`; other results pass through.
    pub async fn classify<T>(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        result: RepositoryResult<T>,
    ) -> RepositoryResult<T> {
        let err = match result {
            Err(err) if err.kind == RepositoryErrorKind::ConcurrencyConflict => err,
            other => return other,
        };

        let sql = format!("SELECT 1 FROM {} WHERE id = ?", self.schema.table);
        let present: Option<i64> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .during(err.operation)?;

        match present {
            None => Err(RepositoryError::not_found(self.schema.name, id).with_operation(err.operation)),
            Some(_) => {
                tracing::warn!(
                    entity = self.schema.name,
                    id,
                    operation = %err.operation,
                    "concurrent modification detected"
                );
                Err(err.with_entity(self.schema.name, id))
            }
        }
    }
}
