//! SQLite-backed repository for any entity schema
//!
//! [`EntityRepository`] is a `Copy` handle over `&'static EntitySchema`.
//! Reads run directly on the given connection. Writes open a transaction
//! (a savepoint when the caller already holds one), go through the
//! [`ConcurrencyGuard`], and hand to-many changes to the
//! [`RelationReconciler`].

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use sqlx::{Connection, QueryBuilder, Sqlite, SqliteConnection};

use super::error::{RepositoryError, RepositoryOperation, RepositoryResult, SqlResultExt};
use super::filter::WhereExpression;
use super::guard::ConcurrencyGuard;
use super::query::{CompiledQuery, FindManyArgs, Meta};
use super::record::{CreateInput, Patch, Record};
use super::relation::{ReconcileOutcome, RelationOp, RelationReconciler};
use super::schema::{EntitySchema, Generated, RelationDef, RelationKind};
use super::traits::{RelationRepository, Repository};
use super::value::Value;
use crate::ids::EntityId;

/// Repository for one entity, driven by its schema
///
/// # Example
///
/// ```rust,no_run
/// use rental_engine::entities;
/// use rental_engine::repository::{CreateInput, EntityRepository, Patch, Repository};
///
/// # async fn example(conn: &mut sqlx::SqliteConnection) -> rental_engine::repository::RepositoryResult<()> {
/// let bikes = EntityRepository::new(entities::bike::schema());
///
/// let bike = bikes
///     .create(conn, CreateInput::new().value("model", "Brompton").value("status", "Available"))
///     .await?;
///
/// let rented = bikes
///     .update(conn, bike.id(), Patch::new().value("status", "Rented").expect_version(bike.version()))
///     .await?;
/// assert_eq!(rented.version(), bike.version() + 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct EntityRepository {
    schema: &'static EntitySchema,
}

impl EntityRepository {
    /// Repository for rows of `schema`
    #[must_use]
    pub fn new(schema: &'static EntitySchema) -> Self {
        Self { schema }
    }

    /// Schema this repository serves
    pub fn schema(&self) -> &'static EntitySchema {
        self.schema
    }

    fn guard(&self) -> ConcurrencyGuard {
        ConcurrencyGuard::new(self.schema)
    }

    /// Fetch one entity with every to-many relation loaded
    ///
    /// # Errors
    ///
    /// `NotFound` if no row has `id`.
    #[tracing::instrument(skip(self, conn), fields(entity = self.schema.name))]
    pub async fn get(&self, conn: &mut SqliteConnection, id: &str) -> RepositoryResult<Record> {
        let mut record = self
            .find_by_id(conn, id)
            .await?
            .ok_or_else(|| RepositoryError::not_found(self.schema.name, id))?;
        let relations: Vec<&'static RelationDef> = self.schema.to_many_relations().collect();
        self.load_includes(
            conn,
            std::slice::from_mut(&mut record),
            &relations,
        )
        .await?;
        Ok(record)
    }

    /// Pagination metadata for `filter`
    pub async fn meta(
        &self,
        conn: &mut SqliteConnection,
        filter: &WhereExpression,
    ) -> RepositoryResult<Meta> {
        Ok(Meta {
            count: self.count(conn, filter).await?,
        })
    }

    async fn fetch(
        &self,
        conn: &mut SqliteConnection,
        query: &CompiledQuery,
        operation: RepositoryOperation,
    ) -> RepositoryResult<Vec<Record>> {
        let mut builder = query.select();
        let rows = builder
            .build()
            .fetch_all(&mut *conn)
            .await
            .during(operation)?;
        let mut records = rows
            .iter()
            .map(|row| Record::from_row(self.schema, row))
            .collect::<Result<Vec<_>, _>>()
            .during(operation)?;
        self.load_includes(conn, &mut records, query.include())
            .await?;
        Ok(records)
    }

    async fn load_includes(
        &self,
        conn: &mut SqliteConnection,
        records: &mut [Record],
        relations: &[&'static RelationDef],
    ) -> RepositoryResult<()> {
        if records.is_empty() || relations.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = records.iter().map(|r| r.id().to_string()).collect();
        for relation in relations {
            let mut links = self.batch_load(conn, &ids, relation.name).await?;
            for record in records.iter_mut() {
                let members = links.remove(record.id()).unwrap_or_default();
                record.set_links(relation.name, members);
            }
        }
        Ok(())
    }

    /// Check that every non-null to-one target exists and map relation
    /// names to their foreign key columns
    async fn resolve_references(
        &self,
        conn: &mut SqliteConnection,
        references: &BTreeMap<String, Option<String>>,
        operation: RepositoryOperation,
    ) -> RepositoryResult<Vec<(&'static str, Option<String>)>> {
        let mut resolved = Vec::with_capacity(references.len());
        for (name, target_id) in references {
            let relation = self.schema.relation(name);
            let (relation, column) = match relation.map(|r| (r, r.kind)) {
                Some((relation, RelationKind::ToOne { column })) => (relation, column),
                _ => {
                    return Err(RepositoryError::validation_failed(format!(
                        "{}: '{}' is not a to-one relation",
                        self.schema.name, name
                    ))
                    .with_operation(operation))
                }
            };
            if let Some(target_id) = target_id {
                let target = EntityRepository::new(relation.target_schema());
                let found = target
                    .exists(conn, target_id)
                    .await
                    .map_err(|e| e.with_operation(operation))?;
                if !found {
                    return Err(RepositoryError::related_not_found(
                        operation,
                        target.schema.name,
                        target_id.as_str(),
                    ));
                }
            }
            resolved.push((column, target_id.clone()));
        }
        Ok(resolved)
    }

    async fn insert(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        data: &CreateInput,
    ) -> RepositoryResult<()> {
        let operation = RepositoryOperation::Create;
        let references = self
            .resolve_references(conn, &data.references, operation)
            .await?;

        let now = Value::Timestamp(Utc::now());
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO {} (id, version",
            self.schema.table
        ));
        for field in self.schema.fields {
            builder.push(format!(", {}", field.column));
        }
        for (column, _) in &references {
            builder.push(format!(", {}", column));
        }
        builder.push(") VALUES (");
        builder.push_bind(id.to_string());
        builder.push(", 1");
        for field in self.schema.fields {
            builder.push(", ");
            match (data.values.get(field.name), field.generated) {
                (Some(value), _) => value.push_bind(&mut builder),
                (None, Some(_)) => now.push_bind(&mut builder),
                (None, None) => Value::Null.push_bind(&mut builder),
            }
        }
        for (_, target_id) in references {
            builder.push(", ");
            builder.push_bind(target_id);
        }
        builder.push(")");
        builder
            .build()
            .execute(&mut *conn)
            .await
            .during(operation)
            .map_err(|e| e.with_entity(self.schema.name, id))?;

        for (name, ids) in &data.links {
            RelationReconciler::new(self.schema, name, operation)?
                .apply(conn, id, &RelationOp::Connect(ids.clone()))
                .await
                .map_err(|e| e.with_operation(operation))?;
        }
        Ok(())
    }

    /// Write a patch in one transaction; rolled back on any error
    async fn write_patch(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        patch: &Patch,
    ) -> RepositoryResult<()> {
        let operation = RepositoryOperation::Update;
        let guard = self.guard();
        let mut tx = conn.begin().await.during(operation)?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {} SET version = version + 1",
            self.schema.table
        ));
        for (name, value) in &patch.values {
            let field = self.schema.field(name).ok_or_else(|| {
                RepositoryError::validation_failed(format!(
                    "{}: unknown field '{}'",
                    self.schema.name, name
                ))
                .with_operation(operation)
            })?;
            builder.push(format!(", {} = ", field.column));
            value.push_bind(&mut builder);
        }
        let now = Value::Timestamp(Utc::now());
        for field in self.schema.fields {
            if field.generated == Some(Generated::UpdatedAt) && !patch.values.contains_key(field.name) {
                builder.push(format!(", {} = ", field.column));
                now.push_bind(&mut builder);
            }
        }
        guard.push_condition(&mut builder, id, patch.expected_version);
        let written = builder
            .build()
            .execute(&mut *tx)
            .await
            .during(operation)?;
        guard.check_written(written.rows_affected(), id, operation)?;

        let references = self
            .resolve_references(&mut *tx, &patch.references, operation)
            .await?;
        if !references.is_empty() {
            let mut builder = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET ", self.schema.table));
            let mut assignments = builder.separated(", ");
            for (column, target_id) in references {
                assignments.push(format!("{} = ", column));
                assignments.push_bind_unseparated(target_id);
            }
            builder.push(" WHERE id = ");
            builder.push_bind(id);
            builder
                .build()
                .execute(&mut *tx)
                .await
                .during(operation)?;
        }

        for (name, relation_op) in &patch.relations {
            RelationReconciler::new(self.schema, name, operation)?
                .apply(&mut *tx, id, relation_op)
                .await
                .map_err(|e| e.with_operation(operation))?;
        }

        tx.commit().await.during(operation)?;
        Ok(())
    }

    async fn reconcile(
        &self,
        conn: &mut SqliteConnection,
        parent_id: &str,
        relation: &str,
        op: RelationOp,
    ) -> RepositoryResult<ReconcileOutcome> {
        let operation = op.operation();
        let reconciler = RelationReconciler::new(self.schema, relation, operation)?;
        let result = self
            .reconcile_in_transaction(conn, &reconciler, parent_id, &op)
            .await;
        self.guard().classify(conn, parent_id, result).await
    }

    async fn reconcile_in_transaction(
        &self,
        conn: &mut SqliteConnection,
        reconciler: &RelationReconciler,
        parent_id: &str,
        op: &RelationOp,
    ) -> RepositoryResult<ReconcileOutcome> {
        let operation = op.operation();
        let mut tx = conn.begin().await.during(operation)?;

        let sql = format!("SELECT version FROM {} WHERE id = ?", self.schema.table);
        let version: i64 = sqlx::query_scalar(&sql)
            .bind(parent_id)
            .fetch_optional(&mut *tx)
            .await
            .during(operation)?
            .ok_or_else(|| {
                RepositoryError::not_found(self.schema.name, parent_id).with_operation(operation)
            })?;

        let outcome = reconciler.apply(&mut *tx, parent_id, op).await?;
        if !outcome.is_noop() {
            self.guard()
                .bump(&mut *tx, parent_id, Some(version), operation)
                .await?;
        }

        tx.commit().await.during(operation)?;
        Ok(outcome)
    }
}

impl Repository<str, Record, CreateInput, Patch> for EntityRepository {
    type Connection = SqliteConnection;

    async fn find_by_id(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
    ) -> RepositoryResult<Option<Record>> {
        let operation = RepositoryOperation::FindById;
        let sql = format!("SELECT t.* FROM {} AS t WHERE t.id = ?", self.schema.table);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .during(operation)?;
        row.map(|row| Record::from_row(self.schema, &row))
            .transpose()
            .during(operation)
    }

    #[tracing::instrument(skip(self, conn, args), fields(entity = self.schema.name))]
    async fn find_many(
        &self,
        conn: &mut SqliteConnection,
        args: &FindManyArgs,
    ) -> RepositoryResult<Vec<Record>> {
        let query = args.compile(self.schema)?;
        let records = self.fetch(conn, &query, RepositoryOperation::FindMany).await?;
        tracing::debug!(rows = records.len(), "find_many complete");
        Ok(records)
    }

    async fn count(
        &self,
        conn: &mut SqliteConnection,
        filter: &WhereExpression,
    ) -> RepositoryResult<u64> {
        let operation = RepositoryOperation::Count;
        let query = FindManyArgs::new()
            .filter(filter.clone())
            .compile(self.schema)
            .map_err(|e| e.with_operation(operation))?;
        let mut builder = query.count();
        let count: i64 = builder
            .build_query_scalar()
            .fetch_one(&mut *conn)
            .await
            .during(operation)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn exists(&self, conn: &mut SqliteConnection, id: &str) -> RepositoryResult<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?)",
            self.schema.table
        );
        sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .during(RepositoryOperation::Exists)
    }

    #[tracing::instrument(skip(self, conn, data), fields(entity = self.schema.name))]
    async fn create(
        &self,
        conn: &mut SqliteConnection,
        data: CreateInput,
    ) -> RepositoryResult<Record> {
        let operation = RepositoryOperation::Create;
        data.validate(self.schema)?;
        let id = match &data.id {
            Some(id) => id.clone(),
            None => EntityId::new(self.schema.id_prefix).to_string(),
        };

        let mut tx = conn.begin().await.during(operation)?;
        if self.exists(&mut *tx, &id).await? {
            return Err(RepositoryError::already_exists(self.schema.name, id));
        }
        self.insert(&mut *tx, &id, &data).await?;
        tx.commit().await.during(operation)?;

        tracing::info!(id = %id, "entity created");
        self.get(conn, &id)
            .await
            .map_err(|e| e.with_operation(operation))
    }

    #[tracing::instrument(skip(self, conn, data), fields(entity = self.schema.name))]
    async fn update(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        data: Patch,
    ) -> RepositoryResult<Record> {
        let operation = RepositoryOperation::Update;
        data.validate(self.schema)?;
        let result = self.write_patch(conn, id, &data).await;
        self.guard().classify(conn, id, result).await?;
        self.get(conn, id)
            .await
            .map_err(|e| e.with_operation(operation))
    }

    #[tracing::instrument(skip(self, conn), fields(entity = self.schema.name))]
    async fn delete(&self, conn: &mut SqliteConnection, id: &str) -> RepositoryResult<()> {
        let operation = RepositoryOperation::Delete;
        let sql = format!("DELETE FROM {} WHERE id = ?", self.schema.table);
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *conn)
            .await
            .during(operation)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found(self.schema.name, id).with_operation(operation));
        }
        tracing::info!("entity deleted");
        Ok(())
    }
}

impl RelationRepository<str, Record> for EntityRepository {
    type Connection = SqliteConnection;

    #[tracing::instrument(skip(self, conn, ids), fields(entity = self.schema.name))]
    async fn connect(
        &self,
        conn: &mut SqliteConnection,
        parent: &str,
        relation: &str,
        ids: &[String],
    ) -> RepositoryResult<ReconcileOutcome> {
        self.reconcile(conn, parent, relation, RelationOp::Connect(ids.to_vec()))
            .await
    }

    #[tracing::instrument(skip(self, conn, ids), fields(entity = self.schema.name))]
    async fn disconnect(
        &self,
        conn: &mut SqliteConnection,
        parent: &str,
        relation: &str,
        ids: &[String],
    ) -> RepositoryResult<ReconcileOutcome> {
        self.reconcile(conn, parent, relation, RelationOp::Disconnect(ids.to_vec()))
            .await
    }

    #[tracing::instrument(skip(self, conn, ids), fields(entity = self.schema.name))]
    async fn set(
        &self,
        conn: &mut SqliteConnection,
        parent: &str,
        relation: &str,
        ids: &[String],
    ) -> RepositoryResult<ReconcileOutcome> {
        self.reconcile(conn, parent, relation, RelationOp::Set(ids.to_vec()))
            .await
    }

    #[tracing::instrument(skip(self, conn, args), fields(entity = self.schema.name))]
    async fn find_related(
        &self,
        conn: &mut SqliteConnection,
        parent: &str,
        relation: &str,
        args: &FindManyArgs,
    ) -> RepositoryResult<Vec<Record>> {
        let operation = RepositoryOperation::FindRelated;
        let (def, membership) = self
            .schema
            .relation(relation)
            .and_then(|r| Some((r, r.membership()?)))
            .ok_or_else(|| {
                RepositoryError::validation_failed(format!(
                    "{}: '{}' is not a to-many relation",
                    self.schema.name, relation
                ))
                .with_operation(operation)
            })?;

        if !self.exists(conn, parent).await? {
            return Err(RepositoryError::not_found(self.schema.name, parent).with_operation(operation));
        }

        let target = EntityRepository::new(def.target_schema());
        let query = args
            .compile(target.schema)
            .map_err(|e| e.with_operation(operation))?
            .member_of(membership, parent);
        target.fetch(conn, &query, operation).await
    }

    async fn batch_load(
        &self,
        conn: &mut SqliteConnection,
        parents: &[String],
        relation: &str,
    ) -> RepositoryResult<HashMap<String, Vec<String>>> {
        RelationReconciler::new(self.schema, relation, RepositoryOperation::BatchLoad)?
            .load_links(conn, parents)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ensure_schema;
    use crate::entities;
    use crate::repository::schema::fixtures;
    use crate::repository::{FilterCondition, OrderBy, RepositoryErrorKind};
    use chrono::{DateTime, Duration, TimeZone};
    use serde_json::json;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};

    async fn store() -> SqliteConnection {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        ensure_schema(&mut conn, &entities::catalog()).await.unwrap();
        conn
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn bikes() -> EntityRepository {
        EntityRepository::new(entities::bike::schema())
    }

    fn rentals() -> EntityRepository {
        EntityRepository::new(entities::rental::schema())
    }

    async fn seed_rentals(conn: &mut SqliteConnection, names: &[&str]) {
        for (i, name) in names.iter().enumerate() {
            rentals()
                .create(
                    conn,
                    CreateInput::new().with_id(*name).value("price", 10.0 + i as f64),
                )
                .await
                .unwrap();
        }
    }

    fn rental_ids(record: &Record) -> Vec<String> {
        record.links("rentals").unwrap_or_default().to_vec()
    }

    #[tokio::test]
    async fn test_create_generates_id_and_timestamps() {
        let mut conn = store().await;
        let bike = bikes()
            .create(&mut conn, CreateInput::new().value("model", "Brompton"))
            .await
            .unwrap();
        assert!(bike.id().starts_with("bike_"));
        assert_eq!(bike.version(), 1);
        assert_eq!(bike.get("model"), Some(&Value::from("Brompton")));
        assert!(bike.get("createdAt").and_then(Value::as_timestamp).is_some());
        assert_eq!(bike.get("location"), Some(&Value::Null));
        assert_eq!(rental_ids(&bike), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_create_existing_id_is_already_exists() {
        let mut conn = store().await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1").value("model", "A"))
            .await
            .unwrap();
        let err = bikes()
            .create(&mut conn, CreateInput::new().with_id("B1").value("model", "B"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::AlreadyExists);
        assert_eq!(err.status_hint(), 409);

        let bike = bikes().get(&mut conn, "B1").await.unwrap();
        assert_eq!(bike.get("model"), Some(&Value::from("A")));
        assert_eq!(bike.version(), 1);
    }

    #[tokio::test]
    async fn test_create_with_missing_reference_mutates_nothing() {
        let mut conn = store().await;
        let err = rentals()
            .create(&mut conn, CreateInput::new().with_id("R1").reference("bike", "B9"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::RelatedEntityNotFound);
        assert_eq!(err.operation, RepositoryOperation::Create);
        assert_eq!(err.entity_id.as_deref(), Some("B9"));
        assert!(!rentals().exists(&mut conn, "R1").await.unwrap());

        seed_rentals(&mut conn, &["R1"]).await;
        let err = bikes()
            .create(
                &mut conn,
                CreateInput::new().with_id("B1").connect("rentals", ["R1", "R9"]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::RelatedEntityNotFound);
        assert!(!bikes().exists(&mut conn, "B1").await.unwrap());
        let r1 = rentals().get(&mut conn, "R1").await.unwrap();
        assert_eq!(r1.reference("bike"), None);
    }

    #[tokio::test]
    async fn test_create_connects_to_many_inputs() {
        let mut conn = store().await;
        seed_rentals(&mut conn, &["R1", "R2"]).await;
        let bike = bikes()
            .create(
                &mut conn,
                CreateInput::new().with_id("B1").connect("rentals", ["R2", "R1"]),
            )
            .await
            .unwrap();
        assert_eq!(rental_ids(&bike), ids(&["R1", "R2"]));
        let r1 = rentals().get(&mut conn, "R1").await.unwrap();
        assert_eq!(r1.reference("bike"), Some("B1"));
    }

    #[tokio::test]
    async fn test_relation_reconciliation_scenario() {
        let mut conn = store().await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1"))
            .await
            .unwrap();
        seed_rentals(&mut conn, &["R1", "R2", "R3", "R4"]).await;
        bikes()
            .connect(&mut conn, "B1", "rentals", &ids(&["R1", "R2"]))
            .await
            .unwrap();

        let outcome = bikes()
            .connect(&mut conn, "B1", "rentals", &ids(&["R2", "R3"]))
            .await
            .unwrap();
        assert_eq!(outcome.linked.iter().collect::<Vec<_>>(), ["R3"]);
        assert!(outcome.unlinked.is_empty());
        let bike = bikes().get(&mut conn, "B1").await.unwrap();
        assert_eq!(rental_ids(&bike), ids(&["R1", "R2", "R3"]));

        let outcome = bikes()
            .disconnect(&mut conn, "B1", "rentals", &ids(&["R1", "R9"]))
            .await
            .unwrap();
        assert_eq!(outcome.unlinked.iter().collect::<Vec<_>>(), ["R1"]);
        let bike = bikes().get(&mut conn, "B1").await.unwrap();
        assert_eq!(rental_ids(&bike), ids(&["R2", "R3"]));

        let outcome = bikes()
            .set(&mut conn, "B1", "rentals", &ids(&["R4"]))
            .await
            .unwrap();
        assert_eq!(outcome.linked.iter().collect::<Vec<_>>(), ["R4"]);
        assert_eq!(outcome.unlinked.iter().collect::<Vec<_>>(), ["R2", "R3"]);
        let bike = bikes().get(&mut conn, "B1").await.unwrap();
        assert_eq!(rental_ids(&bike), ids(&["R4"]));
    }

    #[tokio::test]
    async fn test_empty_relation_operations_are_noops() {
        let mut conn = store().await;
        seed_rentals(&mut conn, &["R1"]).await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1").connect("rentals", ["R1"]))
            .await
            .unwrap();

        let connect = bikes().connect(&mut conn, "B1", "rentals", &[]).await.unwrap();
        let disconnect = bikes()
            .disconnect(&mut conn, "B1", "rentals", &[])
            .await
            .unwrap();
        assert!(connect.is_noop() && disconnect.is_noop());

        let bike = bikes().get(&mut conn, "B1").await.unwrap();
        assert_eq!(bike.version(), 1);
        assert_eq!(rental_ids(&bike), ids(&["R1"]));
    }

    #[tokio::test]
    async fn test_relation_operations_are_idempotent() {
        let mut conn = store().await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1"))
            .await
            .unwrap();
        seed_rentals(&mut conn, &["R1", "R2", "R3"]).await;

        bikes()
            .connect(&mut conn, "B1", "rentals", &ids(&["R1"]))
            .await
            .unwrap();
        assert!(bikes()
            .connect(&mut conn, "B1", "rentals", &ids(&["R1"]))
            .await
            .unwrap()
            .is_noop());

        bikes()
            .set(&mut conn, "B1", "rentals", &ids(&["R2", "R3"]))
            .await
            .unwrap();
        let once = bikes().get(&mut conn, "B1").await.unwrap();
        assert!(bikes()
            .set(&mut conn, "B1", "rentals", &ids(&["R2", "R3"]))
            .await
            .unwrap()
            .is_noop());
        let twice = bikes().get(&mut conn, "B1").await.unwrap();
        assert_eq!(once, twice);

        bikes()
            .disconnect(&mut conn, "B1", "rentals", &ids(&["R2"]))
            .await
            .unwrap();
        assert!(bikes()
            .disconnect(&mut conn, "B1", "rentals", &ids(&["R2", "R7"]))
            .await
            .unwrap()
            .is_noop());
    }

    #[tokio::test]
    async fn test_reconciliation_errors() {
        let mut conn = store().await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1"))
            .await
            .unwrap();
        seed_rentals(&mut conn, &["R1"]).await;

        let err = bikes()
            .connect(&mut conn, "B9", "rentals", &ids(&["R1"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::NotFound);
        assert_eq!(err.operation, RepositoryOperation::Connect);

        let err = bikes()
            .connect(&mut conn, "B1", "rentals", &ids(&["R1", "R9"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::RelatedEntityNotFound);
        let bike = bikes().get(&mut conn, "B1").await.unwrap();
        assert!(rental_ids(&bike).is_empty());
        assert_eq!(bike.version(), 1);

        let err = bikes()
            .set(&mut conn, "B1", "rentals", &ids(&["R8", "R9"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::RelatedEntityNotFound);
        assert_eq!(err.operation, RepositoryOperation::Set);

        let err = rentals()
            .connect(&mut conn, "R1", "bike", &ids(&["B1"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_set_with_partial_resolution_and_clear() {
        let mut conn = store().await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1"))
            .await
            .unwrap();
        seed_rentals(&mut conn, &["R1", "R2"]).await;

        bikes()
            .set(&mut conn, "B1", "rentals", &ids(&["R1", "R9"]))
            .await
            .unwrap();
        let bike = bikes().get(&mut conn, "B1").await.unwrap();
        assert_eq!(rental_ids(&bike), ids(&["R1"]));
        assert_eq!(bike.version(), 2);

        bikes().set(&mut conn, "B1", "rentals", &[]).await.unwrap();
        let bike = bikes().get(&mut conn, "B1").await.unwrap();
        assert!(rental_ids(&bike).is_empty());
        assert_eq!(bike.version(), 3);
    }

    #[tokio::test]
    async fn test_update_writes_only_patched_fields() {
        let mut conn = store().await;
        bikes()
            .create(
                &mut conn,
                CreateInput::new()
                    .with_id("B1")
                    .value("model", "Brompton")
                    .value("location", "Dock 4"),
            )
            .await
            .unwrap();

        let bike = bikes()
            .update(&mut conn, "B1", Patch::new().value("status", "Rented"))
            .await
            .unwrap();
        assert_eq!(bike.version(), 2);
        assert_eq!(bike.get("status"), Some(&Value::from("Rented")));
        assert_eq!(bike.get("model"), Some(&Value::from("Brompton")));
        assert_eq!(bike.get("location"), Some(&Value::from("Dock 4")));

        let err = bikes()
            .update(&mut conn, "B1", Patch::new().value("status", "Stolen"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_update_references_and_relations() {
        let mut conn = store().await;
        for id in ["B1", "B2"] {
            bikes()
                .create(&mut conn, CreateInput::new().with_id(id))
                .await
                .unwrap();
        }
        seed_rentals(&mut conn, &["R1", "R2"]).await;

        let rental = rentals()
            .update(&mut conn, "R1", Patch::new().reference("bike", "B2"))
            .await
            .unwrap();
        assert_eq!(rental.reference("bike"), Some("B2"));

        let err = rentals()
            .update(&mut conn, "R1", Patch::new().reference("bike", "B9"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::RelatedEntityNotFound);

        let rental = rentals()
            .update(&mut conn, "R1", Patch::new().clear_reference("bike"))
            .await
            .unwrap();
        assert_eq!(rental.reference("bike"), None);

        let bike = bikes()
            .update(
                &mut conn,
                "B1",
                Patch::new().set("rentals", ["R1"]).connect("rentals", ["R2"]),
            )
            .await
            .unwrap();
        assert_eq!(rental_ids(&bike), ids(&["R1", "R2"]));
    }

    #[tokio::test]
    async fn test_stale_version_is_concurrency_conflict() {
        let mut conn = store().await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1"))
            .await
            .unwrap();
        bikes()
            .update(&mut conn, "B1", Patch::new().value("model", "X").expect_version(1))
            .await
            .unwrap();

        let err = bikes()
            .update(&mut conn, "B1", Patch::new().value("model", "Y").expect_version(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ConcurrencyConflict);
        assert_eq!(err.operation, RepositoryOperation::Update);

        let bike = bikes().get(&mut conn, "B1").await.unwrap();
        assert_eq!(bike.get("model"), Some(&Value::from("X")));
    }

    #[tokio::test]
    async fn test_update_after_delete_is_not_found() {
        let mut conn = store().await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1"))
            .await
            .unwrap();
        bikes().delete(&mut conn, "B1").await.unwrap();

        let err = bikes()
            .update(&mut conn, "B1", Patch::new().value("model", "X").expect_version(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::NotFound);
        assert_eq!(err.operation, RepositoryOperation::Update);

        let err = bikes().delete(&mut conn, "B1").await.unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::NotFound);
        assert_eq!(err.operation, RepositoryOperation::Delete);
    }

    async fn file_store(dir: &tempfile::TempDir) -> (SqliteConnection, SqliteConnection) {
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("rentals.db"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let mut first = SqliteConnection::connect_with(&options).await.unwrap();
        ensure_schema(&mut first, &entities::catalog()).await.unwrap();
        let second = SqliteConnection::connect_with(&options).await.unwrap();
        (first, second)
    }

    #[tokio::test]
    async fn test_write_lost_to_other_connection_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (mut a, mut b) = file_store(&dir).await;
        seed_rentals(&mut a, &["R1"]).await;
        bikes()
            .create(&mut a, CreateInput::new().with_id("B1"))
            .await
            .unwrap();

        // A reads B1, B commits a change, then A tries to write
        let mut tx = a.begin().await.unwrap();
        bikes().get(&mut *tx, "B1").await.unwrap();
        bikes()
            .update(&mut b, "B1", Patch::new().value("model", "Brompton"))
            .await
            .unwrap();

        let err = bikes()
            .connect(&mut *tx, "B1", "rentals", &ids(&["R1"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ConcurrencyConflict);
        assert_eq!(err.operation, RepositoryOperation::Connect);
        assert_eq!(err.entity_id.as_deref(), Some("B1"));

        let err = bikes()
            .update(&mut *tx, "B1", Patch::new().value("model", "Dahon"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ConcurrencyConflict);
        assert_eq!(err.operation, RepositoryOperation::Update);
        tx.rollback().await.unwrap();

        let bike = bikes().get(&mut a, "B1").await.unwrap();
        assert_eq!(bike.get("model"), Some(&Value::from("Brompton")));
        assert_eq!(bike.version(), 2);
        assert!(rental_ids(&bike).is_empty());
    }

    #[tokio::test]
    async fn test_write_lost_to_concurrent_delete_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (mut a, mut b) = file_store(&dir).await;
        seed_rentals(&mut a, &["R1"]).await;
        bikes()
            .create(&mut a, CreateInput::new().with_id("B1"))
            .await
            .unwrap();

        // The open transaction keeps the snapshot a reconciliation holds
        // between reading the parent and its first write
        let mut tx = a.begin().await.unwrap();
        bikes().get(&mut *tx, "B1").await.unwrap();
        bikes().delete(&mut b, "B1").await.unwrap();

        let op = RelationOp::connect(["R1"]);
        let reconciler =
            RelationReconciler::new(entities::bike::schema(), "rentals", op.operation()).unwrap();
        let result = bikes()
            .reconcile_in_transaction(&mut *tx, &reconciler, "B1", &op)
            .await;
        assert_eq!(
            result.as_ref().unwrap_err().kind,
            RepositoryErrorKind::ConcurrencyConflict
        );
        tx.rollback().await.unwrap();

        let err = bikes()
            .guard()
            .classify(&mut a, "B1", result)
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::NotFound);
        assert_eq!(err.operation, RepositoryOperation::Connect);
        let rental = rentals().get(&mut a, "R1").await.unwrap();
        assert_eq!(rental.reference("bike"), None);
    }

    #[tokio::test]
    async fn test_delete_nulls_inverse_references() {
        let mut conn = store().await;
        seed_rentals(&mut conn, &["R1"]).await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1").connect("rentals", ["R1"]))
            .await
            .unwrap();
        bikes().delete(&mut conn, "B1").await.unwrap();
        let rental = rentals().get(&mut conn, "R1").await.unwrap();
        assert_eq!(rental.reference("bike"), None);
    }

    fn user_input(id: &str, created_at: DateTime<Utc>) -> CreateInput {
        CreateInput::new()
            .with_id(id)
            .value("username", id)
            .value("password", "secret")
            .value("roles", json!(["customer"]))
            .value("createdAt", created_at)
    }

    #[tokio::test]
    async fn test_json_fields_take_documents_only() {
        let mut conn = store().await;
        let users = EntityRepository::new(entities::user::schema());
        let base = || {
            CreateInput::new()
                .with_id("u1")
                .value("username", "a")
                .value("password", "p")
        };

        let err = users
            .create(&mut conn, base().value("roles", "admin"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
        let err = users
            .create(&mut conn, base().value("roles", json!(null)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
        assert!(!users.exists(&mut conn, "u1").await.unwrap());

        let user = users
            .create(&mut conn, base().value("roles", json!(["admin", "staff"])))
            .await
            .unwrap();
        assert_eq!(user.get("roles"), Some(&Value::Json(json!(["admin", "staff"]))));

        let err = users
            .update(&mut conn, "u1", Patch::new().value("roles", "admin"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
        let all = users.find_many(&mut conn, &FindManyArgs::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("roles"), Some(&Value::Json(json!(["admin", "staff"]))));
    }

    #[tokio::test]
    async fn test_filter_order_then_window() {
        let mut conn = store().await;
        let users = EntityRepository::new(entities::user::schema());
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        users
            .create(&mut conn, user_input("u0", t - Duration::days(1)))
            .await
            .unwrap();
        for n in [3, 1, 5, 2, 4] {
            users
                .create(&mut conn, user_input(&format!("u{n}"), t + Duration::hours(n)))
                .await
                .unwrap();
        }

        let filter = WhereExpression::new().and(FilterCondition::gt("createdAt", t));
        let page = users
            .find_many(
                &mut conn,
                &FindManyArgs::new()
                    .filter(filter.clone())
                    .order_by(OrderBy::asc("createdAt"))
                    .skip(1)
                    .take(2),
            )
            .await
            .unwrap();
        let page_ids: Vec<&str> = page.iter().map(Record::id).collect();
        assert_eq!(page_ids, ["u2", "u3"]);

        assert_eq!(users.meta(&mut conn, &filter).await.unwrap(), Meta { count: 5 });
    }

    #[tokio::test]
    async fn test_count_matches_find_many() {
        let mut conn = store().await;
        for (id, status) in [("B1", "Available"), ("B2", "Rented"), ("B3", "Available")] {
            bikes()
                .create(&mut conn, CreateInput::new().with_id(id).value("status", status))
                .await
                .unwrap();
        }
        for filter in [
            WhereExpression::new(),
            WhereExpression::new().and(FilterCondition::eq("status", "Available")),
            WhereExpression::new().and(FilterCondition::ne("status", "Available")),
            WhereExpression::new().and(FilterCondition::is_null("location")),
            WhereExpression::new().and(FilterCondition::in_list("id", ["B1", "B9"])),
        ] {
            let count = bikes().count(&mut conn, &filter).await.unwrap();
            let rows = bikes()
                .find_many(&mut conn, &FindManyArgs::new().filter(filter.clone()))
                .await
                .unwrap();
            assert_eq!(count, rows.len() as u64, "{:?}", filter);
        }
    }

    #[tokio::test]
    async fn test_find_many_is_stable() {
        let mut conn = store().await;
        for id in ["B3", "B1", "B2"] {
            bikes()
                .create(&mut conn, CreateInput::new().with_id(id).value("status", "Available"))
                .await
                .unwrap();
        }
        let args = FindManyArgs::new().order_by(OrderBy::asc("status"));
        let first = bikes().find_many(&mut conn, &args).await.unwrap();
        let second = bikes().find_many(&mut conn, &args).await.unwrap();
        assert_eq!(first, second);
        // ties fall back to insertion order
        let order: Vec<&str> = first.iter().map(Record::id).collect();
        assert_eq!(order, ["B3", "B1", "B2"]);
    }

    #[tokio::test]
    async fn test_find_many_windows() {
        let mut conn = store().await;
        for id in ["B1", "B2"] {
            bikes()
                .create(&mut conn, CreateInput::new().with_id(id))
                .await
                .unwrap();
        }
        let none = bikes()
            .find_many(&mut conn, &FindManyArgs::new().take(0))
            .await
            .unwrap();
        assert!(none.is_empty());
        let past_end = bikes()
            .find_many(&mut conn, &FindManyArgs::new().skip(5))
            .await
            .unwrap();
        assert!(past_end.is_empty());
        let unbounded = bikes()
            .find_many(&mut conn, &FindManyArgs::new().skip(1))
            .await
            .unwrap();
        assert_eq!(unbounded.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_filters_fail_before_store_access() {
        let mut conn = store().await;
        let unknown = FindManyArgs::new().filter(WhereExpression::new().and(FilterCondition::eq("colour", "red")));
        let err = bikes().find_many(&mut conn, &unknown).await.unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::InvalidFilter);

        let mismatch = WhereExpression::new().and(FilterCondition::gt("price", "cheap"));
        let err = rentals().count(&mut conn, &mismatch).await.unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::InvalidFilter);
        assert_eq!(err.operation, RepositoryOperation::Count);
    }

    #[tokio::test]
    async fn test_filter_by_relations() {
        let mut conn = store().await;
        seed_rentals(&mut conn, &["R1", "R2"]).await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1").connect("rentals", ["R1"]))
            .await
            .unwrap();
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B2"))
            .await
            .unwrap();

        let with_r1 = FindManyArgs::from_json(
            entities::bike::schema(),
            &json!({"where": {"rentals": {"id": "R1"}}}),
        )
        .unwrap();
        let found = bikes().find_many(&mut conn, &with_r1).await.unwrap();
        assert_eq!(found.iter().map(Record::id).collect::<Vec<_>>(), ["B1"]);

        let idle = FindManyArgs::new().filter(WhereExpression::new().and(FilterCondition::is_null("rentals")));
        let found = bikes().find_many(&mut conn, &idle).await.unwrap();
        assert_eq!(found.iter().map(Record::id).collect::<Vec<_>>(), ["B2"]);

        let on_b1 = FindManyArgs::new().filter(WhereExpression::new().and(FilterCondition::eq("bike", "B1")));
        let found = rentals().find_many(&mut conn, &on_b1).await.unwrap();
        assert_eq!(found.iter().map(Record::id).collect::<Vec<_>>(), ["R1"]);
    }

    #[tokio::test]
    async fn test_include_loads_links() {
        let mut conn = store().await;
        seed_rentals(&mut conn, &["R1", "R2"]).await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1").connect("rentals", ["R2", "R1"]))
            .await
            .unwrap();

        let plain = bikes().find_many(&mut conn, &FindManyArgs::new()).await.unwrap();
        assert_eq!(plain[0].links("rentals"), None);

        let loaded = bikes()
            .find_many(&mut conn, &FindManyArgs::new().include("rentals"))
            .await
            .unwrap();
        assert_eq!(rental_ids(&loaded[0]), ids(&["R1", "R2"]));

        let json = serde_json::to_value(&loaded[0]).unwrap();
        assert_eq!(json["rentals"], json!([{"id": "R1"}, {"id": "R2"}]));
        assert_eq!(json["version"], json!(1));
    }

    #[tokio::test]
    async fn test_find_related() {
        let mut conn = store().await;
        seed_rentals(&mut conn, &["R1", "R2", "R3"]).await;
        bikes()
            .create(&mut conn, CreateInput::new().with_id("B1").connect("rentals", ["R1", "R3"]))
            .await
            .unwrap();

        let related = bikes()
            .find_related(
                &mut conn,
                "B1",
                "rentals",
                &FindManyArgs::new().order_by(OrderBy::desc("price")),
            )
            .await
            .unwrap();
        assert_eq!(related.iter().map(Record::id).collect::<Vec<_>>(), ["R3", "R1"]);

        let err = bikes()
            .find_related(&mut conn, "B9", "rentals", &FindManyArgs::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::NotFound);
        assert_eq!(err.operation, RepositoryOperation::FindRelated);

        let err = rentals()
            .find_related(&mut conn, "R1", "bike", &FindManyArgs::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_join_relations_through_repository() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        ensure_schema(&mut conn, &[fixtures::garage(), fixtures::tool(), fixtures::tag()])
            .await
            .unwrap();
        let garages = EntityRepository::new(fixtures::garage());
        let tags = EntityRepository::new(fixtures::tag());
        for (id, label) in [("t1", "bikes"), ("t2", "repair")] {
            tags.create(&mut conn, CreateInput::new().with_id(id).value("label", label))
                .await
                .unwrap();
        }

        let garage = garages
            .create(
                &mut conn,
                CreateInput::new()
                    .with_id("g1")
                    .value("name", "North")
                    .connect("tags", ["t1"]),
            )
            .await
            .unwrap();
        assert_eq!(garage.links("tags"), Some(&["t1".to_string()][..]));

        garages
            .set(&mut conn, "g1", "tags", &ids(&["t2"]))
            .await
            .unwrap();
        let tagged = garages
            .find_related(&mut conn, "g1", "tags", &FindManyArgs::new())
            .await
            .unwrap();
        assert_eq!(tagged.iter().map(Record::id).collect::<Vec<_>>(), ["t2"]);

        tags.delete(&mut conn, "t2").await.unwrap();
        let garage = garages.get(&mut conn, "g1").await.unwrap();
        assert_eq!(garage.links("tags"), Some(&[][..]));
    }
}
