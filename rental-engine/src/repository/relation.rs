//! Relation reconciliation for to-many relations
//!
//! A to-many relation is a set of member identifiers. `connect`,
//! `disconnect` and `set` each compute the difference between the stored
//! set and the desired one with [`plan`], then write only that difference.
//!
//! | Operation    | Desired set           | Unresolvable ids                          |
//! |--------------|-----------------------|-------------------------------------------|
//! | `connect`    | existing ∪ ids        | `RelatedEntityNotFound`                   |
//! | `disconnect` | existing \ ids        | skipped                                   |
//! | `set`        | resolved ids          | dropped; error only if none resolve       |

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use sqlx::{Connection, QueryBuilder, Sqlite, SqliteConnection};

use super::error::{RepositoryError, RepositoryOperation, RepositoryResult, SqlResultExt};
use super::schema::{EntitySchema, Membership, RelationDef};

/// A change to the members of a to-many relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationOp {
    /// Add members, keeping the existing ones
    Connect(Vec<String>),
    /// Remove members if linked
    Disconnect(Vec<String>),
    /// Replace all members
    Set(Vec<String>),
}

impl RelationOp {
    /// Add `ids` to the relation
    pub fn connect<I: Into<String>>(ids: impl IntoIterator<Item = I>) -> Self {
        Self::Connect(ids.into_iter().map(Into::into).collect())
    }

    /// Remove `ids` from the relation
    pub fn disconnect<I: Into<String>>(ids: impl IntoIterator<Item = I>) -> Self {
        Self::Disconnect(ids.into_iter().map(Into::into).collect())
    }

    /// Make the relation exactly `ids`
    pub fn set<I: Into<String>>(ids: impl IntoIterator<Item = I>) -> Self {
        Self::Set(ids.into_iter().map(Into::into).collect())
    }

    /// Identifiers named by the operation
    pub fn ids(&self) -> &[String] {
        match self {
            Self::Connect(ids) | Self::Disconnect(ids) | Self::Set(ids) => ids,
        }
    }

    /// Operation reported in errors
    pub fn operation(&self) -> RepositoryOperation {
        match self {
            Self::Connect(_) => RepositoryOperation::Connect,
            Self::Disconnect(_) => RepositoryOperation::Disconnect,
            Self::Set(_) => RepositoryOperation::Set,
        }
    }
}

/// Members actually linked and unlinked by one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    /// Newly linked member ids
    pub linked: BTreeSet<String>,
    /// Removed member ids
    pub unlinked: BTreeSet<String>,
}

impl ReconcileOutcome {
    /// Whether the relation was left untouched
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.linked.is_empty() && self.unlinked.is_empty()
    }
}

/// Compute what `op` changes, given the current members and the subset of
/// requested ids that exist
///
/// Returns the first unresolvable id when the operation must fail.
pub fn plan(
    op: &RelationOp,
    existing: &BTreeSet<String>,
    resolved: &BTreeSet<String>,
) -> Result<ReconcileOutcome, String> {
    let mut outcome = ReconcileOutcome::default();
    match op {
        RelationOp::Connect(ids) => {
            if let Some(missing) = ids.iter().find(|id| !resolved.contains(*id)) {
                return Err(missing.clone());
            }
            outcome.linked = resolved.difference(existing).cloned().collect();
        }
        RelationOp::Disconnect(ids) => {
            outcome.unlinked = ids.iter().filter(|id| existing.contains(*id)).cloned().collect();
        }
        RelationOp::Set(ids) => {
            if resolved.is_empty() {
                if let Some(first) = ids.first() {
                    return Err(first.clone());
                }
            }
            outcome.linked = resolved.difference(existing).cloned().collect();
            outcome.unlinked = existing.difference(resolved).cloned().collect();
        }
    }
    Ok(outcome)
}

/// Reads and writes the members of one to-many relation
///
/// Does not check or touch the parent row; callers do that under the
/// same transaction.
#[derive(Debug, Clone, Copy)]
pub struct RelationReconciler {
    relation: &'static RelationDef,
    membership: Membership,
}

impl RelationReconciler {
    /// Reconciler for `schema.relation`
    ///
    /// Fails with `ValidationFailed` when the relation is unknown or to-one.
    pub fn new(
        schema: &'static EntitySchema,
        relation: &str,
        operation: RepositoryOperation,
    ) -> RepositoryResult<Self> {
        let def = schema.relation(relation).ok_or_else(|| {
            RepositoryError::validation_failed(format!(
                "{}: unknown relation '{}'",
                schema.name, relation
            ))
            .with_operation(operation)
        })?;
        let membership = def.membership().ok_or_else(|| {
            RepositoryError::validation_failed(format!(
                "{}: '{}' is not a to-many relation",
                schema.name, relation
            ))
            .with_operation(operation)
        })?;
        Ok(Self {
            relation: def,
            membership,
        })
    }

    /// The relation being reconciled
    pub fn relation(&self) -> &'static RelationDef {
        self.relation
    }

    /// Current member ids of `parent_id`
    pub async fn members(
        &self,
        conn: &mut SqliteConnection,
        parent_id: &str,
    ) -> RepositoryResult<BTreeSet<String>> {
        let Membership {
            table,
            parent_column,
            member_column,
            ..
        } = self.membership;
        let sql = format!("SELECT {member_column} FROM {table} WHERE {parent_column} = ?");
        let ids: Vec<String> = sqlx::query_scalar(&sql)
            .bind(parent_id)
            .fetch_all(&mut *conn)
            .await
            .during(RepositoryOperation::FindRelated)?;
        Ok(ids.into_iter().collect())
    }

    /// The subset of `ids` that exist in the target table
    pub async fn resolve(
        &self,
        conn: &mut SqliteConnection,
        ids: &[String],
        operation: RepositoryOperation,
    ) -> RepositoryResult<BTreeSet<String>> {
        if ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT id FROM {} WHERE id IN (",
            self.relation.target_schema().table
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        builder.push(")");
        let found: Vec<String> = builder
            .build_query_scalar()
            .fetch_all(&mut *conn)
            .await
            .during(operation)?;
        Ok(found.into_iter().collect())
    }

    /// Apply `op` to the members of `parent_id`
    ///
    /// Runs in its own transaction (a savepoint inside the caller's); on
    /// error nothing it wrote survives.
    pub async fn apply(
        &self,
        conn: &mut SqliteConnection,
        parent_id: &str,
        op: &RelationOp,
    ) -> RepositoryResult<ReconcileOutcome> {
        let operation = op.operation();
        let mut tx = conn.begin().await.during(operation)?;

        let existing = self.members(&mut *tx, parent_id).await?;
        let resolved = match op {
            RelationOp::Disconnect(_) => BTreeSet::new(),
            RelationOp::Connect(ids) | RelationOp::Set(ids) => {
                self.resolve(&mut *tx, ids, operation).await?
            }
        };
        let outcome = plan(op, &existing, &resolved).map_err(|missing| {
            RepositoryError::related_not_found(
                operation,
                self.relation.target_schema().name,
                missing,
            )
        })?;

        self.unlink(&mut *tx, parent_id, &outcome.unlinked, operation)
            .await?;
        self.link(&mut *tx, parent_id, &outcome.linked, operation)
            .await?;
        tx.commit().await.during(operation)?;

        tracing::debug!(
            relation = self.relation.name,
            parent = parent_id,
            %operation,
            linked = outcome.linked.len(),
            unlinked = outcome.unlinked.len(),
            "relation reconciled"
        );
        Ok(outcome)
    }

    /// Member ids for each of `parent_ids`, in one query
    ///
    /// Every parent gets an entry, empty when it has no members.
    pub async fn load_links(
        &self,
        conn: &mut SqliteConnection,
        parent_ids: &[String],
    ) -> RepositoryResult<HashMap<String, Vec<String>>> {
        let mut links: HashMap<String, Vec<String>> = parent_ids
            .iter()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        if parent_ids.is_empty() {
            return Ok(links);
        }

        let Membership {
            table,
            parent_column,
            member_column,
            ..
        } = self.membership;
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {parent_column}, {member_column} FROM {table} WHERE {parent_column} IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in parent_ids {
            separated.push_bind(id.as_str());
        }
        builder.push(format!(") ORDER BY {member_column}"));

        let pairs: Vec<(String, String)> = builder
            .build_query_as()
            .fetch_all(&mut *conn)
            .await
            .during(RepositoryOperation::BatchLoad)?;
        for (parent, member) in pairs {
            links.entry(parent).or_default().push(member);
        }
        Ok(links)
    }

    async fn link(
        &self,
        conn: &mut SqliteConnection,
        parent_id: &str,
        ids: &BTreeSet<String>,
        operation: RepositoryOperation,
    ) -> RepositoryResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let Membership {
            table,
            parent_column,
            member_column,
            inverse,
        } = self.membership;

        let mut builder = QueryBuilder::<Sqlite>::new("");
        if inverse {
            builder.push(format!("UPDATE {table} SET {parent_column} = "));
            builder.push_bind(parent_id);
            builder.push(", version = version + 1 WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(id.as_str());
            }
            builder.push(")");
        } else {
            builder.push(format!(
                "INSERT OR IGNORE INTO {table} ({parent_column}, {member_column}) "
            ));
            builder.push_values(ids, |mut row, id| {
                row.push_bind(parent_id).push_bind(id.as_str());
            });
        }
        builder.build().execute(&mut *conn).await.during(operation)?;
        Ok(())
    }

    async fn unlink(
        &self,
        conn: &mut SqliteConnection,
        parent_id: &str,
        ids: &BTreeSet<String>,
        operation: RepositoryOperation,
    ) -> RepositoryResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let Membership {
            table,
            parent_column,
            member_column,
            inverse,
        } = self.membership;

        let mut builder = QueryBuilder::<Sqlite>::new("");
        if inverse {
            builder.push(format!(
                "UPDATE {table} SET {parent_column} = NULL, version = version + 1 WHERE {parent_column} = "
            ));
        } else {
            builder.push(format!("DELETE FROM {table} WHERE {parent_column} = "));
        }
        builder.push_bind(parent_id);
        builder.push(format!(" AND {member_column} IN ("));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        builder.push(")");
        builder.build().execute(&mut *conn).await.during(operation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ensure_schema;
    use crate::entities;
    use crate::repository::schema::fixtures;
    use crate::repository::RepositoryErrorKind;

    fn set_of(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_connect_adds_only_new_members() {
        let existing = set_of(&["R1", "R2"]);
        let outcome = plan(
            &RelationOp::connect(["R2", "R3"]),
            &existing,
            &set_of(&["R2", "R3"]),
        )
        .unwrap();
        assert_eq!(outcome.linked, set_of(&["R3"]));
        assert!(outcome.unlinked.is_empty());
    }

    #[test]
    fn test_plan_connect_rejects_unknown_ids() {
        let missing = plan(
            &RelationOp::connect(["R3", "R9"]),
            &BTreeSet::new(),
            &set_of(&["R3"]),
        )
        .unwrap_err();
        assert_eq!(missing, "R9");
    }

    #[test]
    fn test_plan_empty_inputs_are_noops() {
        let existing = set_of(&["R1"]);
        let none = BTreeSet::new();
        assert!(plan(&RelationOp::connect(Vec::<String>::new()), &existing, &none)
            .unwrap()
            .is_noop());
        assert!(plan(&RelationOp::disconnect(Vec::<String>::new()), &existing, &none)
            .unwrap()
            .is_noop());
    }

    #[test]
    fn test_plan_disconnect_skips_absent_ids() {
        let outcome = plan(
            &RelationOp::disconnect(["R1", "R9"]),
            &set_of(&["R1", "R2", "R3"]),
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(outcome.unlinked, set_of(&["R1"]));
        assert!(outcome.linked.is_empty());
    }

    #[test]
    fn test_plan_set_replaces_members() {
        let outcome = plan(
            &RelationOp::set(["R3", "R4"]),
            &set_of(&["R2", "R3"]),
            &set_of(&["R3", "R4"]),
        )
        .unwrap();
        assert_eq!(outcome.linked, set_of(&["R4"]));
        assert_eq!(outcome.unlinked, set_of(&["R2"]));
    }

    #[test]
    fn test_plan_set_with_partial_resolution() {
        let outcome = plan(
            &RelationOp::set(["R4", "R9"]),
            &set_of(&["R1"]),
            &set_of(&["R4"]),
        )
        .unwrap();
        assert_eq!(outcome.linked, set_of(&["R4"]));
        assert_eq!(outcome.unlinked, set_of(&["R1"]));

        let missing = plan(&RelationOp::set(["R9"]), &set_of(&["R1"]), &BTreeSet::new()).unwrap_err();
        assert_eq!(missing, "R9");
    }

    #[test]
    fn test_plan_set_empty_clears() {
        let outcome = plan(
            &RelationOp::set(Vec::<String>::new()),
            &set_of(&["R1", "R2"]),
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(outcome.unlinked, set_of(&["R1", "R2"]));
    }

    #[test]
    fn test_relation_op_accessors() {
        let op = RelationOp::disconnect(["a", "b"]);
        assert_eq!(op.ids(), ["a".to_string(), "b".to_string()]);
        assert_eq!(op.operation(), RepositoryOperation::Disconnect);
    }

    #[test]
    fn test_reconciler_rejects_to_one_and_unknown() {
        let rental = entities::rental::schema();
        let err = RelationReconciler::new(rental, "bike", RepositoryOperation::Connect).unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
        assert_eq!(err.operation, RepositoryOperation::Connect);
        assert!(RelationReconciler::new(rental, "wheels", RepositoryOperation::Set).is_err());
        assert!(RelationReconciler::new(rental, "payments", RepositoryOperation::Set).is_ok());
    }

    async fn garage_store() -> SqliteConnection {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        ensure_schema(
            &mut conn,
            &[fixtures::garage(), fixtures::tool(), fixtures::tag()],
        )
        .await
        .unwrap();
        sqlx::query("INSERT INTO garages (id, name, created_at) VALUES ('g1', 'North', 0), ('g2', 'South', 0)")
            .execute(&mut conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO tags (id, label) VALUES ('t1', 'a'), ('t2', 'b'), ('t3', 'c')")
            .execute(&mut conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO tools (id, label) VALUES ('w1', 'wrench'), ('w2', 'pump')")
            .execute(&mut conn)
            .await
            .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_join_relation_reconciliation() {
        let mut conn = garage_store().await;
        let tags = RelationReconciler::new(fixtures::garage(), "tags", RepositoryOperation::Connect)
            .unwrap();

        let outcome = tags
            .apply(&mut conn, "g1", &RelationOp::connect(["t1", "t2"]))
            .await
            .unwrap();
        assert_eq!(outcome.linked, set_of(&["t1", "t2"]));

        let again = tags
            .apply(&mut conn, "g1", &RelationOp::connect(["t1", "t2"]))
            .await
            .unwrap();
        assert!(again.is_noop());

        let err = tags
            .apply(&mut conn, "g1", &RelationOp::connect(["t3", "t9"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::RelatedEntityNotFound);
        assert_eq!(err.entity_id.as_deref(), Some("t9"));
        // the failed call left nothing behind
        assert_eq!(tags.members(&mut conn, "g1").await.unwrap(), set_of(&["t1", "t2"]));

        tags.apply(&mut conn, "g1", &RelationOp::set(["t2", "t3"]))
            .await
            .unwrap();
        assert_eq!(tags.members(&mut conn, "g1").await.unwrap(), set_of(&["t2", "t3"]));
    }

    #[tokio::test]
    async fn test_inverse_link_moves_member() {
        let mut conn = garage_store().await;
        let tools = RelationReconciler::new(fixtures::garage(), "tools", RepositoryOperation::Connect)
            .unwrap();

        tools
            .apply(&mut conn, "g1", &RelationOp::connect(["w1", "w2"]))
            .await
            .unwrap();
        tools
            .apply(&mut conn, "g2", &RelationOp::connect(["w2"]))
            .await
            .unwrap();

        assert_eq!(tools.members(&mut conn, "g1").await.unwrap(), set_of(&["w1"]));
        assert_eq!(tools.members(&mut conn, "g2").await.unwrap(), set_of(&["w2"]));

        let version: i64 = sqlx::query_scalar("SELECT version FROM tools WHERE id = 'w2'")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn test_load_links_batches_parents() {
        let mut conn = garage_store().await;
        let tags = RelationReconciler::new(fixtures::garage(), "tags", RepositoryOperation::Connect)
            .unwrap();
        tags.apply(&mut conn, "g1", &RelationOp::connect(["t3", "t1"]))
            .await
            .unwrap();

        let links = tags
            .load_links(&mut conn, &["g1".to_string(), "g2".to_string()])
            .await
            .unwrap();
        assert_eq!(links["g1"], vec!["t1".to_string(), "t3".to_string()]);
        assert!(links["g2"].is_empty());
    }
}
