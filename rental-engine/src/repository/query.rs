//! Find-many requests
//!
//! [`FindManyArgs`] bundles a where expression, a multi-key ordering, a
//! skip/take window and the to-many relations to eager-load. Compiling it
//! against a schema validates everything up front and yields a
//! [`CompiledQuery`] that renders the `SELECT` and `COUNT` statements.
//!
//! # Example
//!
//! ```rust
//! use rental_engine::entities;
//! use rental_engine::repository::{FilterCondition, FindManyArgs, OrderBy, WhereExpression};
//! use serde_json::json;
//!
//! let built = FindManyArgs::new()
//!     .filter(WhereExpression::new().and(FilterCondition::eq("status", "Available")))
//!     .order_by(OrderBy::desc("createdAt"))
//!     .skip(10)
//!     .take(5)
//!     .include("rentals");
//!
//! let parsed = FindManyArgs::from_json(
//!     entities::bike::schema(),
//!     &json!({
//!         "where": {"status": "Available"},
//!         "orderBy": [{"createdAt": "desc"}],
//!         "skip": 10,
//!         "take": 5,
//!         "include": {"rentals": true},
//!     }),
//! )
//! .unwrap();
//!
//! assert_eq!(built, parsed);
//! ```

use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};

use super::error::{RepositoryError, RepositoryResult};
use super::filter::{CompiledWhere, WhereExpression};
use super::pagination::{OrderBy, OrderDirection, Pagination};
use super::schema::{EntitySchema, Member, Membership, RelationDef, RelationKind};
use super::value::FieldType;

/// Arguments of a find-many request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindManyArgs {
    /// Conjunction of filter conditions
    pub filter: WhereExpression,
    /// Sort keys, most significant first
    pub order_by: Vec<OrderBy>,
    /// Result window
    pub pagination: Pagination,
    /// To-many relations whose member ids are loaded on each result
    pub include: Vec<String>,
}

impl FindManyArgs {
    /// Everything, in insertion order
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the where expression
    #[must_use]
    pub fn filter(mut self, filter: WhereExpression) -> Self {
        self.filter = filter;
        self
    }

    /// Append a sort key
    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Skip the first `skip` results
    #[must_use]
    pub fn skip(mut self, skip: u64) -> Self {
        self.pagination.skip = skip;
        self
    }

    /// Return at most `take` results
    #[must_use]
    pub fn take(mut self, take: u64) -> Self {
        self.pagination.take = Some(take);
        self
    }

    /// Replace the result window
    #[must_use]
    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    /// Eager-load a to-many relation
    #[must_use]
    pub fn include(mut self, relation: impl Into<String>) -> Self {
        self.include.push(relation.into());
        self
    }

    /// Parse a JSON request object
    ///
    /// Recognized keys are `where`, `orderBy` (an object or an array of
    /// single-key objects mapping a field to `"asc"`/`"desc"`), `skip`,
    /// `take` and `include` (an object of `relation: true` or an array of
    /// relation names).
    pub fn from_json(schema: &'static EntitySchema, json: &serde_json::Value) -> RepositoryResult<Self> {
        let object = match json {
            serde_json::Value::Null => return Ok(Self::new()),
            serde_json::Value::Object(object) => object,
            _ => {
                return Err(RepositoryError::invalid_filter(
                    "find-many arguments must be an object",
                ))
            }
        };

        let mut args = Self::new();
        for (key, value) in object {
            match key.as_str() {
                "where" => args.filter = WhereExpression::from_json(schema, value)?,
                "orderBy" => args.order_by = order_from_json(value)?,
                "skip" => args.pagination.skip = count_from_json(key, value)?,
                "take" => args.pagination.take = Some(count_from_json(key, value)?),
                "include" => args.include = include_from_json(value)?,
                other => {
                    return Err(RepositoryError::invalid_filter(format!(
                        "unknown find-many argument '{}'",
                        other
                    )))
                }
            }
        }
        Ok(args)
    }

    /// Validate against `schema`
    pub fn compile(&self, schema: &'static EntitySchema) -> RepositoryResult<CompiledQuery> {
        let filter = self.filter.compile(schema)?;

        let mut order = Vec::with_capacity(self.order_by.len());
        for key in &self.order_by {
            order.push((order_column(schema, &key.field)?, key.direction));
        }

        let mut include = Vec::with_capacity(self.include.len());
        for name in &self.include {
            match schema.relation(name) {
                Some(relation) if relation.is_to_many() => {
                    if !include.iter().any(|r: &&RelationDef| r.name == relation.name) {
                        include.push(relation);
                    }
                }
                Some(_) => {
                    return Err(RepositoryError::invalid_filter(format!(
                        "cannot include to-one relation '{}' on {}",
                        name, schema.name
                    )))
                }
                None => {
                    return Err(RepositoryError::invalid_filter(format!(
                        "unknown relation '{}' on {}",
                        name, schema.name
                    )))
                }
            }
        }

        Ok(CompiledQuery {
            schema,
            filter,
            order,
            pagination: self.pagination,
            include,
        })
    }
}

fn order_column(schema: &'static EntitySchema, name: &str) -> RepositoryResult<&'static str> {
    match schema.resolve(name) {
        Some(Member::Id) => Ok("id"),
        Some(Member::Field(field)) if field.ty == FieldType::Json => {
            Err(RepositoryError::invalid_filter(format!(
                "cannot order by JSON field '{}'",
                name
            )))
        }
        Some(Member::Field(field)) => Ok(field.column),
        Some(Member::Relation(relation)) => match relation.kind {
            RelationKind::ToOne { column } => Ok(column),
            _ => Err(RepositoryError::invalid_filter(format!(
                "cannot order by to-many relation '{}'",
                name
            ))),
        },
        None => Err(RepositoryError::invalid_filter(format!(
            "unknown order field '{}' on {}",
            name, schema.name
        ))),
    }
}

fn order_from_json(json: &serde_json::Value) -> RepositoryResult<Vec<OrderBy>> {
    let invalid = || RepositoryError::invalid_filter("orderBy takes {\"field\": \"asc\" | \"desc\"}");
    let mut order = Vec::new();
    let mut push_object = |object: &serde_json::Map<String, serde_json::Value>| {
        for (field, direction) in object {
            let direction: OrderDirection = direction
                .as_str()
                .ok_or_else(invalid)?
                .parse()
                .map_err(|_| invalid())?;
            order.push(OrderBy::new(field.as_str(), direction));
        }
        Ok::<_, RepositoryError>(())
    };
    match json {
        serde_json::Value::Object(object) => push_object(object)?,
        serde_json::Value::Array(items) => {
            for item in items {
                push_object(item.as_object().ok_or_else(invalid)?)?;
            }
        }
        _ => return Err(invalid()),
    }
    Ok(order)
}

fn count_from_json(key: &str, json: &serde_json::Value) -> RepositoryResult<u64> {
    json.as_u64().ok_or_else(|| {
        RepositoryError::invalid_filter(format!("'{}' must be a non-negative integer", key))
    })
}

fn include_from_json(json: &serde_json::Value) -> RepositoryResult<Vec<String>> {
    let invalid = || RepositoryError::invalid_filter("include takes {\"relation\": true} or [\"relation\"]");
    match json {
        serde_json::Value::Object(object) => {
            let mut names = Vec::new();
            for (name, flag) in object {
                if flag.as_bool().ok_or_else(invalid)? {
                    names.push(name.clone());
                }
            }
            Ok(names)
        }
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}

/// A find-many request validated against one schema
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    schema: &'static EntitySchema,
    filter: CompiledWhere,
    order: Vec<(&'static str, OrderDirection)>,
    pagination: Pagination,
    include: Vec<&'static RelationDef>,
}

impl CompiledQuery {
    /// Relations to eager-load
    pub fn include(&self) -> &[&'static RelationDef] {
        &self.include
    }

    /// Result window
    pub fn pagination(&self) -> Pagination {
        self.pagination
    }

    /// Restrict to the members of a parent's to-many relation
    pub(crate) fn member_of(mut self, membership: Membership, parent_id: &str) -> Self {
        self.filter = self.filter.member_of(membership, parent_id);
        self
    }

    /// `SELECT t.* ... ORDER BY ... LIMIT ? OFFSET ?`
    ///
    /// Ties are broken by `rowid`, so results are stable between calls.
    pub(crate) fn select(&self) -> QueryBuilder<'static, Sqlite> {
        let mut builder = QueryBuilder::new(format!("SELECT t.* FROM {} AS t", self.schema.table));
        self.filter.push_to(&mut builder);
        builder.push(" ORDER BY ");
        for (column, direction) in &self.order {
            builder.push(format!("t.{} {}, ", column, direction.as_sql()));
        }
        builder.push("t.rowid ASC");
        let (limit, offset) = self.pagination.limit_offset();
        builder.push(" LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);
        builder
    }

    /// `SELECT COUNT(*) ...` over the same predicate, ignoring the window
    pub(crate) fn count(&self) -> QueryBuilder<'static, Sqlite> {
        let mut builder = QueryBuilder::new(format!("SELECT COUNT(*) FROM {} AS t", self.schema.table));
        self.filter.push_to(&mut builder);
        builder
    }
}

/// Pagination metadata for a find-many result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Meta {
    /// Rows matching the where expression
    pub count: u64,
}
