//! Dynamic entity records and write inputs
//!
//! A [`Record`] is one row of any entity, read through its schema. A
//! [`CreateInput`] and a [`Patch`] carry the caller's side of a write; both
//! are validated against the schema before a transaction is opened.

use std::collections::BTreeMap;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::json;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::error::{RepositoryError, RepositoryOperation, RepositoryResult};
use super::relation::RelationOp;
use super::schema::{EntitySchema, Member, RelationKind};
use super::value::Value;

/// One row of an entity
///
/// Serializes to a flat object: `id`, `version`, every attribute, to-one
/// relations as `{"id": ...}` (or `null`) and loaded to-many relations as
/// arrays of `{"id": ...}`.
#[derive(Debug, Clone)]
pub struct Record {
    schema: &'static EntitySchema,
    id: String,
    version: i64,
    fields: BTreeMap<&'static str, Value>,
    references: BTreeMap<&'static str, Option<String>>,
    links: BTreeMap<&'static str, Vec<String>>,
}

impl Record {
    /// Decode a row selected with `t.*` from the entity's table
    pub(crate) fn from_row(schema: &'static EntitySchema, row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let mut fields = BTreeMap::new();
        for field in schema.fields {
            fields.insert(field.name, Value::decode(row, field.column, field.ty)?);
        }
        let mut references = BTreeMap::new();
        for (relation, column) in schema.to_one_relations() {
            references.insert(relation.name, row.try_get::<Option<String>, _>(column)?);
        }
        Ok(Self {
            schema,
            id: row.try_get("id")?,
            version: row.try_get("version")?,
            fields,
            references,
            links: BTreeMap::new(),
        })
    }

    /// Schema this record belongs to
    pub fn schema(&self) -> &'static EntitySchema {
        self.schema
    }

    /// Identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Optimistic concurrency token
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Attribute value by public name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// All attributes
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.fields.iter().map(|(name, value)| (*name, value))
    }

    /// Identifier held by a to-one relation
    pub fn reference(&self, relation: &str) -> Option<&str> {
        self.references.get(relation).and_then(|id| id.as_deref())
    }

    /// Member identifiers of a loaded to-many relation, sorted
    ///
    /// `None` when the relation was not loaded.
    pub fn links(&self, relation: &str) -> Option<&[String]> {
        self.links.get(relation).map(Vec::as_slice)
    }

    pub(crate) fn set_links(&mut self, relation: &'static str, mut ids: Vec<String>) {
        ids.sort();
        ids.dedup();
        self.links.insert(relation, ids);
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.schema, other.schema)
            && self.id == other.id
            && self.version == other.version
            && self.fields == other.fields
            && self.references == other.references
            && self.links == other.links
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("version", &self.version)?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        for (name, id) in &self.references {
            map.serialize_entry(name, &id.as_ref().map(|id| json!({ "id": id })))?;
        }
        for (name, ids) in &self.links {
            let members: Vec<_> = ids.iter().map(|id| json!({ "id": id })).collect();
            map.serialize_entry(name, &members)?;
        }
        map.end()
    }
}

/// Input for creating an entity
///
/// # Example
///
/// ```rust
/// use rental_engine::repository::CreateInput;
///
/// let input = CreateInput::new()
///     .with_id("rental_1")
///     .value("price", 12.5)
///     .reference("bike", "bike_1");
/// assert_eq!(input.id.as_deref(), Some("rental_1"));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateInput {
    /// Caller-supplied identifier; generated when absent
    pub id: Option<String>,
    /// Attribute values by public name
    pub values: BTreeMap<String, Value>,
    /// To-one relations by name
    pub references: BTreeMap<String, Option<String>>,
    /// To-many relations by name, applied with connect semantics
    pub links: BTreeMap<String, Vec<String>>,
}

impl CreateInput {
    /// Empty input
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a caller-supplied identifier
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set an attribute
    #[must_use]
    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Point a to-one relation at `id`
    #[must_use]
    pub fn reference(mut self, relation: impl Into<String>, id: impl Into<String>) -> Self {
        self.references.insert(relation.into(), Some(id.into()));
        self
    }

    /// Link members of a to-many relation
    #[must_use]
    pub fn connect<I: Into<String>>(
        mut self,
        relation: impl Into<String>,
        ids: impl IntoIterator<Item = I>,
    ) -> Self {
        self.links
            .entry(relation.into())
            .or_default()
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Parse a JSON create object
    ///
    /// Attributes take plain JSON values, `id` a string, to-one relations
    /// `{"id": ...}` or `null`, and to-many relations either an array of
    /// `{"id": ...}` or `{"connect": [...]}`.
    pub fn from_json(schema: &'static EntitySchema, json: &serde_json::Value) -> RepositoryResult<Self> {
        let op = RepositoryOperation::Create;
        let object = as_object(schema, json, op)?;
        let mut input = Self::new();
        for (key, value) in object {
            match schema.resolve(key).ok_or_else(|| unknown_member(schema, key, op))? {
                Member::Id => {
                    let id = value.as_str().ok_or_else(|| {
                        invalid_input(schema, op, "'id' must be a string".to_string())
                    })?;
                    input.id = Some(id.to_string());
                }
                Member::Field(field) => {
                    let parsed = Value::from_json(field.ty, value)
                        .map_err(|e| invalid_input(schema, op, format!("'{}': {}", key, e)))?;
                    input.values.insert(key.clone(), parsed);
                }
                Member::Relation(relation) => match relation.kind {
                    RelationKind::ToOne { .. } => {
                        let id = reference_from_json(schema, key, value, op)?;
                        input.references.insert(key.clone(), id);
                    }
                    RelationKind::Inverse { .. } | RelationKind::Join { .. } => {
                        let ids = match value.get("connect") {
                            Some(list) => ids_from_json(schema, key, list, op)?,
                            None => ids_from_json(schema, key, value, op)?,
                        };
                        input.links.insert(key.clone(), ids);
                    }
                },
            }
        }
        Ok(input)
    }

    /// Check the input against `schema`
    ///
    /// Rejects unknown names, type mismatches, nulls in required fields and
    /// missing required attributes. Generated attributes may be omitted.
    pub fn validate(&self, schema: &'static EntitySchema) -> RepositoryResult<()> {
        let op = RepositoryOperation::Create;
        if let Some(id) = &self.id {
            if id.is_empty() {
                return Err(invalid_input(schema, op, "'id' must not be empty".to_string()));
            }
        }
        validate_values(schema, &self.values, op)?;
        for field in schema.fields {
            if !field.nullable && field.generated.is_none() && !self.values.contains_key(field.name) {
                return Err(invalid_input(
                    schema,
                    op,
                    format!("missing required field '{}'", field.name),
                ));
            }
        }
        validate_relations(schema, self.references.keys(), false, op)?;
        validate_relations(schema, self.links.keys(), true, op)?;
        Ok(())
    }
}

/// Partial update of an entity
///
/// Only the attributes and relations present are written.
///
/// # Example
///
/// ```rust
/// use rental_engine::repository::Patch;
///
/// let patch = Patch::new()
///     .value("status", "Rented")
///     .connect("rentals", ["rental_3"])
///     .expect_version(4);
/// assert!(!patch.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    /// Attribute values by public name
    pub values: BTreeMap<String, Value>,
    /// To-one relations by name; `None` clears the reference
    pub references: BTreeMap<String, Option<String>>,
    /// To-many operations, applied in order
    pub relations: Vec<(String, RelationOp)>,
    /// Version the caller last read; the update fails if the row moved on
    pub expected_version: Option<i64>,
}

impl Patch {
    /// Empty patch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute
    #[must_use]
    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Point a to-one relation at `id`
    #[must_use]
    pub fn reference(mut self, relation: impl Into<String>, id: impl Into<String>) -> Self {
        self.references.insert(relation.into(), Some(id.into()));
        self
    }

    /// Clear a to-one relation
    #[must_use]
    pub fn clear_reference(mut self, relation: impl Into<String>) -> Self {
        self.references.insert(relation.into(), None);
        self
    }

    /// Link members of a to-many relation
    #[must_use]
    pub fn connect<I: Into<String>>(
        self,
        relation: impl Into<String>,
        ids: impl IntoIterator<Item = I>,
    ) -> Self {
        self.relation(relation, RelationOp::connect(ids))
    }

    /// Unlink members of a to-many relation
    #[must_use]
    pub fn disconnect<I: Into<String>>(
        self,
        relation: impl Into<String>,
        ids: impl IntoIterator<Item = I>,
    ) -> Self {
        self.relation(relation, RelationOp::disconnect(ids))
    }

    /// Replace the members of a to-many relation
    #[must_use]
    pub fn set<I: Into<String>>(
        self,
        relation: impl Into<String>,
        ids: impl IntoIterator<Item = I>,
    ) -> Self {
        self.relation(relation, RelationOp::set(ids))
    }

    /// Append a to-many operation
    #[must_use]
    pub fn relation(mut self, relation: impl Into<String>, op: RelationOp) -> Self {
        self.relations.push((relation.into(), op));
        self
    }

    /// Require the row to still be at `version`
    #[must_use]
    pub fn expect_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Whether the patch writes nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.references.is_empty() && self.relations.is_empty()
    }

    /// Parse a JSON update object
    ///
    /// To-many relations take `{"set": [...], "disconnect": [...],
    /// "connect": [...]}`, applied in that order. A top-level `version`
    /// becomes the expected version.
    pub fn from_json(schema: &'static EntitySchema, json: &serde_json::Value) -> RepositoryResult<Self> {
        let op = RepositoryOperation::Update;
        let object = as_object(schema, json, op)?;
        let mut patch = Self::new();
        for (key, value) in object {
            if key == "version" {
                patch.expected_version = Some(value.as_i64().ok_or_else(|| {
                    invalid_input(schema, op, "'version' must be an integer".to_string())
                })?);
                continue;
            }
            match schema.resolve(key).ok_or_else(|| unknown_member(schema, key, op))? {
                Member::Id => {
                    return Err(invalid_input(schema, op, "'id' cannot be updated".to_string()));
                }
                Member::Field(field) => {
                    let parsed = Value::from_json(field.ty, value)
                        .map_err(|e| invalid_input(schema, op, format!("'{}': {}", key, e)))?;
                    patch.values.insert(key.clone(), parsed);
                }
                Member::Relation(relation) => match relation.kind {
                    RelationKind::ToOne { .. } => {
                        let id = reference_from_json(schema, key, value, op)?;
                        patch.references.insert(key.clone(), id);
                    }
                    RelationKind::Inverse { .. } | RelationKind::Join { .. } => {
                        let ops = value.as_object().ok_or_else(|| {
                            invalid_input(
                                schema,
                                op,
                                format!("'{}' takes {{connect, disconnect, set}}", key),
                            )
                        })?;
                        if let Some(unknown) = ops
                            .keys()
                            .find(|k| !matches!(k.as_str(), "connect" | "disconnect" | "set"))
                        {
                            return Err(invalid_input(
                                schema,
                                op,
                                format!("unknown relation operation '{}' on '{}'", unknown, key),
                            ));
                        }
                        if let Some(list) = ops.get("set") {
                            let ids = ids_from_json(schema, key, list, op)?;
                            patch.relations.push((key.clone(), RelationOp::Set(ids)));
                        }
                        if let Some(list) = ops.get("disconnect") {
                            let ids = ids_from_json(schema, key, list, op)?;
                            patch.relations.push((key.clone(), RelationOp::Disconnect(ids)));
                        }
                        if let Some(list) = ops.get("connect") {
                            let ids = ids_from_json(schema, key, list, op)?;
                            patch.relations.push((key.clone(), RelationOp::Connect(ids)));
                        }
                    }
                },
            }
        }
        Ok(patch)
    }

    /// Check the patch against `schema`
    pub fn validate(&self, schema: &'static EntitySchema) -> RepositoryResult<()> {
        let op = RepositoryOperation::Update;
        validate_values(schema, &self.values, op)?;
        validate_relations(schema, self.references.keys(), false, op)?;
        validate_relations(schema, self.relations.iter().map(|(name, _)| name), true, op)?;
        Ok(())
    }
}

fn invalid_input(schema: &EntitySchema, op: RepositoryOperation, message: String) -> RepositoryError {
    RepositoryError::validation_failed(format!("{}: {}", schema.name, message)).with_operation(op)
}

fn unknown_member(schema: &EntitySchema, name: &str, op: RepositoryOperation) -> RepositoryError {
    invalid_input(schema, op, format!("unknown field '{}'", name))
}

fn as_object<'a>(
    schema: &EntitySchema,
    json: &'a serde_json::Value,
    op: RepositoryOperation,
) -> RepositoryResult<&'a serde_json::Map<String, serde_json::Value>> {
    json.as_object()
        .ok_or_else(|| invalid_input(schema, op, "input must be a JSON object".to_string()))
}

fn id_from_json(json: &serde_json::Value) -> Option<String> {
    match json {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Object(object) => object.get("id")?.as_str().map(str::to_string),
        _ => None,
    }
}

fn reference_from_json(
    schema: &EntitySchema,
    key: &str,
    json: &serde_json::Value,
    op: RepositoryOperation,
) -> RepositoryResult<Option<String>> {
    if json.is_null() {
        return Ok(None);
    }
    let target = json.get("connect").unwrap_or(json);
    id_from_json(target).map(Some).ok_or_else(|| {
        invalid_input(schema, op, format!("'{}' takes {{\"id\": ...}} or null", key))
    })
}

fn ids_from_json(
    schema: &EntitySchema,
    key: &str,
    json: &serde_json::Value,
    op: RepositoryOperation,
) -> RepositoryResult<Vec<String>> {
    let invalid = || invalid_input(schema, op, format!("'{}' takes an array of {{\"id\": ...}}", key));
    json.as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|item| id_from_json(item).ok_or_else(invalid))
        .collect()
}

fn validate_values(
    schema: &'static EntitySchema,
    values: &BTreeMap<String, Value>,
    op: RepositoryOperation,
) -> RepositoryResult<()> {
    for (name, value) in values {
        let field = match schema.resolve(name) {
            Some(Member::Field(field)) => field,
            Some(Member::Id) => {
                return Err(invalid_input(schema, op, "'id' is not a writable field".to_string()))
            }
            Some(Member::Relation(_)) => {
                return Err(invalid_input(
                    schema,
                    op,
                    format!("'{}' is a relation, not a field", name),
                ))
            }
            None => return Err(unknown_member(schema, name, op)),
        };
        if value.is_null() && !field.nullable {
            return Err(invalid_input(
                schema,
                op,
                format!("'{}' cannot be null", name),
            ));
        }
        value
            .check(field.ty)
            .map_err(|e| invalid_input(schema, op, format!("'{}': {}", name, e)))?;
    }
    Ok(())
}

fn validate_relations<'a>(
    schema: &'static EntitySchema,
    names: impl IntoIterator<Item = &'a String>,
    to_many: bool,
    op: RepositoryOperation,
) -> RepositoryResult<()> {
    for name in names {
        match schema.relation(name) {
            Some(relation) if relation.is_to_many() == to_many => {}
            Some(_) => {
                let expected = if to_many { "to-many" } else { "to-one" };
                return Err(invalid_input(
                    schema,
                    op,
                    format!("'{}' is not a {} relation", name, expected),
                ));
            }
            None => return Err(unknown_member(schema, name, op)),
        }
    }
    Ok(())
}
