//! Where expressions
//!
//! A [`WhereExpression`] is a conjunction of [`FilterCondition`]s. It is
//! schema-agnostic until [`compile`](WhereExpression::compile)d against an
//! [`EntitySchema`], which validates every field, operator and operand and
//! yields a [`CompiledWhere`] ready to be appended to a query. Nothing
//! reaches the store before compilation succeeds.
//!
//! # Example
//!
//! ```rust
//! use rental_engine::entities;
//! use rental_engine::repository::{FilterCondition, WhereExpression};
//! use serde_json::json;
//!
//! let built = WhereExpression::new()
//!     .and(FilterCondition::starts_with("location", "Dock"))
//!     .and(FilterCondition::eq("status", "Available"));
//!
//! // JSON keys are visited in sorted order
//! let parsed = WhereExpression::from_json(
//!     entities::bike::schema(),
//!     &json!({"location": {"startsWith": "Dock"}, "status": "Available"}),
//! )
//! .unwrap();
//!
//! assert_eq!(built, parsed);
//! ```

use std::fmt;

use sqlx::{QueryBuilder, Sqlite};

use super::error::{RepositoryError, RepositoryResult};
use super::schema::{EntitySchema, FieldDef, Member, Membership, RelationKind};
use super::value::{FieldType, Value};

/// Comparison operators for filter conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// Equal to
    Equal,
    /// Not equal to (a missing value counts as different)
    NotEqual,
    /// Greater than
    GreaterThan,
    /// Greater than or equal to
    GreaterThanOrEqual,
    /// Less than
    LessThan,
    /// Less than or equal to
    LessThanOrEqual,
    /// Substring match
    Contains,
    /// Prefix match
    StartsWith,
    /// Suffix match
    EndsWith,
    /// Value is one of a list
    In,
    /// Value is none of a list
    NotIn,
    /// Value is absent
    IsNull,
    /// Value is present
    IsNotNull,
}

impl FilterOperator {
    fn is_ordering(self) -> bool {
        matches!(
            self,
            Self::GreaterThan | Self::GreaterThanOrEqual | Self::LessThan | Self::LessThanOrEqual
        )
    }

    fn is_textual(self) -> bool {
        matches!(self, Self::Contains | Self::StartsWith | Self::EndsWith)
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        let op = match keyword {
            "equals" => Self::Equal,
            "not" => Self::NotEqual,
            "gt" | "greaterThan" => Self::GreaterThan,
            "gte" | "greaterThanOrEqual" => Self::GreaterThanOrEqual,
            "lt" | "lessThan" => Self::LessThan,
            "lte" | "lessThanOrEqual" => Self::LessThanOrEqual,
            "contains" => Self::Contains,
            "startsWith" => Self::StartsWith,
            "endsWith" => Self::EndsWith,
            "in" => Self::In,
            "notIn" => Self::NotIn,
            _ => return None,
        };
        Some(op)
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = match self {
            Self::Equal => "equals",
            Self::NotEqual => "not",
            Self::GreaterThan => "gt",
            Self::GreaterThanOrEqual => "gte",
            Self::LessThan => "lt",
            Self::LessThanOrEqual => "lte",
            Self::Contains => "contains",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::In => "in",
            Self::NotIn => "notIn",
            Self::IsNull => "isNull",
            Self::IsNotNull => "isNotNull",
        };
        f.write_str(keyword)
    }
}

/// Operand of a filter condition
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// A single value
    Single(Value),
    /// A list of values (for `in`/`notIn`)
    List(Vec<Value>),
    /// No operand (for `isNull`/`isNotNull`)
    None,
}

/// A single filter condition
///
/// For a to-one relation the operand is the related identifier. For a
/// to-many relation the condition holds when some linked member has the
/// given identifier (`equals`/`in`), when none has (`not`/`notIn`), or when
/// the relation is empty (`isNull`) or non-empty (`isNotNull`).
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCondition {
    /// Public field or relation name
    pub field: String,
    /// The comparison operator
    pub operator: FilterOperator,
    /// The value to compare against
    pub value: FilterValue,
}

impl FilterCondition {
    /// Create a new filter condition
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: FilterValue) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    fn single(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self::new(field, operator, FilterValue::Single(value.into()))
    }

    fn list<V: Into<Value>>(
        field: impl Into<String>,
        operator: FilterOperator,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        Self::new(field, operator, FilterValue::List(values))
    }

    /// `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, FilterOperator::Equal, value)
    }

    /// `field != value`
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, FilterOperator::NotEqual, value)
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, FilterOperator::GreaterThan, value)
    }

    /// `field >= value`
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, FilterOperator::GreaterThanOrEqual, value)
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, FilterOperator::LessThan, value)
    }

    /// `field <= value`
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::single(field, FilterOperator::LessThanOrEqual, value)
    }

    /// Substring match
    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::single(field, FilterOperator::Contains, needle.into())
    }

    /// Prefix match
    pub fn starts_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::single(field, FilterOperator::StartsWith, prefix.into())
    }

    /// Suffix match
    pub fn ends_with(field: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self::single(field, FilterOperator::EndsWith, suffix.into())
    }

    /// Value is one of `values`
    pub fn in_list<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::list(field, FilterOperator::In, values)
    }

    /// Value is none of `values`
    pub fn not_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::list(field, FilterOperator::NotIn, values)
    }

    /// Value is absent
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::IsNull, FilterValue::None)
    }

    /// Value is present
    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::IsNotNull, FilterValue::None)
    }
}

/// A conjunction of filter conditions
///
/// An empty expression matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereExpression {
    /// Conditions, all of which must hold
    pub conditions: Vec<FilterCondition>,
}

impl WhereExpression {
    /// An expression that matches everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition
    #[must_use]
    pub fn and(mut self, condition: FilterCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Whether the expression imposes no constraint
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Parse a JSON where object
    ///
    /// Each key names a field or relation. A scalar value is shorthand for
    /// `equals`; an object holds operator keywords (`equals`, `not`, `gt`,
    /// `gte`, `lt`, `lte`, `contains`, `startsWith`, `endsWith`, `in`,
    /// `notIn`, `isNull`). The comparisons also go by `greaterThan`,
    /// `greaterThanOrEqual`, `lessThan` and `lessThanOrEqual`. Relations take
    /// `{"id": <operand>}` or `null`.
    pub fn from_json(
        schema: &'static EntitySchema,
        json: &serde_json::Value,
    ) -> RepositoryResult<Self> {
        let object = match json {
            serde_json::Value::Null => return Ok(Self::new()),
            serde_json::Value::Object(object) => object,
            _ => {
                return Err(RepositoryError::invalid_filter(format!(
                    "where clause for {} must be an object",
                    schema.name
                )))
            }
        };

        let mut expression = Self::new();
        for (key, operand) in object {
            let member = schema.resolve(key).ok_or_else(|| unknown_field(schema, key))?;
            let ty = match member {
                Member::Id => FieldType::String,
                Member::Field(field) => field.ty,
                Member::Relation(_) => {
                    match operand {
                        serde_json::Value::Null => {
                            expression = expression.and(FilterCondition::is_null(key.as_str()));
                            continue;
                        }
                        serde_json::Value::Object(inner) if inner.len() == 1 => {
                            if let Some(id_operand) = inner.get("id") {
                                parse_operand(key, FieldType::String, id_operand, &mut expression)?;
                                continue;
                            }
                        }
                        _ => {}
                    }
                    return Err(RepositoryError::invalid_filter(format!(
                        "relation filter '{}' must be {{\"id\": ...}} or null",
                        key
                    )));
                }
            };
            parse_operand(key, ty, operand, &mut expression)?;
        }
        Ok(expression)
    }

    /// Validate against `schema` and produce a compiled predicate
    pub fn compile(&self, schema: &'static EntitySchema) -> RepositoryResult<CompiledWhere> {
        let predicates = self
            .conditions
            .iter()
            .map(|condition| compile_condition(schema, condition))
            .collect::<RepositoryResult<Vec<_>>>()?;
        tracing::debug!(
            entity = schema.name,
            clauses = predicates.len(),
            "compiled where expression"
        );
        Ok(CompiledWhere { predicates })
    }
}

fn unknown_field(schema: &EntitySchema, name: &str) -> RepositoryError {
    RepositoryError::invalid_filter(format!("unknown field '{}' on {}", name, schema.name))
}

fn parse_operand(
    field: &str,
    ty: FieldType,
    operand: &serde_json::Value,
    expression: &mut WhereExpression,
) -> RepositoryResult<()> {
    let invalid = |message: String| {
        RepositoryError::invalid_filter(format!("filter on '{}': {}", field, message))
    };
    let scalar = |json: &serde_json::Value, op: FilterOperator| {
        // Substring operands are plain text even for enum fields
        let operand_ty = if op.is_textual() { FieldType::String } else { ty };
        Value::from_json(operand_ty, json).map_err(invalid)
    };

    let object = match operand {
        serde_json::Value::Object(object) => object,
        serde_json::Value::Array(_) => {
            return Err(invalid("arrays are only valid under 'in'/'notIn'".to_string()))
        }
        serde_json::Value::Null => {
            expression.conditions.push(FilterCondition::is_null(field));
            return Ok(());
        }
        _ => {
            let value = scalar(operand, FilterOperator::Equal)?;
            expression
                .conditions
                .push(FilterCondition::new(field, FilterOperator::Equal, FilterValue::Single(value)));
            return Ok(());
        }
    };

    for (keyword, json) in object {
        if keyword == "isNull" {
            let condition = match json.as_bool() {
                Some(true) => FilterCondition::is_null(field),
                Some(false) => FilterCondition::is_not_null(field),
                None => return Err(invalid("'isNull' takes a boolean".to_string())),
            };
            expression.conditions.push(condition);
            continue;
        }

        let op = FilterOperator::from_keyword(keyword)
            .ok_or_else(|| invalid(format!("unknown operator '{}'", keyword)))?;
        let condition = match (op, json) {
            (FilterOperator::Equal, serde_json::Value::Null) => FilterCondition::is_null(field),
            (FilterOperator::NotEqual, serde_json::Value::Null) => {
                FilterCondition::is_not_null(field)
            }
            (FilterOperator::In | FilterOperator::NotIn, serde_json::Value::Array(items)) => {
                let values = items
                    .iter()
                    .map(|item| scalar(item, op))
                    .collect::<RepositoryResult<Vec<_>>>()?;
                FilterCondition::new(field, op, FilterValue::List(values))
            }
            (FilterOperator::In | FilterOperator::NotIn, _) => {
                return Err(invalid(format!("'{}' takes an array", op)))
            }
            (_, serde_json::Value::Object(_) | serde_json::Value::Array(_)) => {
                return Err(invalid(format!("'{}' takes a scalar", op)))
            }
            (op, json) => FilterCondition::new(field, op, FilterValue::Single(scalar(json, op)?)),
        };
        expression.conditions.push(condition);
    }
    Ok(())
}

/// What a condition constrains once resolved against a schema
#[derive(Debug, Clone, Copy)]
enum Target {
    Column {
        column: &'static str,
        ty: FieldType,
        nullable: bool,
    },
    Members(Membership),
}

/// Resolved test applied to a single column
#[derive(Debug, Clone, PartialEq)]
enum Test {
    Compare(&'static str, Value),
    NotEqual(Value),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone)]
enum Predicate {
    /// A test on a column of the queried table
    Column { column: &'static str, test: Test },
    /// `[NOT] EXISTS` over the members of a to-many relation
    Members {
        membership: Membership,
        negated: bool,
        test: Option<Test>,
    },
    /// Restrict to the members of a parent's to-many relation
    MemberOf {
        membership: Membership,
        parent_id: String,
    },
}

/// A validated where expression bound to one schema
///
/// The queried table is always aliased `t`.
#[derive(Debug, Clone, Default)]
pub struct CompiledWhere {
    predicates: Vec<Predicate>,
}

impl CompiledWhere {
    /// Restrict results to the members of a parent's to-many relation
    ///
    /// `membership` comes from the parent's relation; the compiled
    /// expression must target that relation's entity.
    #[must_use]
    pub(crate) fn member_of(mut self, membership: Membership, parent_id: &str) -> Self {
        self.predicates.push(Predicate::MemberOf {
            membership,
            parent_id: parent_id.to_string(),
        });
        self
    }

    /// Append ` WHERE ...` (or nothing) to `builder`
    pub(crate) fn push_to(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        for (i, predicate) in self.predicates.iter().enumerate() {
            builder.push(if i == 0 { " WHERE " } else { " AND " });
            push_predicate(builder, predicate);
        }
    }
}

fn compile_condition(
    schema: &'static EntitySchema,
    condition: &FilterCondition,
) -> RepositoryResult<Predicate> {
    let name = condition.field.as_str();
    let target = match schema.resolve(name).ok_or_else(|| unknown_field(schema, name))? {
        Member::Id => Target::Column {
            column: "id",
            ty: FieldType::String,
            nullable: false,
        },
        Member::Field(FieldDef {
            column,
            ty,
            nullable,
            ..
        }) => Target::Column {
            column,
            ty: *ty,
            nullable: *nullable,
        },
        Member::Relation(relation) => match relation.kind {
            RelationKind::ToOne { column } => Target::Column {
                column,
                ty: FieldType::String,
                nullable: true,
            },
            RelationKind::Inverse { .. } | RelationKind::Join { .. } => {
                match relation.membership() {
                    Some(membership) => Target::Members(membership),
                    None => return Err(unknown_field(schema, name)),
                }
            }
        },
    };

    let invalid = |message: String| {
        RepositoryError::invalid_filter(format!(
            "filter on {}.{}: {}",
            schema.name, name, message
        ))
    };

    match target {
        Target::Column {
            column,
            ty,
            nullable,
        } => {
            if !ty.is_filterable() {
                return Err(invalid(format!("{} fields cannot be filtered", ty)));
            }
            let test = column_test(condition, ty, nullable).map_err(invalid)?;
            Ok(Predicate::Column { column, test })
        }
        Target::Members(membership) => {
            let op = condition.operator;
            if op.is_ordering() || op.is_textual() {
                return Err(invalid(format!(
                    "'{}' is not supported on to-many relations",
                    op
                )));
            }
            let (negated, test) = match column_test(condition, FieldType::String, true)
                .map_err(invalid)?
            {
                Test::NotEqual(value) => (true, Some(Test::Compare("=", value))),
                Test::NotIn(values) => (true, Some(Test::In(values))),
                Test::IsNull => (true, None),
                Test::IsNotNull => (false, None),
                test => (false, Some(test)),
            };
            Ok(Predicate::Members {
                membership,
                negated,
                test,
            })
        }
    }
}

fn column_test(
    condition: &FilterCondition,
    ty: FieldType,
    nullable: bool,
) -> Result<Test, String> {
    let op = condition.operator;
    let single = || match &condition.value {
        FilterValue::Single(value) => Ok(value.clone()),
        _ => Err(format!("'{}' takes a single value", op)),
    };
    let typed = |value: &Value| {
        if value.is_null() {
            return Err(format!("'{}' does not accept null", op));
        }
        value.check(ty)
    };

    let test = match op {
        FilterOperator::Equal | FilterOperator::NotEqual => {
            let value = single()?;
            if value.is_null() {
                if !nullable {
                    return Err("field is not nullable".to_string());
                }
                if op == FilterOperator::Equal {
                    Test::IsNull
                } else {
                    Test::IsNotNull
                }
            } else {
                typed(&value)?;
                if op == FilterOperator::Equal {
                    Test::Compare("=", value)
                } else {
                    Test::NotEqual(value)
                }
            }
        }
        op if op.is_ordering() => {
            if !ty.is_ordered() {
                return Err(format!("'{}' is not supported on {} fields", op, ty));
            }
            let value = single()?;
            typed(&value)?;
            let sql = match op {
                FilterOperator::GreaterThan => ">",
                FilterOperator::GreaterThanOrEqual => ">=",
                FilterOperator::LessThan => "<",
                _ => "<=",
            };
            Test::Compare(sql, value)
        }
        op if op.is_textual() => {
            if !ty.is_textual() {
                return Err(format!("'{}' is not supported on {} fields", op, ty));
            }
            let text = match single()? {
                Value::String(text) => text,
                other => return Err(format!("'{}' takes a string, got {}", op, other.kind_name())),
            };
            match op {
                FilterOperator::Contains => Test::Contains(text),
                FilterOperator::StartsWith => Test::StartsWith(text),
                _ => Test::EndsWith(text),
            }
        }
        FilterOperator::In | FilterOperator::NotIn => {
            let values = match &condition.value {
                FilterValue::List(values) => values.clone(),
                _ => return Err(format!("'{}' takes a list of values", op)),
            };
            values.iter().try_for_each(typed)?;
            if op == FilterOperator::In {
                Test::In(values)
            } else {
                Test::NotIn(values)
            }
        }
        FilterOperator::IsNull | FilterOperator::IsNotNull => {
            if !nullable {
                return Err("field is not nullable".to_string());
            }
            if op == FilterOperator::IsNull {
                Test::IsNull
            } else {
                Test::IsNotNull
            }
        }
        _ => return Err(format!("unsupported operator '{}'", op)),
    };
    Ok(test)
}

fn push_test(builder: &mut QueryBuilder<'_, Sqlite>, column: &str, test: &Test) {
    match test {
        Test::Compare(op, value) => {
            builder.push(format_args!("{} {} ", column, op));
            value.push_bind(builder);
        }
        Test::NotEqual(value) => {
            builder.push(format_args!("{} IS NOT ", column));
            value.push_bind(builder);
        }
        Test::Contains(text) => {
            builder.push(format_args!("instr({}, ", column));
            builder.push_bind(text.clone());
            builder.push(") > 0");
        }
        Test::StartsWith(text) => {
            builder.push(format_args!("instr({}, ", column));
            builder.push_bind(text.clone());
            builder.push(") = 1");
        }
        Test::EndsWith(text) if text.is_empty() => {
            builder.push(format_args!("{} IS NOT NULL", column));
        }
        Test::EndsWith(text) => {
            builder.push(format_args!("substr({}, -length(", column));
            builder.push_bind(text.clone());
            builder.push(")) = ");
            builder.push_bind(text.clone());
        }
        Test::In(values) if values.is_empty() => {
            builder.push("0 = 1");
        }
        Test::In(values) => {
            builder.push(format_args!("{} IN (", column));
            push_list(builder, values);
            builder.push(")");
        }
        Test::NotIn(values) if values.is_empty() => {
            builder.push("1 = 1");
        }
        Test::NotIn(values) => {
            builder.push(format_args!("({} IS NULL OR {} NOT IN (", column, column));
            push_list(builder, values);
            builder.push("))");
        }
        Test::IsNull => {
            builder.push(format_args!("{} IS NULL", column));
        }
        Test::IsNotNull => {
            builder.push(format_args!("{} IS NOT NULL", column));
        }
    }
}

fn push_list(builder: &mut QueryBuilder<'_, Sqlite>, values: &[Value]) {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        value.push_bind(builder);
    }
}

fn push_predicate(builder: &mut QueryBuilder<'_, Sqlite>, predicate: &Predicate) {
    match predicate {
        Predicate::Column { column, test } => {
            push_test(builder, &format!("t.{}", column), test);
        }
        Predicate::Members {
            membership,
            negated,
            test,
        } => {
            if *negated {
                builder.push("NOT ");
            }
            builder.push(format_args!(
                "EXISTS (SELECT 1 FROM {} AS m WHERE m.{} = t.id",
                membership.table, membership.parent_column
            ));
            if let Some(test) = test {
                builder.push(" AND ");
                push_test(builder, &format!("m.{}", membership.member_column), test);
            }
            builder.push(")");
        }
        Predicate::MemberOf {
            membership,
            parent_id,
        } => {
            if membership.inverse {
                builder.push(format_args!("t.{} = ", membership.parent_column));
                builder.push_bind(parent_id.clone());
            } else {
                builder.push(format_args!(
                    "t.id IN (SELECT {} FROM {} WHERE {} = ",
                    membership.member_column, membership.table, membership.parent_column
                ));
                builder.push_bind(parent_id.clone());
                builder.push(")");
            }
        }
    }
}
