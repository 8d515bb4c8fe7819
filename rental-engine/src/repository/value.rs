//! Field values and semantic field types
//!
//! The engine never interprets what an attribute means, only its
//! [`FieldType`]. Every attribute value travelling through the engine is a
//! [`Value`], whether it was read from a row, supplied in a create/update
//! request, or used as a filter operand.
//!
//! # Storage mapping
//!
//! | `FieldType` | SQLite column | Bound as |
//! |-------------|---------------|----------|
//! | `String`    | `TEXT`        | `String` |
//! | `Number`    | `REAL`        | `f64`    |
//! | `Boolean`   | `INTEGER`     | `bool`   |
//! | `Timestamp` | `INTEGER`     | epoch milliseconds (`i64`) |
//! | `Enum`      | `TEXT`        | `String` |
//! | `Json`      | `TEXT`        | serialized JSON |

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

/// Semantic type of an entity attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Free-form text
    String,
    /// Floating point number
    Number,
    /// True/false flag
    Boolean,
    /// Point in time (UTC)
    Timestamp,
    /// One of a fixed set of string values
    Enum(&'static [&'static str]),
    /// Arbitrary JSON document
    Json,
}

impl FieldType {
    /// SQLite column affinity used when emitting DDL
    #[must_use]
    pub const fn sql_type(&self) -> &'static str {
        match self {
            Self::String | Self::Enum(_) | Self::Json => "TEXT",
            Self::Number => "REAL",
            Self::Boolean | Self::Timestamp => "INTEGER",
        }
    }

    /// Whether `lt`/`lte`/`gt`/`gte` are meaningful for this type
    #[must_use]
    pub const fn is_ordered(&self) -> bool {
        matches!(self, Self::String | Self::Number | Self::Timestamp)
    }

    /// Whether substring matching is meaningful for this type
    #[must_use]
    pub const fn is_textual(&self) -> bool {
        matches!(self, Self::String | Self::Enum(_))
    }

    /// Whether the type can appear in a filter at all
    #[must_use]
    pub const fn is_filterable(&self) -> bool {
        !matches!(self, Self::Json)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Number => write!(f, "number"),
            Self::Boolean => write!(f, "boolean"),
            Self::Timestamp => write!(f, "timestamp"),
            Self::Enum(_) => write!(f, "enum"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// A single attribute value
///
/// # Example
///
/// ```rust
/// use rental_engine::repository::Value;
///
/// let model: Value = "Brompton".into();
/// let price: Value = 12.5.into();
/// let missing: Value = Option::<String>::None.into();
///
/// assert_eq!(model.as_str(), Some("Brompton"));
/// assert_eq!(price, Value::Number(12.5));
/// assert!(missing.is_null());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value (SQL `NULL`)
    Null,
    /// Text, also used for enum members
    String(String),
    /// Floating point number
    Number(f64),
    /// Boolean flag
    Boolean(bool),
    /// UTC timestamp
    Timestamp(DateTime<Utc>),
    /// JSON document
    Json(serde_json::Value),
}

impl Value {
    /// Returns `true` for [`Value::Null`] and a JSON `null`
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null | Self::Json(serde_json::Value::Null))
    }

    /// Borrow the text of a `String` value
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The number inside a `Number` value
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The flag inside a `Boolean` value
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// The instant inside a `Timestamp` value
    #[must_use]
    pub const fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Short name of the variant, used in error messages
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Boolean(_) => "boolean",
            Self::Timestamp(_) => "timestamp",
            Self::Json(_) => "json",
        }
    }

    /// Check that a non-null value fits the given field type
    ///
    /// `Null` always passes here; nullability is checked by the caller,
    /// which knows whether the field accepts it.
    pub fn check(&self, ty: FieldType) -> Result<(), String> {
        let ok = match (ty, self) {
            (_, Self::Null) => true,
            (FieldType::String, Self::String(_)) => true,
            (FieldType::Number, Self::Number(_)) => true,
            (FieldType::Boolean, Self::Boolean(_)) => true,
            (FieldType::Timestamp, Self::Timestamp(_)) => true,
            (FieldType::Json, Self::Json(doc)) => {
                if !(doc.is_object() || doc.is_array()) {
                    return Err(format!(
                        "expected json object or array, got JSON {}",
                        json_kind(doc)
                    ));
                }
                true
            }
            (FieldType::Enum(members), Self::String(s)) => {
                if !members.contains(&s.as_str()) {
                    return Err(format!(
                        "'{}' is not one of [{}]",
                        s,
                        members.join(", ")
                    ));
                }
                true
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("expected {}, got {}", ty, self.kind_name()))
        }
    }

    /// Convert a JSON operand into a value of the given field type
    ///
    /// Timestamps are accepted as RFC 3339 strings or epoch milliseconds.
    pub fn from_json(ty: FieldType, json: &serde_json::Value) -> Result<Self, String> {
        use serde_json::Value as J;

        let value = match (ty, json) {
            (_, J::Null) => Self::Null,
            (FieldType::Json, doc @ (J::Object(_) | J::Array(_))) => Self::Json(doc.clone()),
            (FieldType::String | FieldType::Enum(_), J::String(s)) => Self::String(s.clone()),
            (FieldType::Number, J::Number(n)) => n
                .as_f64()
                .map(Self::Number)
                .ok_or_else(|| format!("number {} is out of range", n))?,
            (FieldType::Boolean, J::Bool(b)) => Self::Boolean(*b),
            (FieldType::Timestamp, J::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| Self::Timestamp(t.with_timezone(&Utc)))
                .map_err(|e| format!("invalid timestamp '{}': {}", s, e))?,
            (FieldType::Timestamp, J::Number(n)) => n
                .as_i64()
                .and_then(DateTime::from_timestamp_millis)
                .map(Self::Timestamp)
                .ok_or_else(|| format!("invalid epoch milliseconds {}", n))?,
            (ty, other) => {
                return Err(format!("expected {}, got JSON {}", ty, json_kind(other)));
            }
        };
        value.check(ty)?;
        Ok(value)
    }

    /// Append this value as a bound parameter
    pub(crate) fn push_bind(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        match self {
            Self::Null => {
                builder.push_bind(Option::<String>::None);
            }
            Self::String(s) => {
                builder.push_bind(s.clone());
            }
            Self::Number(n) => {
                builder.push_bind(*n);
            }
            Self::Boolean(b) => {
                builder.push_bind(*b);
            }
            Self::Timestamp(t) => {
                builder.push_bind(t.timestamp_millis());
            }
            Self::Json(serde_json::Value::Null) => {
                builder.push_bind(Option::<String>::None);
            }
            Self::Json(v) => {
                builder.push_bind(v.to_string());
            }
        }
    }

    /// Read a column of the given type from a row
    pub(crate) fn decode(row: &SqliteRow, column: &str, ty: FieldType) -> Result<Self, sqlx::Error> {
        let value = match ty {
            FieldType::String | FieldType::Enum(_) => row
                .try_get::<Option<String>, _>(column)?
                .map_or(Self::Null, Self::String),
            FieldType::Number => row
                .try_get::<Option<f64>, _>(column)?
                .map_or(Self::Null, Self::Number),
            FieldType::Boolean => row
                .try_get::<Option<bool>, _>(column)?
                .map_or(Self::Null, Self::Boolean),
            FieldType::Timestamp => match row.try_get::<Option<i64>, _>(column)? {
                None => Self::Null,
                Some(ms) => DateTime::from_timestamp_millis(ms)
                    .map(Self::Timestamp)
                    .ok_or_else(|| {
                        sqlx::Error::Decode(
                            format!("column {} holds out-of-range timestamp {}", column, ms).into(),
                        )
                    })?,
            },
            FieldType::Json => match row.try_get::<Option<String>, _>(column)? {
                None => Self::Null,
                Some(text) => serde_json::from_str(&text)
                    .map(Self::Json)
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            },
        };
        Ok(value)
    }
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::String(s) => serializer.serialize_str(s),
            Self::Number(n) => serializer.serialize_f64(*n),
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Timestamp(t) => t.serialize(serializer),
            Self::Json(v) => v.serialize(serializer),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Timestamp(t)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
