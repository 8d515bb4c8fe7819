//! Ordering and pagination for find-many queries
//!
//! # Example
//!
//! ```rust
//! use rental_engine::repository::{OrderBy, OrderDirection, Pagination};
//!
//! // Skip one row, return at most two
//! let pagination = Pagination::new(1, Some(2));
//!
//! // Newest first, then by model
//! let order = vec![OrderBy::desc("createdAt"), OrderBy::asc("model")];
//! assert_eq!(order[0].direction, OrderDirection::Descending);
//! ```

use std::fmt;
use std::str::FromStr;

/// Direction for ordering results
///
/// # Example
///
/// ```rust
/// use rental_engine::repository::OrderDirection;
///
/// assert_eq!(format!("{}", OrderDirection::Ascending), "asc");
/// assert_eq!("Desc".parse::<OrderDirection>(), Ok(OrderDirection::Descending));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    /// Sort in ascending order (A-Z, 0-9)
    #[default]
    Ascending,
    /// Sort in descending order (Z-A, 9-0)
    Descending,
}

impl OrderDirection {
    /// SQL keyword for this direction
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascending => write!(f, "asc"),
            Self::Descending => write!(f, "desc"),
        }
    }
}

impl FromStr for OrderDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Ascending),
            "desc" => Ok(Self::Descending),
            other => Err(format!("unknown sort direction '{}'", other)),
        }
    }
}

/// One key of a multi-key sort
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Public field name (or to-one relation name)
    pub field: String,
    /// Sort direction
    pub direction: OrderDirection,
}

impl OrderBy {
    /// Create a sort key
    pub fn new(field: impl Into<String>, direction: OrderDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Ascending sort key
    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, OrderDirection::Ascending)
    }

    /// Descending sort key
    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, OrderDirection::Descending)
    }
}

/// Skip/take window over an ordered result
///
/// `take: None` means unbounded.
///
/// # Example
///
/// ```rust
/// use rental_engine::repository::Pagination;
///
/// let window = Pagination::new(40, Some(20));
/// assert_eq!(window.limit_offset(), (20, 40));
///
/// assert_eq!(Pagination::default().take, None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pagination {
    /// Number of results to skip
    pub skip: u64,
    /// Maximum number of results to return
    pub take: Option<u64>,
}

impl Pagination {
    /// Create new pagination parameters
    #[must_use]
    pub const fn new(skip: u64, take: Option<u64>) -> Self {
        Self { skip, take }
    }

    /// `LIMIT` and `OFFSET` operands for SQLite
    ///
    /// SQLite treats a negative limit as unbounded; values beyond `i64::MAX`
    /// saturate.
    #[must_use]
    pub fn limit_offset(&self) -> (i64, i64) {
        let limit = self
            .take
            .map_or(-1, |t| i64::try_from(t).unwrap_or(i64::MAX));
        let offset = i64::try_from(self.skip).unwrap_or(i64::MAX);
        (limit, offset)
    }
}
