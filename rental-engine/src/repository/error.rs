//! Repository error types
//!
//! Every engine operation reports failures as a [`RepositoryError`] carrying
//! the operation that failed, a [`RepositoryErrorKind`], a message, and the
//! entity involved when one is known.
//!
//! # Example
//!
//! ```rust
//! use rental_engine::repository::{RepositoryError, RepositoryErrorKind};
//!
//! let error = RepositoryError::not_found("Bike", "bike_123");
//! assert!(matches!(error.kind, RepositoryErrorKind::NotFound));
//! assert_eq!(error.status_hint(), 404);
//! ```

use std::fmt;

/// Operation being performed when the repository error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryOperation {
    /// Finding a single entity by ID
    FindById,
    /// Finding multiple entities with a where expression
    FindMany,
    /// Counting entities matching a where expression
    Count,
    /// Checking if an entity exists
    Exists,
    /// Creating a new entity
    Create,
    /// Updating an existing entity
    Update,
    /// Deleting an entity
    Delete,
    /// Adding members to a to-many relation
    Connect,
    /// Removing members from a to-many relation
    Disconnect,
    /// Replacing the members of a to-many relation
    Set,
    /// Listing the members of a to-many relation
    FindRelated,
    /// Batch loading relation members for many parents
    BatchLoad,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FindById => write!(f, "find_by_id"),
            Self::FindMany => write!(f, "find_many"),
            Self::Count => write!(f, "count"),
            Self::Exists => write!(f, "exists"),
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Connect => write!(f, "connect"),
            Self::Disconnect => write!(f, "disconnect"),
            Self::Set => write!(f, "set"),
            Self::FindRelated => write!(f, "find_related"),
            Self::BatchLoad => write!(f, "batch_load"),
        }
    }
}

/// Category of repository error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryErrorKind {
    /// Entity was not found
    NotFound,
    /// A referenced entity in a relation operation does not exist
    RelatedEntityNotFound,
    /// Entity already exists (duplicate identifier)
    AlreadyExists,
    /// The row changed between read and write
    ConcurrencyConflict,
    /// Where expression or ordering does not fit the entity schema
    InvalidFilter,
    /// Database constraint violation
    ConstraintViolation,
    /// Validation failed before database operation
    ValidationFailed,
    /// Failed to connect to database
    ConnectionFailed,
    /// Underlying database error
    DatabaseError,
    /// Serialization or deserialization error
    SerializationError,
}

impl fmt::Display for RepositoryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::RelatedEntityNotFound => write!(f, "related_entity_not_found"),
            Self::AlreadyExists => write!(f, "already_exists"),
            Self::ConcurrencyConflict => write!(f, "concurrency_conflict"),
            Self::InvalidFilter => write!(f, "invalid_filter"),
            Self::ConstraintViolation => write!(f, "constraint_violation"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::DatabaseError => write!(f, "database_error"),
            Self::SerializationError => write!(f, "serialization_error"),
        }
    }
}

/// Structured repository error with operation context
///
/// # Example
///
/// ```rust
/// use rental_engine::repository::{RepositoryError, RepositoryOperation};
///
/// let error = RepositoryError::related_not_found(RepositoryOperation::Connect, "Rental", "rental_9");
/// println!("{}", error);
/// // "Repository related_entity_not_found error during connect: Related entity not found [Rental: rental_9]"
/// assert!(!error.is_retriable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryError {
    /// The operation being performed when the error occurred
    pub operation: RepositoryOperation,
    /// The category of error
    pub kind: RepositoryErrorKind,
    /// Human-readable error message
    pub message: String,
    /// The type of entity involved (e.g., "Bike", "Rental")
    pub entity_type: Option<String>,
    /// The ID of the entity involved
    pub entity_id: Option<String>,
}

impl RepositoryError {
    /// Create a new repository error
    pub fn new(
        operation: RepositoryOperation,
        kind: RepositoryErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            entity_type: None,
            entity_id: None,
        }
    }

    /// Create a "not found" error with entity context
    ///
    /// The operation defaults to `FindById`; use
    /// [`with_operation`](Self::with_operation) to attribute it elsewhere.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            operation: RepositoryOperation::FindById,
            kind: RepositoryErrorKind::NotFound,
            message: "Entity not found".to_string(),
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
        }
    }

    /// Create a "related entity not found" error
    ///
    /// `entity_type`/`entity_id` name the missing target, not the parent.
    pub fn related_not_found(
        operation: RepositoryOperation,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind: RepositoryErrorKind::RelatedEntityNotFound,
            message: "Related entity not found".to_string(),
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
        }
    }

    /// Create an "already exists" error with entity context
    pub fn already_exists(entity_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            operation: RepositoryOperation::Create,
            kind: RepositoryErrorKind::AlreadyExists,
            message: "Entity already exists".to_string(),
            entity_type: Some(entity_type.into()),
            entity_id: Some(identifier.into()),
        }
    }

    /// Create a concurrency conflict error
    pub fn concurrency_conflict(
        operation: RepositoryOperation,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind: RepositoryErrorKind::ConcurrencyConflict,
            message: "Entity was modified concurrently".to_string(),
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
        }
    }

    /// Create an invalid filter error
    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self {
            operation: RepositoryOperation::FindMany,
            kind: RepositoryErrorKind::InvalidFilter,
            message: message.into(),
            entity_type: None,
            entity_id: None,
        }
    }

    /// Create a validation failed error
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self {
            operation: RepositoryOperation::Create,
            kind: RepositoryErrorKind::ValidationFailed,
            message: message.into(),
            entity_type: None,
            entity_id: None,
        }
    }

    /// Add entity context to an existing error
    #[must_use]
    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Set the operation that caused the error
    #[must_use]
    pub fn with_operation(mut self, operation: RepositoryOperation) -> Self {
        self.operation = operation;
        self
    }

    /// Check if this error is retriable (transient errors that may succeed on retry)
    ///
    /// Concurrency conflicts are not retriable: the caller must re-read
    /// and decide.
    pub fn is_retriable(&self) -> bool {
        self.kind == RepositoryErrorKind::ConnectionFailed
    }

    /// Suggested HTTP status code for the calling layer
    ///
    /// ```rust
    /// use rental_engine::repository::RepositoryError;
    ///
    /// assert_eq!(RepositoryError::already_exists("Bike", "bike_1").status_hint(), 409);
    /// assert_eq!(RepositoryError::invalid_filter("unknown field").status_hint(), 400);
    /// ```
    pub fn status_hint(&self) -> u16 {
        match self.kind {
            RepositoryErrorKind::NotFound => 404,
            RepositoryErrorKind::AlreadyExists
            | RepositoryErrorKind::ConcurrencyConflict
            | RepositoryErrorKind::ConstraintViolation => 409,
            RepositoryErrorKind::RelatedEntityNotFound
            | RepositoryErrorKind::InvalidFilter
            | RepositoryErrorKind::ValidationFailed => 400,
            RepositoryErrorKind::ConnectionFailed => 503,
            RepositoryErrorKind::DatabaseError | RepositoryErrorKind::SerializationError => 500,
        }
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Repository {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        if let (Some(ref entity_type), Some(ref entity_id)) = (&self.entity_type, &self.entity_id) {
            write!(f, " [{}: {}]", entity_type, entity_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for RepositoryError {}

/// Result alias used throughout the repository layer
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Attribute store errors to the repository operation that hit them
pub(crate) trait SqlResultExt<T> {
    fn during(self, operation: RepositoryOperation) -> RepositoryResult<T>;
}

impl<T> SqlResultExt<T> for Result<T, sqlx::Error> {
    fn during(self, operation: RepositoryOperation) -> RepositoryResult<T> {
        self.map_err(|e| RepositoryError::from(e).with_operation(operation))
    }
}
