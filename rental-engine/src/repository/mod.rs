//! Generic query-and-relationship engine
//!
//! One [`EntityRepository`] serves every entity, configured by a static
//! [`EntitySchema`]. It provides:
//!
//! - **Filtering**: [`WhereExpression`] built from [`FilterCondition`]s or
//!   parsed from JSON, validated against the schema before any store access
//! - **Find-many**: [`FindManyArgs`] with multi-key [`OrderBy`],
//!   [`Pagination`] and eager loading of to-many relations
//! - **CRUD**: the [`Repository`] trait, with [`CreateInput`] and partial
//!   [`Patch`] inputs
//! - **Relations**: the [`RelationRepository`] trait and the
//!   [`RelationReconciler`] behind `connect`, `disconnect` and `set`
//! - **Optimistic concurrency**: the [`ConcurrencyGuard`] classifying lost
//!   races as `NotFound` or `ConcurrencyConflict`
//!
//! # Example
//!
//! ```rust,no_run
//! use rental_engine::entities;
//! use rental_engine::repository::{
//!     EntityRepository, FilterCondition, FindManyArgs, OrderBy, Repository, WhereExpression,
//! };
//!
//! # async fn example(conn: &mut sqlx::SqliteConnection) -> rental_engine::repository::RepositoryResult<()> {
//! let rentals = EntityRepository::new(entities::rental::schema());
//! let args = FindManyArgs::new()
//!     .filter(WhereExpression::new().and(FilterCondition::gte("price", 10.0)))
//!     .order_by(OrderBy::desc("startTime"))
//!     .take(20)
//!     .include("payments");
//!
//! let page = rentals.find_many(conn, &args).await?;
//! let meta = rentals.meta(conn, &args.filter).await?;
//! println!("{} of {}", page.len(), meta.count);
//! # Ok(())
//! # }
//! ```

mod error;
mod filter;
mod guard;
mod pagination;
mod query;
mod record;
mod relation;
mod schema;
mod store;
mod traits;
mod value;

// Re-export all public types
pub use error::{RepositoryError, RepositoryErrorKind, RepositoryOperation, RepositoryResult};
pub use filter::{CompiledWhere, FilterCondition, FilterOperator, FilterValue, WhereExpression};
pub use guard::ConcurrencyGuard;
pub use pagination::{OrderBy, OrderDirection, Pagination};
pub use query::{CompiledQuery, FindManyArgs, Meta};
pub use record::{CreateInput, Patch, Record};
pub use relation::{plan, ReconcileOutcome, RelationOp, RelationReconciler};
pub use schema::{EntitySchema, FieldDef, Generated, Member, Membership, RelationDef, RelationKind};
pub use store::EntityRepository;
pub use traits::{RelationRepository, Repository};
pub use value::{FieldType, Value};
