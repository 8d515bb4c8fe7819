//! # rental-engine
//!
//! Generic query-and-relationship engine for a bike-rental data layer.
//!
//! Every entity (bikes, rentals, payments, users, user profiles and roles) is
//! served by one schema-driven repository over SQLite. The engine turns
//! declarative filters into parameterized SQL, reads and writes partial
//! updates under optimistic concurrency, and reconciles to-many relations
//! with `connect`, `disconnect` and `set`.
//!
//! ## Features
//!
//! - **Filtering**: typed operators validated against the entity schema
//! - **Find-many**: ordering, skip/take windows, counts and eager includes
//! - **Repository**: create, partial update, delete, existence checks
//! - **Relations**: atomic connect/disconnect/set with a reported outcome
//! - **Concurrency**: version-checked writes, lost races classified as
//!   not-found or conflict
//! - **Configuration**: figment layering of defaults, TOML files and `RENTAL_` env vars
//!
//! ## Example
//!
//! ```rust,no_run
//! use rental_engine::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> rental_engine::error::Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let pool = create_pool(&config.database).await?;
//!     let mut conn = pool.acquire().await?;
//!
//!     let bikes = EntityRepository::new(entities::bike::schema());
//!     let bike = bikes
//!         .create(&mut *conn, CreateInput::new().value("status", "Available"))
//!         .await?;
//!
//!     let rentals = EntityRepository::new(entities::rental::schema());
//!     let rental = rentals
//!         .create(&mut *conn, CreateInput::new().value("price", 12.5))
//!         .await?;
//!
//!     let outcome = bikes
//!         .connect(&mut *conn, bike.id(), "rentals", &[rental.id().to_string()])
//!         .await?;
//!     tracing::info!(linked = outcome.linked.len(), "rental attached");
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod entities;
pub mod error;
pub mod ids;
pub mod observability;
pub mod repository;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, DatabaseConfig, ServiceConfig};
    pub use crate::database::{create_pool, ensure_schema};
    pub use crate::entities;
    pub use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation, Error};
    pub use crate::ids::EntityId;
    pub use crate::observability::init_tracing;
    pub use crate::repository::{
        ConcurrencyGuard, CreateInput, EntityRepository, EntitySchema, FieldType,
        FilterCondition, FilterOperator, FilterValue, FindManyArgs, Meta, OrderBy,
        OrderDirection, Pagination, Patch, ReconcileOutcome, Record, RelationOp,
        RelationReconciler, RelationRepository, Repository, RepositoryError,
        RepositoryErrorKind, RepositoryOperation, RepositoryResult, Value, WhereExpression,
    };

    pub use sqlx::{SqliteConnection, SqlitePool};
}
