//! Repository trait definitions
//!
//! This module provides generic traits for store access using RPITIT
//! (Return Position Impl Trait In Traits), available since Rust 1.75.
//!
//! # Overview
//!
//! - [`Repository`]: find/count/create/update/delete for one entity
//! - [`RelationRepository`]: to-many relation changes and traversal
//!
//! Every operation takes the connection it runs on explicitly, so callers
//! decide whether it is a pooled connection or an open transaction.
//!
//! # Example
//!
//! ```rust,no_run
//! use rental_engine::entities;
//! use rental_engine::repository::{
//!     EntityRepository, FindManyArgs, OrderBy, RelationRepository, Repository,
//! };
//!
//! # async fn example(conn: &mut sqlx::SqliteConnection) -> rental_engine::repository::RepositoryResult<()> {
//! let bikes = EntityRepository::new(entities::bike::schema());
//!
//! let page = bikes
//!     .find_many(conn, &FindManyArgs::new().order_by(OrderBy::desc("createdAt")).take(20))
//!     .await?;
//!
//! let outcome = bikes
//!     .connect(conn, "bike_1", "rentals", &["rental_7".to_string()])
//!     .await?;
//! println!("{} bikes, linked {:?}", page.len(), outcome.linked);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;

use super::error::RepositoryResult;
use super::filter::WhereExpression;
use super::query::FindManyArgs;
use super::relation::ReconcileOutcome;

/// Base repository trait for CRUD operations
///
/// # Type Parameters
///
/// - `Id`: The identifier type for the entity (`str` for the dynamic engine)
/// - `Entity`: The full entity type returned from queries
/// - `Create`: Input for creating new entities
/// - `Update`: Input for partially updating existing entities
pub trait Repository<Id: ?Sized, Entity, Create, Update>: Send + Sync {
    /// Connection the operations run on
    type Connection: Send;

    /// Find an entity by its unique identifier
    ///
    /// Returns `Ok(Some(entity))` if found, `Ok(None)` if not found.
    fn find_by_id(
        &self,
        conn: &mut Self::Connection,
        id: &Id,
    ) -> impl Future<Output = RepositoryResult<Option<Entity>>> + Send;

    /// Find all entities matching a request
    ///
    /// Filtering, multi-key ordering, skip/take and eager loading come from
    /// `args`. Ordering is applied before the window.
    fn find_many(
        &self,
        conn: &mut Self::Connection,
        args: &FindManyArgs,
    ) -> impl Future<Output = RepositoryResult<Vec<Entity>>> + Send;

    /// Count entities matching `filter`, ignoring any window
    fn count(
        &self,
        conn: &mut Self::Connection,
        filter: &WhereExpression,
    ) -> impl Future<Output = RepositoryResult<u64>> + Send;

    /// Check if an entity exists by its identifier
    ///
    /// More efficient than `find_by_id` when you only need to check existence.
    fn exists(
        &self,
        conn: &mut Self::Connection,
        id: &Id,
    ) -> impl Future<Output = RepositoryResult<bool>> + Send;

    /// Create a new entity
    ///
    /// Returns the created entity with any generated fields (ID, timestamps).
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when a supplied identifier is taken.
    fn create(
        &self,
        conn: &mut Self::Connection,
        data: Create,
    ) -> impl Future<Output = RepositoryResult<Entity>> + Send;

    /// Update an existing entity
    ///
    /// Returns the updated entity.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entity doesn't exist, `ConcurrencyConflict` if it
    /// changed since the version the update expects.
    fn update(
        &self,
        conn: &mut Self::Connection,
        id: &Id,
        data: Update,
    ) -> impl Future<Output = RepositoryResult<Entity>> + Send;

    /// Delete an entity by its identifier (hard delete)
    ///
    /// # Errors
    ///
    /// `NotFound` if the entity doesn't exist.
    fn delete(
        &self,
        conn: &mut Self::Connection,
        id: &Id,
    ) -> impl Future<Output = RepositoryResult<()>> + Send;
}

/// To-many relation changes and traversal
///
/// # Type Parameters
///
/// - `Id`: The parent identifier type
/// - `Related`: The related entity type returned by traversal
pub trait RelationRepository<Id: ?Sized, Related>: Send + Sync {
    /// Connection the operations run on
    type Connection: Send;

    /// Add `ids` to the parent's relation
    ///
    /// # Errors
    ///
    /// `RelatedEntityNotFound` if any id does not exist; nothing is linked.
    fn connect(
        &self,
        conn: &mut Self::Connection,
        parent: &Id,
        relation: &str,
        ids: &[String],
    ) -> impl Future<Output = RepositoryResult<ReconcileOutcome>> + Send;

    /// Remove `ids` from the parent's relation; ids not linked are skipped
    fn disconnect(
        &self,
        conn: &mut Self::Connection,
        parent: &Id,
        relation: &str,
        ids: &[String],
    ) -> impl Future<Output = RepositoryResult<ReconcileOutcome>> + Send;

    /// Make the parent's relation exactly the existing subset of `ids`
    ///
    /// # Errors
    ///
    /// `RelatedEntityNotFound` if `ids` is non-empty and none exist.
    fn set(
        &self,
        conn: &mut Self::Connection,
        parent: &Id,
        relation: &str,
        ids: &[String],
    ) -> impl Future<Output = RepositoryResult<ReconcileOutcome>> + Send;

    /// Find-many over the members of the parent's relation
    fn find_related(
        &self,
        conn: &mut Self::Connection,
        parent: &Id,
        relation: &str,
        args: &FindManyArgs,
    ) -> impl Future<Output = RepositoryResult<Vec<Related>>> + Send;

    /// Member ids of the relation for many parents at once (N+1 prevention)
    ///
    /// Returns a map from parent id to its member ids.
    fn batch_load(
        &self,
        conn: &mut Self::Connection,
        parents: &[String],
        relation: &str,
    ) -> impl Future<Output = RepositoryResult<HashMap<String, Vec<String>>>> + Send;
}
