//! Lightweight entity-relational mapping over plain SQL sessions.
//!
//! Entities declare their table, columns and associations once through
//! [`Entity::definition`]. From those declarations the engine:
//!
//! - synthesizes one cycle-safe outer-join SELECT per root entity
//! - rebuilds deduplicated object graphs from the flat, repeated join rows
//! - saves and deletes whole graphs with cascades, ordered for foreign keys,
//!   inside a single transaction
//!
//! # Architecture
//!
//! ```text
//! Repository<T, ID>            (typed facade, transaction boundary)
//!      |            \
//! Registry / JoinPlan   Persister (cascading save/delete)
//!      |            /
//! GraphBuilder      QueryExecutor (named params, NULL rewrite, retries)
//!                        |
//!                   SqlSession (PgSession | SqliteSession)
//!                        |
//!                      SQLx
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tablegraph::{Registry, Repository, SqliteSession};
//!
//! # async fn example() -> tablegraph::Result<()> {
//! let registry = Arc::new(Registry::new());
//! let people: Repository<Person, i64> = Repository::new(Arc::clone(&registry))?;
//!
//! let mut session = SqliteSession::memory().await?;
//! let saved = people.save(&mut session, &Person::new("Ada")).await?;
//! let same = people.find_by_id(&mut session, saved.id.unwrap()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Async Runtime
//!
//! Every operation is async and runs its statements one after another on the
//! caller's task; the engine never spawns. A session must not be shared by
//! two operations at once. The [`Registry`] is the only shared state and is
//! safe to use from many tasks and threads.

/// Value coercion between storage and domain representations.
pub mod coerce;

/// PostgreSQL connection pooling with retrying connect.
pub mod connection;

/// Declarative entity mapping: tables, columns, associations, cascades.
pub mod entity;

/// Statement execution with named parameters, NULL rewriting and retries.
pub mod executor;

/// SQL identifier validation.
pub mod ident;

/// Cascading save and delete.
mod persist;

/// Join synthesis for one root entity.
pub mod plan;

/// Graph reconstruction from join rows.
pub mod reconstruct;

pub mod record;

/// Validated entity metadata, shared across tasks.
pub mod registry;

pub mod repository;

/// SQL sessions over PostgreSQL and SQLite.
pub mod session;

pub mod transaction;

/// SQL values, id keys and field types.
pub mod value;

pub use coerce::{ValueConverter, YesNoConverter};
pub use connection::{ConnectionPool, PoolConfig, RetryConfig};
pub use entity::{
    AssociationDef, Cascade, CascadeSet, ColumnDef, Container, Entity, EntityDef, JoinColumn,
    JoinTable, SaveMode,
};
pub use executor::{mappers, parse_named_parameters, rewrite_null_predicates, ExecutorConfig, QueryExecutor};
pub use plan::JoinPlan;
pub use record::{Record, Related};
pub use registry::{AssociationDescriptor, AssociationKind, EntityDescriptor, Registry};
pub use repository::Repository;
pub use session::{Backend, PgSession, SqlRow, SqlSession, SqliteSession};
pub use transaction::TransactionScope;
pub use value::{FieldType, FromValue, IdKey, IdValue, SqlValue};

pub use tablegraph_common::{Result, TableGraphError};
