//! # trellis-orm
//!
//! A relational query/command builder and result-reconstruction engine
//! sitting above a raw SQL transport.
//!
//! The crate provides:
//! - [`TableContext`]: an immutable fluent builder scoped to one table;
//!   every chain call forks a new independent context
//! - declarative 1:1/1:n relationship trees with collision-free namespaced
//!   aliases at any nesting depth
//! - reconstruction of flat joined result sets into nested object graphs
//! - an AND/OR/NOT predicate builder serialized to parameterized SQL
//! - the [`SqlExecutor`] transport contract, with a bundled `sqlx` SQLite
//!   implementation
//!
//! ## Quick start
//!
//! ```ignore
//! use trellis_orm::{SqliteExecutor, TableContext};
//!
//! let executor = SqliteExecutor::connect("sqlite::memory:").await?;
//! let tracks = TableContext::new(executor, "Track");
//!
//! let heavy = tracks
//!     .filter(|m| {
//!         m.col("Composer")
//!             .equals("AC/DC")
//!             .and(|m| m.col("Bytes").greater_than(7_032_162_i64))
//!     })?
//!     .order_by(|s| s.desc("Bytes"))
//!     .select()
//!     .await?;
//! ```
//!
//! ## Relationships and includes
//!
//! ```ignore
//! let albums = TableContext::new(executor, "Album")
//!     .has_many("tracks", |r| {
//!         r.from_table("Track")
//!             .with_keys("AlbumId", "AlbumId")
//!             .and_that_has_one("genre", |r| {
//!                 r.from_table("Genre").with_keys("GenreId", "GenreId")
//!             })
//!     })?;
//!
//! // Joined columns come back regrouped: each album row carries a `tracks`
//! // array whose items carry a nested `genre` object.
//! let nested = albums
//!     .include("tracks")?
//!     .then_include("genre")?
//!     .context()
//!     .select()
//!     .await?;
//! ```
//!
//! Forks are independent: deriving two contexts from the same parent never
//! leaks filter, sort, or include state between them.

mod aggregate;
mod context;
mod error;
mod events;
mod executor;
mod nest;
pub mod relation;
mod schema;
mod sqlite;

pub use aggregate::Aggregate;
pub use context::{
    ContextOptions, GroupSpec, Include, OrderBy, OrderDirection, Projection, SelectedColumn, Sort,
    TableContext,
};
pub use error::{BoxError, OrmError, Result};
pub use events::{CommandEvent, EventHub};
pub use executor::{Command, CommandKind, ExecResult, Record, SqlExecutor};
pub use relation::{Cardinality, Declare, RelationNode};
pub use schema::{namespaced_alias, ColumnDescriptor, SchemaCache, TableSchema};
pub use sqlite::SqliteExecutor;

// Re-export the command primitives callers touch directly.
pub use trellis_core::{
    Backtick, Chain, Escape, ScopeFilter, SqlValue, ToSqlValue, WhereNode, WhereScope,
};
