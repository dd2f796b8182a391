//! # trellis-core
//!
//! SQL command primitives shared by the trellis engine:
//!
//! - [`value::SqlValue`]: the dynamic value type bound to `?` placeholders,
//!   with inline escaping for human-readable command interpolation
//! - [`ident::Escape`]: the identifier-escaping contract (backtick
//!   convention by default)
//! - [`writer::SqlWriter`]: an ordered fragment/argument accumulator that
//!   makes placeholder-count/argument-order drift structurally impossible
//! - [`predicate`]: the WHERE expression tree: a chainable AND/OR/NOT
//!   builder with arbitrary parenthesized nesting and table-scope-filtered
//!   rendering
//!
//! This crate is deliberately free of driver and runtime dependencies; the
//! async engine lives in `trellis-orm`.

pub mod ident;
pub mod predicate;
pub mod value;
pub mod writer;

pub use ident::{Backtick, Escape};
pub use predicate::{
    Chain, ChainOp, ColumnRef, CompareOp, Condition, PredicateError, ScopeFilter, ScopeTree,
    WhereNode, WhereScope,
};
pub use value::{SqlValue, ToSqlValue};
pub use writer::SqlWriter;
