//! Error types for the engine.

use thiserror::Error;

/// Boxed transport error returned by [`crate::executor::SqlExecutor`]
/// implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Engine errors.
///
/// Malformed builder usage surfaces synchronously at the violating call or
/// when the command is built; executor failures are wrapped with the table
/// and the sanitized command and never retried; internal invariant breaches
/// fail loudly.
#[derive(Debug, Error)]
pub enum OrmError {
    /// The SQL executor rejected a compiled command.
    #[error("executor failed on `{table}` running `{command}`: {source}")]
    Executor {
        /// Main table of the failing context.
        table: String,
        /// Sanitized (non-interpolated) command text.
        command: String,
        /// Underlying transport error.
        #[source]
        source: BoxError,
    },

    /// A column name does not exist in the schema it was used against.
    #[error("unknown column `{column}` on `{table}`")]
    UnknownColumn {
        /// Table or relationship alias the column was resolved against.
        table: String,
        /// Offending column name.
        column: String,
    },

    /// A filter, include, or join referenced an undeclared relationship.
    #[error("relationship `{0}` has not been declared")]
    UnknownRelationship(String),

    /// Two relationships were declared under the same name on one parent.
    #[error("relationship `{0}` is already declared")]
    DuplicateRelationship(String),

    /// A filter on a mutation referenced a joined table.
    #[error("update and delete filters may only reference the main table")]
    FilterOutOfScope,

    /// A filter referenced a declared relationship that is not included in
    /// this query.
    #[error("filter references `{0}`, which is not joined in this query")]
    FilterNotJoined(String),

    /// A column projection and GROUP BY were configured on the same fork.
    #[error("cannot combine a column projection with GROUP BY on one context")]
    ProjectionConflict,

    /// `limit`/`offset` received a negative bound.
    #[error("limit and offset must be non-negative, got {0}")]
    NegativeBound(i64),

    /// `offset` was set without `limit`.
    #[error("OFFSET requires a LIMIT on the same context")]
    OffsetWithoutLimit,

    /// A filter callback misused the predicate builder.
    #[error("invalid filter: {0}")]
    Predicate(#[from] trellis_core::PredicateError),

    /// `update` or `delete` ran without a filter.
    #[error("refusing to {0} the whole table; add a filter or use the explicit *_all variant")]
    UnfilteredMutation(&'static str),

    /// `update_all` ran without its allow flag.
    #[error("update_all is disabled for this context; enable `allow_unfiltered_update`")]
    UpdateAllDisabled,

    /// `truncate` ran without its allow flag.
    #[error("truncate is disabled for this context; enable `allow_truncate`")]
    TruncateDisabled,

    /// An insert or update record carried no usable scalar columns.
    #[error("record has no insertable columns")]
    EmptyRecord,

    /// A builder invariant was violated; this is a bug, not a usage error.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, OrmError>;
