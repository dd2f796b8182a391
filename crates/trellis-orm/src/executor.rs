//! The SQL Executor collaborator contract.
//!
//! All command text generation happens in the engine; an executor is pure
//! transport plus the dialect's identifier-escaping hooks. The engine never
//! retries a failed command.

use trellis_core::{Escape, SqlValue};

use crate::error::BoxError;
use crate::schema::ColumnDescriptor;

/// A dynamic row or input record: an insertion-ordered JSON map. Nested
/// objects and arrays express relationship payloads, never column values.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// The kind of a compiled command, used for event subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// A row-returning SELECT (including COUNT variants).
    Query,
    /// An INSERT.
    Insert,
    /// An UPDATE.
    Update,
    /// A DELETE (including truncate).
    Delete,
    /// A schema describe round trip.
    Describe,
}

/// A compiled command: parameterized text plus its positional arguments,
/// ordered to match the `?` placeholders left to right.
#[derive(Debug, Clone)]
pub struct Command {
    /// Command kind.
    pub kind: CommandKind,
    /// Main table the command was compiled for.
    pub table: String,
    /// Parameterized SQL text.
    pub text: String,
    /// Positional arguments.
    pub args: Vec<SqlValue>,
}

impl Command {
    /// Renders the command with arguments interpolated inline.
    ///
    /// For human-readable event output only; the interpolated text is never
    /// executed.
    #[must_use]
    pub fn interpolated(&self) -> String {
        let mut out = String::with_capacity(self.text.len());
        let mut args = self.args.iter();
        for ch in self.text.chars() {
            if ch == '?' {
                match args.next() {
                    Some(value) => out.push_str(&value.to_sql_inline()),
                    None => out.push(ch),
                }
            } else {
                out.push(ch);
            }
        }
        out
    }
}

/// Transport result: executors report failures as boxed errors; the engine
/// wraps them with command context.
pub type ExecResult<T> = std::result::Result<T, BoxError>;

/// The raw SQL transport consumed by [`crate::TableContext`].
///
/// Implementations execute the given command verbatim and convert rows into
/// dynamic [`Record`]s keyed by the column aliases the command selected.
#[allow(async_fn_in_trait)]
pub trait SqlExecutor: Escape + Send + Sync {
    /// Runs a row-returning query.
    async fn query(&self, cmd: &Command) -> ExecResult<Vec<Record>>;

    /// Runs a single-value COUNT query.
    async fn count(&self, cmd: &Command) -> ExecResult<i64>;

    /// Runs an INSERT of `rows` VALUES tuples, returning the generated
    /// identifiers as a parallel array in submission order.
    async fn insert(&self, cmd: &Command, rows: usize) -> ExecResult<Vec<i64>>;

    /// Runs an UPDATE, returning the affected-row count.
    async fn update(&self, cmd: &Command) -> ExecResult<u64>;

    /// Runs a DELETE, returning the affected-row count.
    async fn delete(&self, cmd: &Command) -> ExecResult<u64>;

    /// Fetches column metadata for a table. Alias assignment is the
    /// engine's job; executors only report raw names and flags.
    async fn describe(&self, table: &str) -> ExecResult<Vec<ColumnDescriptor>>;
}
