//! Identifier escaping.
//!
//! The engine emits every table, alias, and column name through these hooks
//! so a single escaping convention applies to the whole command. Executors
//! may override either hook for their dialect; the default is the backtick
//! convention shared by SQLite and MySQL.

/// Escapes an identifier with backticks, doubling embedded backticks.
#[must_use]
pub fn backtick(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Dialect hooks for identifier escaping.
pub trait Escape {
    /// Escapes a table name or table alias.
    fn escape_table(&self, name: &str) -> String {
        backtick(name)
    }

    /// Escapes a column name or column alias.
    fn escape_column(&self, name: &str) -> String {
        backtick(name)
    }
}

/// The default backtick escaping convention.
#[derive(Debug, Clone, Copy, Default)]
pub struct Backtick;

impl Escape for Backtick {}
