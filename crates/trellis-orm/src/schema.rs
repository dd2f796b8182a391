//! Table schema descriptors and the per-lineage schema cache.
//!
//! Schemas are fetched once per distinct table through the executor's
//! describe round trip and shared by reference across every fork of a
//! context lineage. The engine's only schema responsibility beyond caching
//! is the alias policy: root-table columns alias to their raw name, and a
//! relationship's columns alias to `<node namespace>_<raw name>`, which the
//! node-alias namespacing keeps unique at any join depth.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{OrmError, Result};
use crate::executor::SqlExecutor;

/// Metadata for a single column, as reported by the executor's describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// Raw column name.
    pub name: String,
    /// Whether the column rejects NULL.
    pub not_null: bool,
    /// Whether the column is part of the primary key.
    pub is_primary_key: bool,
    /// Whether the column auto-increments.
    pub is_auto_increment: bool,
    /// Declared default value, if any (textual form).
    pub default_value: Option<String>,
}

/// The described columns of one table, in declaration order.
#[derive(Debug, Clone)]
pub struct TableSchema {
    columns: Vec<ColumnDescriptor>,
}

impl TableSchema {
    /// Wraps a describe result.
    #[must_use]
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        Self { columns }
    }

    /// Columns in declaration order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Looks up a column by raw name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns whether a column exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// First primary-key column, if any.
    #[must_use]
    pub fn primary_key(&self) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.is_primary_key)
    }

    /// First auto-increment column, if any.
    #[must_use]
    pub fn auto_increment(&self) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.is_auto_increment)
    }
}

/// Joins a namespace and a raw column name into a generated alias.
///
/// An empty namespace (the root table) yields the raw name itself.
#[must_use]
pub fn namespaced_alias(namespace: &str, column: &str) -> String {
    if namespace.is_empty() {
        String::from(column)
    } else {
        format!("{namespace}_{column}")
    }
}

/// Async cache of described tables, shared across a context lineage.
#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: RwLock<HashMap<String, Arc<TableSchema>>>,
}

impl SchemaCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached schema for a table, if resolved.
    pub async fn get(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.tables.read().await.get(table).cloned()
    }

    /// Returns the resolved schema for a table, treating a miss as an
    /// internal error: callers must have awaited [`SchemaCache::ensure`].
    pub async fn expect(&self, table: &str) -> Result<Arc<TableSchema>> {
        self.get(table)
            .await
            .ok_or_else(|| OrmError::Internal(format!("schema for `{table}` was not resolved")))
    }

    /// Resolves every listed table that is not yet cached, issuing the
    /// describe round trips concurrently. Duplicate names are collapsed.
    pub async fn ensure<E: SqlExecutor>(&self, executor: &E, tables: &[String]) -> Result<()> {
        let missing: Vec<String> = {
            let cached = self.tables.read().await;
            let mut missing: Vec<String> = tables
                .iter()
                .filter(|t| !cached.contains_key(*t))
                .cloned()
                .collect();
            missing.sort();
            missing.dedup();
            missing
        };
        if missing.is_empty() {
            return Ok(());
        }

        debug!(tables = ?missing, "describing tables");
        let fetched = try_join_all(missing.into_iter().map(|table| async move {
            match executor.describe(&table).await {
                Ok(columns) => Ok((table, TableSchema::new(columns))),
                Err(source) => Err(OrmError::Executor {
                    command: format!("DESCRIBE `{table}`"),
                    table,
                    source,
                }),
            }
        }))
        .await?;

        let mut cached = self.tables.write().await;
        for (table, schema) in fetched {
            cached.entry(table).or_insert_with(|| Arc::new(schema));
        }
        Ok(())
    }
}
