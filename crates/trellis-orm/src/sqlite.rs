//! `sqlx`-backed SQLite executor.
//!
//! Pure transport: runs the compiled commands verbatim, decodes rows into
//! dynamic records keyed by the selected aliases, and answers describe
//! round trips from `PRAGMA table_info`. All command text generation stays
//! in the engine.

use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::debug;
use trellis_core::{Escape, SqlValue};

use crate::executor::{Command, ExecResult, Record, SqlExecutor};
use crate::schema::ColumnDescriptor;

/// A SQLite transport over a `sqlx` connection pool.
#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    pool: SqlitePool,
}

impl SqliteExecutor {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connects to a SQLite database URL (use `:memory:` for tests).
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// SQLite shares the backtick convention.
impl Escape for SqliteExecutor {}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &SqlValue) -> SqliteQuery<'q> {
    match value {
        SqlValue::Null => query.bind(Option::<i64>::None),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Blob(b) => query.bind(b.clone()),
    }
}

fn bind_all<'q>(cmd: &Command, mut query: SqliteQuery<'q>) -> SqliteQuery<'q> {
    for value in &cmd.args {
        query = bind_value(query, value);
    }
    query
}

fn row_to_record(row: &SqliteRow) -> Result<Record, sqlx::Error> {
    let mut record = Record::new();
    for (index, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(index)?),
                "REAL" => serde_json::Number::from_f64(row.try_get::<f64, _>(index)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => Value::Array(
                    row.try_get::<Vec<u8>, _>(index)?
                        .into_iter()
                        .map(Value::from)
                        .collect(),
                ),
                _ => Value::String(row.try_get::<String, _>(index)?),
            }
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

impl SqlExecutor for SqliteExecutor {
    async fn query(&self, cmd: &Command) -> ExecResult<Vec<Record>> {
        debug!(sql = %cmd.text, "running query");
        let rows = bind_all(cmd, sqlx::query(&cmd.text))
            .fetch_all(&self.pool)
            .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }

    async fn count(&self, cmd: &Command) -> ExecResult<i64> {
        debug!(sql = %cmd.text, "running count");
        let row = bind_all(cmd, sqlx::query(&cmd.text))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    async fn insert(&self, cmd: &Command, rows: usize) -> ExecResult<Vec<i64>> {
        debug!(sql = %cmd.text, rows, "running insert");
        if rows == 0 {
            return Ok(Vec::new());
        }
        let result = bind_all(cmd, sqlx::query(&cmd.text))
            .execute(&self.pool)
            .await?;
        // A single multi-VALUES statement allocates sequential rowids, so
        // the generated ids end at last_insert_rowid.
        let last = result.last_insert_rowid();
        let first = last - rows as i64 + 1;
        Ok((first..=last).collect())
    }

    async fn update(&self, cmd: &Command) -> ExecResult<u64> {
        debug!(sql = %cmd.text, "running update");
        let result = bind_all(cmd, sqlx::query(&cmd.text))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, cmd: &Command) -> ExecResult<u64> {
        debug!(sql = %cmd.text, "running delete");
        let result = bind_all(cmd, sqlx::query(&cmd.text))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn describe(&self, table: &str) -> ExecResult<Vec<ColumnDescriptor>> {
        let sql = format!("PRAGMA table_info({})", self.escape_table(table));
        debug!(table = %table, "describing table");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        if rows.is_empty() {
            return Err(format!("table `{table}` does not exist or has no columns").into());
        }

        let mut columns = Vec::with_capacity(rows.len());
        let mut types = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("name")?;
            let declared: String = row.try_get("type")?;
            let not_null: i64 = row.try_get("notnull")?;
            let default_value: Option<String> = row.try_get("dflt_value")?;
            let pk: i64 = row.try_get("pk")?;
            columns.push(ColumnDescriptor {
                name,
                not_null: not_null != 0,
                is_primary_key: pk > 0,
                is_auto_increment: false,
                default_value,
            });
            types.push(declared);
        }

        // A lone INTEGER primary key aliases the rowid and auto-increments.
        let pk_indexes: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_primary_key)
            .map(|(i, _)| i)
            .collect();
        if let [index] = pk_indexes[..] {
            if types[index].eq_ignore_ascii_case("INTEGER") {
                columns[index].is_auto_increment = true;
            }
        }

        Ok(columns)
    }
}
