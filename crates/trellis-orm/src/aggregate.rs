//! Aggregate functions for grouped queries.

use trellis_core::Escape;

/// An aggregate applied to a grouped query's selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    /// `COUNT(column)` / `COUNT(*)` / `COUNT(DISTINCT column)`.
    Count {
        /// Column to count, or `*` for all rows.
        column: String,
        /// Whether to count only distinct values.
        distinct: bool,
    },
    /// `SUM(column)`.
    Sum(String),
    /// `AVG(column)`.
    Avg(String),
    /// `MAX(column)`.
    Max(String),
    /// `MIN(column)`.
    Min(String),
    /// `TOTAL(column)`: like SUM but never NULL over an empty group.
    Total(String),
}

impl Aggregate {
    /// The column the aggregate reads, or `None` for `COUNT(*)`.
    #[must_use]
    pub fn column(&self) -> Option<&str> {
        match self {
            Self::Count { column, .. } if column == "*" => None,
            Self::Count { column, .. }
            | Self::Sum(column)
            | Self::Avg(column)
            | Self::Max(column)
            | Self::Min(column)
            | Self::Total(column) => Some(column),
        }
    }

    /// Renders the aggregate over a qualified column.
    #[must_use]
    pub fn to_sql(&self, table: &str, esc: &dyn Escape) -> String {
        let qualify = |column: &str| {
            format!(
                "{}.{}",
                esc.escape_table(table),
                esc.escape_column(column)
            )
        };
        match self {
            Self::Count { column, .. } if column == "*" => String::from("COUNT(*)"),
            Self::Count {
                column,
                distinct: true,
            } => format!("COUNT(DISTINCT {})", qualify(column)),
            Self::Count { column, .. } => format!("COUNT({})", qualify(column)),
            Self::Sum(column) => format!("SUM({})", qualify(column)),
            Self::Avg(column) => format!("AVG({})", qualify(column)),
            Self::Max(column) => format!("MAX({})", qualify(column)),
            Self::Min(column) => format!("MIN({})", qualify(column)),
            Self::Total(column) => format!("TOTAL({})", qualify(column)),
        }
    }
}
