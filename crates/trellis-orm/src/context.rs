//! The immutable fluent table context.
//!
//! A [`TableContext`] is scoped to one table and accumulates query/command
//! state through chained calls. Every chain method returns a freshly
//! constructed context with copied-and-amended state; forking never mutates
//! the receiver, so sibling forks stay independent. Schema metadata resolves
//! lazily: terminal operations first await the readiness of every table the
//! lineage has declared, then compile and execute.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use trellis_core::{
    predicate, Chain, Escape, ScopeFilter, ScopeTree, SqlValue, SqlWriter, WhereNode, WhereScope,
};

use crate::aggregate::Aggregate;
use crate::error::{BoxError, OrmError, Result};
use crate::events::{CommandEvent, EventHub};
use crate::executor::{Command, CommandKind, Record, SqlExecutor};
use crate::nest::{self, Link, NestPlan};
use crate::relation::{self, Cardinality, Declare, NeedsKeys, Ready, RelationNode};
use crate::schema::{namespaced_alias, ColumnDescriptor, SchemaCache, TableSchema};

/// Behavior flags for a context lineage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextOptions {
    /// Allows `update_all` to run without a filter.
    pub allow_unfiltered_update: bool,
    /// Allows `truncate` to run.
    pub allow_truncate: bool,
    /// Sorts insert column names instead of keeping first-seen order.
    pub sort_insert_keys: bool,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    /// Ascending (`ASC`).
    Asc,
    /// Descending (`DESC`).
    Desc,
}

/// One sort key.
#[derive(Debug, Clone)]
pub struct OrderBy {
    /// Column to sort by.
    pub column: String,
    /// Direction.
    pub direction: OrderDirection,
}

/// Sort specification accumulated by an `order_by` callback.
#[derive(Debug, Clone, Default)]
pub struct Sort {
    entries: Vec<OrderBy>,
}

impl Sort {
    /// Adds an ascending sort key.
    #[must_use]
    pub fn asc(mut self, column: &str) -> Self {
        self.entries.push(OrderBy {
            column: String::from(column),
            direction: OrderDirection::Asc,
        });
        self
    }

    /// Adds a descending sort key.
    #[must_use]
    pub fn desc(mut self, column: &str) -> Self {
        self.entries.push(OrderBy {
            column: String::from(column),
            direction: OrderDirection::Desc,
        });
        self
    }
}

/// Grouping specification accumulated by a `group_by` callback: the group
/// columns plus explicitly aliased aggregate selections.
#[derive(Debug, Clone, Default)]
pub struct GroupSpec {
    columns: Vec<String>,
    aggregates: Vec<(Aggregate, String)>,
}

impl GroupSpec {
    /// Groups by a column (also selecting it).
    #[must_use]
    pub fn col(mut self, column: &str) -> Self {
        self.columns.push(String::from(column));
        self
    }

    /// Selects `COUNT(column) AS alias`.
    #[must_use]
    pub fn count(mut self, column: &str, alias: &str) -> Self {
        self.aggregates.push((
            Aggregate::Count {
                column: String::from(column),
                distinct: false,
            },
            String::from(alias),
        ));
        self
    }

    /// Selects `COUNT(*) AS alias`.
    #[must_use]
    pub fn count_all(mut self, alias: &str) -> Self {
        self.aggregates.push((
            Aggregate::Count {
                column: String::from("*"),
                distinct: false,
            },
            String::from(alias),
        ));
        self
    }

    /// Selects `COUNT(DISTINCT column) AS alias`.
    #[must_use]
    pub fn count_distinct(mut self, column: &str, alias: &str) -> Self {
        self.aggregates.push((
            Aggregate::Count {
                column: String::from(column),
                distinct: true,
            },
            String::from(alias),
        ));
        self
    }

    /// Selects `SUM(column) AS alias`.
    #[must_use]
    pub fn sum(mut self, column: &str, alias: &str) -> Self {
        self.aggregates
            .push((Aggregate::Sum(String::from(column)), String::from(alias)));
        self
    }

    /// Selects `AVG(column) AS alias`.
    #[must_use]
    pub fn avg(mut self, column: &str, alias: &str) -> Self {
        self.aggregates
            .push((Aggregate::Avg(String::from(column)), String::from(alias)));
        self
    }

    /// Selects `MAX(column) AS alias`.
    #[must_use]
    pub fn max(mut self, column: &str, alias: &str) -> Self {
        self.aggregates
            .push((Aggregate::Max(String::from(column)), String::from(alias)));
        self
    }

    /// Selects `MIN(column) AS alias`.
    #[must_use]
    pub fn min(mut self, column: &str, alias: &str) -> Self {
        self.aggregates
            .push((Aggregate::Min(String::from(column)), String::from(alias)));
        self
    }

    /// Selects `TOTAL(column) AS alias`.
    #[must_use]
    pub fn total(mut self, column: &str, alias: &str) -> Self {
        self.aggregates
            .push((Aggregate::Total(String::from(column)), String::from(alias)));
        self
    }
}

/// One projected column, optionally relabeled.
#[derive(Debug, Clone)]
pub struct SelectedColumn {
    /// Raw column name.
    pub column: String,
    /// Output alias; the raw name when `None`.
    pub alias: Option<String>,
}

/// Projection specification accumulated by a `project` callback.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    columns: Vec<SelectedColumn>,
}

impl Projection {
    /// Selects a column under its own name.
    #[must_use]
    pub fn col(mut self, column: &str) -> Self {
        self.columns.push(SelectedColumn {
            column: String::from(column),
            alias: None,
        });
        self
    }

    /// Selects a column under an alias.
    #[must_use]
    pub fn col_as(mut self, column: &str, alias: &str) -> Self {
        self.columns.push(SelectedColumn {
            column: String::from(column),
            alias: Some(String::from(alias)),
        });
        self
    }
}

struct Resolved {
    main: Arc<TableSchema>,
    by_table: HashMap<String, Arc<TableSchema>>,
}

/// An immutable-per-fork query/command builder scoped to one table.
pub struct TableContext<E> {
    executor: Arc<E>,
    events: Arc<EventHub>,
    schemas: Arc<SchemaCache>,
    table: String,
    identity: Option<String>,
    options: ContextOptions,
    relations: Vec<RelationNode>,
    filter: Option<WhereNode>,
    sort: Vec<OrderBy>,
    group: Option<GroupSpec>,
    projection: Option<Vec<SelectedColumn>>,
    limit: Option<i64>,
    offset: Option<i64>,
}

// Manual Clone to avoid an E: Clone bound; the executor is shared.
impl<E> Clone for TableContext<E> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            events: Arc::clone(&self.events),
            schemas: Arc::clone(&self.schemas),
            table: self.table.clone(),
            identity: self.identity.clone(),
            options: self.options,
            relations: self.relations.clone(),
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            group: self.group.clone(),
            projection: self.projection.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

impl<E> fmt::Debug for TableContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableContext")
            .field("table", &self.table)
            .field("relations", &self.relations.len())
            .field("filtered", &self.filter.is_some())
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl<E> TableContext<E> {
    /// Creates a root context for a table.
    pub fn new(executor: E, table: impl Into<String>) -> Self {
        Self::with_shared(Arc::new(executor), table)
    }

    /// Creates a root context sharing an already-wrapped executor.
    pub fn with_shared(executor: Arc<E>, table: impl Into<String>) -> Self {
        Self {
            executor,
            events: Arc::new(EventHub::new()),
            schemas: Arc::new(SchemaCache::new()),
            table: table.into(),
            identity: None,
            options: ContextOptions::default(),
            relations: Vec::new(),
            filter: None,
            sort: Vec::new(),
            group: None,
            projection: None,
            limit: None,
            offset: None,
        }
    }

    /// Sets the auto-increment identity column explicitly. Without this,
    /// the first described auto-increment column is used.
    #[must_use]
    pub fn with_identity(mut self, column: &str) -> Self {
        self.identity = Some(String::from(column));
        self
    }

    /// Sets the behavior flags for this lineage.
    #[must_use]
    pub fn with_options(mut self, options: ContextOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the event hub, e.g. to observe several root contexts
    /// sharing one executor through a single hub.
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventHub>) -> Self {
        self.events = events;
        self
    }

    /// The table this context is scoped to.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The executor shared by this lineage.
    #[must_use]
    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// The event hub shared by this lineage.
    #[must_use]
    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Subscribes to command events on this lineage; `kind` of `None`
    /// receives every event.
    pub fn subscribe(
        &self,
        kind: Option<CommandKind>,
        callback: impl Fn(&CommandEvent) + Send + Sync + 'static,
    ) {
        self.events.subscribe(kind, callback);
    }

    fn fork(&self) -> Self {
        self.clone()
    }

    fn declare_relation(
        &self,
        name: &str,
        cardinality: Cardinality,
        f: impl FnOnce(Declare<NeedsKeys>) -> Declare<Ready>,
    ) -> Result<Self> {
        if relation::find(&self.relations, name).is_some() || name == self.table {
            return Err(OrmError::DuplicateRelationship(String::from(name)));
        }
        let node = f(relation::declare(name, cardinality)).into_node("")?;
        let mut next = self.fork();
        next.relations.push(node);
        Ok(next)
    }

    /// Declares a 1:1 relationship. The callback configures the target
    /// table and key pair, and may nest further declarations.
    pub fn has_one(
        &self,
        name: &str,
        f: impl FnOnce(Declare<NeedsKeys>) -> Declare<Ready>,
    ) -> Result<Self> {
        self.declare_relation(name, Cardinality::One, f)
    }

    /// Declares a 1:n relationship.
    pub fn has_many(
        &self,
        name: &str,
        f: impl FnOnce(Declare<NeedsKeys>) -> Declare<Ready>,
    ) -> Result<Self> {
        self.declare_relation(name, Cardinality::Many, f)
    }

    /// Marks a declared relationship active for the next query, joining it
    /// and selecting its namespaced columns. The returned handle descends
    /// into children via [`Include::then_include`].
    pub fn include(&self, name: &str) -> Result<Include<E>> {
        let mut next = self.fork();
        let node = relation::find_mut(&mut next.relations, name)
            .ok_or_else(|| OrmError::UnknownRelationship(String::from(name)))?;
        node.included = true;
        Ok(Include {
            ctx: next,
            path: vec![String::from(name)],
        })
    }

    /// Sets (or replaces) the filter predicate.
    pub fn filter(&self, f: impl FnOnce(WhereScope) -> Chain) -> Result<Self> {
        let node = predicate::build(self.scope_tree(), f)?;
        let mut next = self.fork();
        next.filter = Some(node);
        Ok(next)
    }

    /// Sets (or replaces) the sort keys.
    #[must_use]
    pub fn order_by(&self, f: impl FnOnce(Sort) -> Sort) -> Self {
        let mut next = self.fork();
        next.sort = f(Sort::default()).entries;
        next
    }

    /// Sets group columns and aggregate selections. Mutually exclusive with
    /// [`TableContext::project`].
    pub fn group_by(&self, f: impl FnOnce(GroupSpec) -> GroupSpec) -> Result<Self> {
        if self.projection.is_some() {
            return Err(OrmError::ProjectionConflict);
        }
        let mut next = self.fork();
        next.group = Some(f(GroupSpec::default()));
        Ok(next)
    }

    /// Overrides the selection with a subset of (optionally relabeled)
    /// main-table columns. Mutually exclusive with [`TableContext::group_by`].
    pub fn project(&self, f: impl FnOnce(Projection) -> Projection) -> Result<Self> {
        if self.group.is_some() {
            return Err(OrmError::ProjectionConflict);
        }
        let mut next = self.fork();
        next.projection = Some(f(Projection::default()).columns);
        Ok(next)
    }

    /// Limits the number of main rows returned.
    pub fn limit(&self, n: i64) -> Result<Self> {
        if n < 0 {
            return Err(OrmError::NegativeBound(n));
        }
        let mut next = self.fork();
        next.limit = Some(n);
        Ok(next)
    }

    /// Skips the first `n` main rows. Requires a limit by the time a
    /// command is built.
    pub fn offset(&self, n: i64) -> Result<Self> {
        if n < 0 {
            return Err(OrmError::NegativeBound(n));
        }
        let mut next = self.fork();
        next.offset = Some(n);
        Ok(next)
    }

    fn scope_tree(&self) -> ScopeTree {
        fn attach(tree: ScopeTree, nodes: &[RelationNode]) -> ScopeTree {
            nodes.iter().fold(tree, |tree, node| {
                let child = attach(ScopeTree::new(node.alias.clone()), &node.children);
                tree.child(node.name.clone(), child)
            })
        }
        attach(ScopeTree::new(self.table.clone()), &self.relations)
    }

    /// Maps every relationship alias to its target table and whether the
    /// whole path down to it is included.
    fn alias_map(&self) -> HashMap<&str, (&str, bool)> {
        fn walk<'a>(
            nodes: &'a [RelationNode],
            map: &mut HashMap<&'a str, (&'a str, bool)>,
            parent_included: bool,
        ) {
            for node in nodes {
                let included = parent_included && node.included;
                map.insert(node.alias.as_str(), (node.table.as_str(), included));
                walk(&node.children, map, included);
            }
        }
        let mut map = HashMap::new();
        walk(&self.relations, &mut map, true);
        map
    }
}

/// A handle returned by [`TableContext::include`], allowing descent into
/// nested relationships of the just-included node.
pub struct Include<E> {
    ctx: TableContext<E>,
    path: Vec<String>,
}

impl<E> Include<E> {
    /// Includes a child relationship of the previously included node.
    pub fn then_include(mut self, name: &str) -> Result<Self> {
        self.path.push(String::from(name));
        let node = relation::find_path_mut(&mut self.ctx.relations, &self.path)
            .ok_or_else(|| OrmError::UnknownRelationship(String::from(name)))?;
        node.included = true;
        Ok(self)
    }

    /// Finishes the include chain, returning the forked context.
    #[must_use]
    pub fn context(self) -> TableContext<E> {
        self.ctx
    }
}

impl<E> From<Include<E>> for TableContext<E> {
    fn from(include: Include<E>) -> Self {
        include.ctx
    }
}

fn require_column(schema: &TableSchema, table_label: &str, column: &str) -> Result<()> {
    if schema.contains(column) {
        Ok(())
    } else {
        Err(OrmError::UnknownColumn {
            table: String::from(table_label),
            column: String::from(column),
        })
    }
}

fn scalar_to_sql(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => Some(SqlValue::Null),
        Value::Bool(b) => Some(SqlValue::Bool(*b)),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => SqlValue::Int(i),
            None => SqlValue::Float(n.as_f64().unwrap_or_default()),
        }),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        // Nested objects and arrays are relationship payloads, not columns.
        Value::Array(_) | Value::Object(_) => None,
    }
}

impl<E: SqlExecutor> TableContext<E> {
    /// Awaits schema resolution for the main table and every declared
    /// relationship target, then returns the resolved views.
    async fn resolve(&self) -> Result<Resolved> {
        let mut tables = vec![self.table.clone()];
        relation::declared_tables(&self.relations, &mut tables);
        self.schemas
            .ensure(self.executor.as_ref(), &tables)
            .await?;

        let main = self.schemas.expect(&self.table).await?;
        let mut by_table = HashMap::new();
        for table in tables {
            let schema = self.schemas.expect(&table).await?;
            by_table.insert(table, schema);
        }
        Ok(Resolved { main, by_table })
    }

    fn identity_column(&self, resolved: &Resolved) -> Option<String> {
        self.identity
            .clone()
            .or_else(|| resolved.main.auto_increment().map(|c| c.name.clone()))
    }

    fn check_bounds(&self) -> Result<()> {
        if self.offset.is_some() && self.limit.is_none() {
            return Err(OrmError::OffsetWithoutLimit);
        }
        Ok(())
    }

    /// Checks every filter condition against the resolved schemas and, for
    /// queries, against the set of joined aliases.
    fn check_filter(&self, resolved: &Resolved, main_only: bool) -> Result<()> {
        let Some(filter) = &self.filter else {
            return Ok(());
        };
        let aliases = self.alias_map();
        let mut result = Ok(());
        filter.for_each_condition(&mut |cond| {
            if result.is_err() {
                return;
            }
            if cond.table == self.table {
                result = require_column(&resolved.main, &self.table, &cond.column);
                return;
            }
            if main_only {
                result = Err(OrmError::FilterOutOfScope);
                return;
            }
            match aliases.get(cond.table.as_str()) {
                Some((table, included)) => {
                    if !included {
                        result = Err(OrmError::FilterNotJoined(cond.table.clone()));
                        return;
                    }
                    match resolved.by_table.get(*table) {
                        Some(schema) => {
                            result = require_column(schema, &cond.table, &cond.column);
                        }
                        None => {
                            result = Err(OrmError::Internal(format!(
                                "schema for joined table `{table}` missing"
                            )));
                        }
                    }
                }
                None => {
                    result = Err(OrmError::Internal(format!(
                        "filter references unknown alias `{}`",
                        cond.table
                    )));
                }
            }
        });
        result
    }

    fn qualified(&self, table: &str, column: &str) -> String {
        format!(
            "{}.{}",
            self.executor.escape_table(table),
            self.executor.escape_column(column)
        )
    }

    fn push_sort(&self, w: &mut SqlWriter) {
        for (i, key) in self.sort.iter().enumerate() {
            w.push(if i == 0 { " ORDER BY " } else { ", " });
            w.push(&self.qualified(&self.table, &key.column));
            w.push(match key.direction {
                OrderDirection::Asc => " ASC",
                OrderDirection::Desc => " DESC",
            });
        }
    }

    fn push_selection(&self, w: &mut SqlWriter, resolved: &Resolved) -> Result<()> {
        let esc = self.executor.as_ref();
        if let Some(group) = &self.group {
            let mut first = true;
            for column in &group.columns {
                require_column(&resolved.main, &self.table, column)?;
                if !first {
                    w.push(", ");
                }
                w.push(&self.qualified(&self.table, column));
                w.push(" AS ");
                w.push(&esc.escape_column(column));
                first = false;
            }
            for (aggregate, alias) in &group.aggregates {
                if let Some(column) = aggregate.column() {
                    require_column(&resolved.main, &self.table, column)?;
                }
                if !first {
                    w.push(", ");
                }
                w.push(&aggregate.to_sql(&self.table, esc));
                w.push(" AS ");
                w.push(&esc.escape_column(alias));
                first = false;
            }
            if first {
                return Err(OrmError::Internal(String::from(
                    "group_by configured no columns or aggregates",
                )));
            }
            return Ok(());
        }

        if let Some(projection) = &self.projection {
            if projection.is_empty() {
                return Err(OrmError::EmptyRecord);
            }
            for (i, selected) in projection.iter().enumerate() {
                require_column(&resolved.main, &self.table, &selected.column)?;
                if i > 0 {
                    w.push(", ");
                }
                w.push(&self.qualified(&self.table, &selected.column));
                w.push(" AS ");
                w.push(&esc.escape_column(selected.alias.as_deref().unwrap_or(&selected.column)));
            }
            return Ok(());
        }

        // Default selection: every main column, then every included
        // relationship's columns under their namespaced aliases.
        for (i, column) in resolved.main.columns().iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push(&self.qualified(&self.table, &column.name));
            w.push(" AS ");
            w.push(&esc.escape_column(&column.name));
        }
        self.push_included_columns(w, &self.relations, resolved)
    }

    fn push_included_columns(
        &self,
        w: &mut SqlWriter,
        nodes: &[RelationNode],
        resolved: &Resolved,
    ) -> Result<()> {
        let esc = self.executor.as_ref();
        for node in nodes.iter().filter(|n| n.included) {
            let schema = resolved.by_table.get(&node.table).ok_or_else(|| {
                OrmError::Internal(format!("schema for joined table `{}` missing", node.table))
            })?;
            for column in schema.columns() {
                w.push(", ");
                w.push(&self.qualified(&node.alias, &column.name));
                w.push(" AS ");
                w.push(&esc.escape_column(&namespaced_alias(&node.alias, &column.name)));
            }
            self.push_included_columns(w, &node.children, resolved)?;
        }
        Ok(())
    }

    fn push_joins(
        &self,
        w: &mut SqlWriter,
        parent_alias: &str,
        parent_table: &str,
        nodes: &[RelationNode],
        resolved: &Resolved,
    ) -> Result<()> {
        let esc = self.executor.as_ref();
        for node in nodes.iter().filter(|n| n.included) {
            let parent_schema = resolved.by_table.get(parent_table).ok_or_else(|| {
                OrmError::Internal(format!("schema for `{parent_table}` missing"))
            })?;
            require_column(parent_schema, parent_alias, &node.local_key)?;
            let child_schema = resolved.by_table.get(&node.table).ok_or_else(|| {
                OrmError::Internal(format!("schema for joined table `{}` missing", node.table))
            })?;
            require_column(child_schema, &node.alias, &node.foreign_key)?;

            w.push(" LEFT JOIN ");
            w.push(&esc.escape_table(&node.table));
            w.push(" AS ");
            w.push(&esc.escape_table(&node.alias));
            w.push(" ON ");
            w.push(&self.qualified(parent_alias, &node.local_key));
            w.push(" = ");
            w.push(&self.qualified(&node.alias, &node.foreign_key));

            self.push_joins(w, &node.alias, &node.table, &node.children, resolved)?;
        }
        Ok(())
    }

    fn compile_select(&self, resolved: &Resolved) -> Result<Command> {
        self.check_bounds()?;
        self.check_filter(resolved, false)?;
        for key in &self.sort {
            require_column(&resolved.main, &self.table, &key.column)?;
        }

        let esc = self.executor.as_ref();
        let mut w = SqlWriter::new();
        w.push("SELECT ");
        self.push_selection(&mut w, resolved)?;
        w.push(" FROM ");

        // A 1:n join combined with LIMIT would truncate mid-group, so the
        // main table is paginated in an isolated sub-select and the joins
        // plus the remaining predicate apply outside it.
        let isolated = self.limit.is_some() && relation::any_included_many(&self.relations);
        if isolated {
            w.push("(SELECT * FROM ");
            w.push(&esc.escape_table(&self.table));
            if let Some(filter) = &self.filter {
                if filter.matches(ScopeFilter::Only(&self.table)) {
                    w.push(" WHERE ");
                    filter.render(ScopeFilter::Only(&self.table), esc, &mut w);
                }
            }
            self.push_sort(&mut w);
            w.push(" LIMIT ");
            w.bind(SqlValue::Int(self.limit.unwrap_or_default()));
            if let Some(offset) = self.offset {
                w.push(" OFFSET ");
                w.bind(SqlValue::Int(offset));
            }
            w.push(") AS ");
            w.push(&esc.escape_table(&self.table));
        } else {
            w.push(&esc.escape_table(&self.table));
        }

        self.push_joins(&mut w, &self.table, &self.table, &self.relations, resolved)?;

        let outer_scope = if isolated {
            ScopeFilter::Except(&self.table)
        } else {
            ScopeFilter::All
        };
        if let Some(filter) = &self.filter {
            if filter.matches(outer_scope) {
                w.push(" WHERE ");
                filter.render(outer_scope, esc, &mut w);
            }
        }

        if let Some(group) = &self.group {
            for (i, column) in group.columns.iter().enumerate() {
                w.push(if i == 0 { " GROUP BY " } else { ", " });
                w.push(&self.qualified(&self.table, column));
            }
        }

        self.push_sort(&mut w);

        if !isolated {
            if let Some(limit) = self.limit {
                w.push(" LIMIT ");
                w.bind(SqlValue::Int(limit));
                if let Some(offset) = self.offset {
                    w.push(" OFFSET ");
                    w.bind(SqlValue::Int(offset));
                }
            }
        }

        let (text, args) = w.finish();
        Ok(Command {
            kind: CommandKind::Query,
            table: self.table.clone(),
            text,
            args,
        })
    }

    fn compile_count(&self, resolved: &Resolved) -> Result<Command> {
        self.check_filter(resolved, false)?;
        let esc = self.executor.as_ref();
        let mut w = SqlWriter::new();
        w.push("SELECT COUNT(*) FROM ");
        w.push(&esc.escape_table(&self.table));
        self.push_joins(&mut w, &self.table, &self.table, &self.relations, resolved)?;
        if let Some(filter) = &self.filter {
            if filter.matches(ScopeFilter::All) {
                w.push(" WHERE ");
                filter.render(ScopeFilter::All, esc, &mut w);
            }
        }
        let (text, args) = w.finish();
        Ok(Command {
            kind: CommandKind::Query,
            table: self.table.clone(),
            text,
            args,
        })
    }

    fn nest_plan(&self, resolved: &Resolved) -> Result<NestPlan> {
        fn plans(
            nodes: &[RelationNode],
            parent_namespace: &str,
            resolved: &Resolved,
        ) -> Result<Vec<NestPlan>> {
            let mut out = Vec::new();
            for node in nodes.iter().filter(|n| n.included) {
                let schema = resolved.by_table.get(&node.table).ok_or_else(|| {
                    OrmError::Internal(format!("schema for joined table `{}` missing", node.table))
                })?;
                out.push(NestPlan {
                    name: node.name.clone(),
                    prefix: format!("{}_", node.alias),
                    pk_alias: schema
                        .primary_key()
                        .map(|pk| namespaced_alias(&node.alias, &pk.name)),
                    link: Some(Link {
                        parent_key: namespaced_alias(parent_namespace, &node.local_key),
                        child_key: namespaced_alias(&node.alias, &node.foreign_key),
                    }),
                    cardinality: node.cardinality,
                    children: plans(&node.children, &node.alias, resolved)?,
                });
            }
            Ok(out)
        }

        let pk_alias = self
            .identity_column(resolved)
            .or_else(|| resolved.main.primary_key().map(|c| c.name.clone()));
        Ok(NestPlan {
            name: String::new(),
            prefix: String::new(),
            pk_alias,
            link: None,
            cardinality: Cardinality::One,
            children: plans(&self.relations, "", resolved)?,
        })
    }

    fn emit_ok(&self, cmd: &Command, affected: Option<u64>) {
        self.events
            .emit(&CommandEvent::finished(cmd, affected, None));
    }

    fn emit_err(&self, cmd: &Command, source: BoxError) -> OrmError {
        self.events
            .emit(&CommandEvent::finished(cmd, None, Some(source.to_string())));
        OrmError::Executor {
            table: self.table.clone(),
            command: cmd.text.clone(),
            source,
        }
    }

    /// Compiles and executes the query, reconstructing flat joined rows
    /// into the nested shape the included relationships declare. Grouped
    /// and projected results stay flat.
    pub async fn select(&self) -> Result<Vec<Record>> {
        let resolved = self.resolve().await?;
        let cmd = self.compile_select(&resolved)?;
        debug!(table = %self.table, sql = %cmd.text, "executing query");
        let rows = match self.executor.query(&cmd).await {
            Ok(rows) => {
                self.emit_ok(&cmd, Some(rows.len() as u64));
                rows
            }
            Err(source) => return Err(self.emit_err(&cmd, source)),
        };
        if self.group.is_some() || self.projection.is_some() {
            return Ok(rows);
        }
        let plan = self.nest_plan(&resolved)?;
        Ok(nest::reconstruct(&rows, &plan))
    }

    /// Compiles and executes a `COUNT(*)` variant sharing this context's
    /// FROM/JOIN/WHERE state.
    pub async fn count(&self) -> Result<i64> {
        let resolved = self.resolve().await?;
        let cmd = self.compile_count(&resolved)?;
        debug!(table = %self.table, sql = %cmd.text, "executing count");
        match self.executor.count(&cmd).await {
            Ok(count) => {
                self.emit_ok(&cmd, Some(count.max(0) as u64));
                Ok(count)
            }
            Err(source) => Err(self.emit_err(&cmd, source)),
        }
    }

    /// Inserts one record, returning it with the generated identity value
    /// assigned.
    pub async fn insert_one(&self, record: Record) -> Result<Record> {
        let mut inserted = self.insert_many(vec![record]).await?;
        inserted
            .pop()
            .ok_or_else(|| OrmError::Internal(String::from("insert returned no record")))
    }

    /// Inserts records in one statement, back-filling generated identity
    /// values onto the returned records in submission order. An empty input
    /// short-circuits to an empty result.
    pub async fn insert_many(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        if records.is_empty() {
            return Ok(records);
        }
        let resolved = self.resolve().await?;
        let identity = self.identity_column(&resolved);

        // Union of scalar keys across all records, in first-seen order.
        // Nested objects/arrays are relationship payloads and are dropped;
        // the identity column is never inserted explicitly.
        let mut keys: Vec<String> = Vec::new();
        for record in &records {
            for (key, value) in record {
                if identity.as_deref() == Some(key.as_str()) {
                    continue;
                }
                if scalar_to_sql(value).is_none() {
                    continue;
                }
                if !keys.iter().any(|k| k == key) {
                    keys.push(key.clone());
                }
            }
        }
        if keys.is_empty() {
            return Err(OrmError::EmptyRecord);
        }
        if self.options.sort_insert_keys {
            keys.sort();
        }
        for key in &keys {
            require_column(&resolved.main, &self.table, key)?;
        }

        let esc = self.executor.as_ref();
        let mut w = SqlWriter::new();
        w.push("INSERT INTO ");
        w.push(&esc.escape_table(&self.table));
        w.push(" (");
        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push(&esc.escape_column(key));
        }
        w.push(") VALUES ");
        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push("(");
            // Missing keys become explicit NULLs so every tuple has the
            // same arity as the column list.
            for (j, key) in keys.iter().enumerate() {
                if j > 0 {
                    w.push(", ");
                }
                let value = record
                    .get(key)
                    .and_then(scalar_to_sql)
                    .unwrap_or(SqlValue::Null);
                w.bind(value);
            }
            w.push(")");
        }

        let (text, args) = w.finish();
        let cmd = Command {
            kind: CommandKind::Insert,
            table: self.table.clone(),
            text,
            args,
        };
        debug!(table = %self.table, rows = records.len(), sql = %cmd.text, "executing insert");
        let ids = match self.executor.insert(&cmd, records.len()).await {
            Ok(ids) => {
                self.emit_ok(&cmd, Some(records.len() as u64));
                ids
            }
            Err(source) => return Err(self.emit_err(&cmd, source)),
        };

        let mut records = records;
        if let Some(id_col) = identity {
            for (record, id) in records.iter_mut().zip(ids) {
                record.insert(id_col.clone(), Value::from(id));
            }
        }
        Ok(records)
    }

    async fn run_update(&self, changes: Record) -> Result<u64> {
        let resolved = self.resolve().await?;
        self.check_filter(&resolved, true)?;
        let identity = self.identity_column(&resolved);

        let esc = self.executor.as_ref();
        let mut w = SqlWriter::new();
        w.push("UPDATE ");
        w.push(&esc.escape_table(&self.table));
        w.push(" SET ");
        let mut wrote = false;
        for (key, value) in &changes {
            if identity.as_deref() == Some(key.as_str()) {
                continue;
            }
            let Some(value) = scalar_to_sql(value) else {
                continue;
            };
            require_column(&resolved.main, &self.table, key)?;
            if wrote {
                w.push(", ");
            }
            w.push(&esc.escape_column(key));
            w.push(" = ");
            w.bind(value);
            wrote = true;
        }
        if !wrote {
            return Err(OrmError::EmptyRecord);
        }
        if let Some(filter) = &self.filter {
            w.push(" WHERE ");
            filter.render(ScopeFilter::All, esc, &mut w);
        }

        let (text, args) = w.finish();
        let cmd = Command {
            kind: CommandKind::Update,
            table: self.table.clone(),
            text,
            args,
        };
        debug!(table = %self.table, sql = %cmd.text, "executing update");
        match self.executor.update(&cmd).await {
            Ok(affected) => {
                self.emit_ok(&cmd, Some(affected));
                Ok(affected)
            }
            Err(source) => Err(self.emit_err(&cmd, source)),
        }
    }

    /// Applies a partial record to the filtered rows. Refuses to run
    /// without a filter; use [`TableContext::update_all`] for deliberate
    /// whole-table updates.
    pub async fn update(&self, changes: Record) -> Result<u64> {
        if self.filter.is_none() {
            return Err(OrmError::UnfilteredMutation("update"));
        }
        self.run_update(changes).await
    }

    /// Applies a partial record without requiring a filter. Gated on
    /// [`ContextOptions::allow_unfiltered_update`].
    pub async fn update_all(&self, changes: Record) -> Result<u64> {
        if !self.options.allow_unfiltered_update {
            return Err(OrmError::UpdateAllDisabled);
        }
        self.run_update(changes).await
    }

    /// Deletes the filtered rows. Refuses to run without a filter.
    pub async fn delete(&self) -> Result<u64> {
        if self.filter.is_none() {
            return Err(OrmError::UnfilteredMutation("delete"));
        }
        let resolved = self.resolve().await?;
        self.check_filter(&resolved, true)?;

        let esc = self.executor.as_ref();
        let mut w = SqlWriter::new();
        w.push("DELETE FROM ");
        w.push(&esc.escape_table(&self.table));
        if let Some(filter) = &self.filter {
            w.push(" WHERE ");
            filter.render(ScopeFilter::All, esc, &mut w);
        }

        let (text, args) = w.finish();
        let cmd = Command {
            kind: CommandKind::Delete,
            table: self.table.clone(),
            text,
            args,
        };
        debug!(table = %self.table, sql = %cmd.text, "executing delete");
        match self.executor.delete(&cmd).await {
            Ok(affected) => {
                self.emit_ok(&cmd, Some(affected));
                Ok(affected)
            }
            Err(source) => Err(self.emit_err(&cmd, source)),
        }
    }

    /// Deletes every row of the table. Gated on
    /// [`ContextOptions::allow_truncate`].
    pub async fn truncate(&self) -> Result<u64> {
        if !self.options.allow_truncate {
            return Err(OrmError::TruncateDisabled);
        }
        self.resolve().await?;

        let esc = self.executor.as_ref();
        let mut w = SqlWriter::new();
        w.push("DELETE FROM ");
        w.push(&esc.escape_table(&self.table));
        let (text, args) = w.finish();
        let cmd = Command {
            kind: CommandKind::Delete,
            table: self.table.clone(),
            text,
            args,
        };
        debug!(table = %self.table, sql = %cmd.text, "executing truncate");
        match self.executor.delete(&cmd).await {
            Ok(affected) => {
                self.emit_ok(&cmd, Some(affected));
                Ok(affected)
            }
            Err(source) => Err(self.emit_err(&cmd, source)),
        }
    }

    /// Returns the resolved column descriptors for the main table.
    pub async fn schema(&self) -> Result<Vec<ColumnDescriptor>> {
        let resolved = self.resolve().await?;
        Ok(resolved.main.columns().to_vec())
    }
}
