//! WHERE clause expression trees.
//!
//! A predicate is built through a scope object handed to a caller-supplied
//! closure: `scope.col("Composer").equals("AC/DC").and(|s| ...)`. Each
//! comparison returns a [`Chain`] exposing only `and`/`or`, whose callbacks
//! receive a fresh scope bound to the original table (or, after
//! [`WhereScope::rel`], to a declared relationship's namespaced alias). A
//! callback that produces more than one condition becomes a parenthesized
//! group.
//!
//! Rendering and argument extraction are a single depth-first walk through
//! [`crate::writer::SqlWriter`], so the `?` placeholders and the argument
//! list always agree, including when rendering is filtered to a single
//! table scope.

use std::fmt;
use std::rc::Rc;

use crate::ident::Escape;
use crate::value::{SqlValue, ToSqlValue};
use crate::writer::SqlWriter;

/// How two adjacent conditions are connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOp {
    /// `AND` connection. Also used (and ignored) for the first condition.
    And,
    /// `OR` connection.
    Or,
}

/// Comparison operators supported by the predicate builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=` (or `IS` against NULL).
    Eq,
    /// `<>` (or `IS NOT` against NULL).
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `IN (...)`
    In,
    /// `LIKE`
    Like,
}

impl CompareOp {
    fn token(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::In => "IN",
            Self::Like => "LIKE",
        }
    }
}

/// A single comparison, scoped to one table alias.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Table alias the column belongs to (main table name or a
    /// relationship's namespaced alias).
    pub table: String,
    /// Raw column name.
    pub column: String,
    /// Comparison operator.
    pub op: CompareOp,
    /// Bound values: one for binary operators, any number for `In`.
    pub values: Vec<SqlValue>,
    /// Whether the comparison is negated.
    pub negated: bool,
}

/// A node in the predicate tree: a single condition, or a parenthesized run
/// of chained nodes whose first element opens the group.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereNode {
    /// A single comparison.
    Leaf(Condition),
    /// A chained run; nested occurrences render inside parentheses.
    Group(Vec<(ChainOp, WhereNode)>),
}

/// Restricts rendering to conditions belonging to a table scope.
#[derive(Debug, Clone, Copy)]
pub enum ScopeFilter<'a> {
    /// Render every condition.
    All,
    /// Render only conditions scoped to the given alias.
    Only(&'a str),
    /// Render only conditions not scoped to the given alias.
    Except(&'a str),
}

impl ScopeFilter<'_> {
    fn admits(&self, table: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(alias) => table == *alias,
            Self::Except(alias) => table != *alias,
        }
    }
}

impl WhereNode {
    /// Returns whether any condition under this node survives the scope
    /// filter. Zero surviving conditions is a valid state ("no filter"),
    /// rendered as empty text with no arguments.
    #[must_use]
    pub fn matches(&self, scope: ScopeFilter<'_>) -> bool {
        match self {
            Self::Leaf(c) => scope.admits(&c.table),
            Self::Group(items) => items.iter().any(|(_, node)| node.matches(scope)),
        }
    }

    /// Visits every condition in left-to-right depth-first order.
    pub fn for_each_condition<'a>(&'a self, f: &mut impl FnMut(&'a Condition)) {
        match self {
            Self::Leaf(c) => f(c),
            Self::Group(items) => {
                for (_, node) in items {
                    node.for_each_condition(f);
                }
            }
        }
    }

    /// Renders the predicate (without a leading `WHERE`) into the writer,
    /// restricted to the given scope. Placeholder order and argument order
    /// are produced by the same walk.
    pub fn render(&self, scope: ScopeFilter<'_>, esc: &dyn Escape, w: &mut SqlWriter) {
        match self {
            Self::Leaf(c) => render_condition(c, esc, w),
            Self::Group(items) => render_run(items, scope, esc, w),
        }
    }

    /// Renders to a standalone string (for inspection and tests).
    #[must_use]
    pub fn to_sql(&self, scope: ScopeFilter<'_>, esc: &dyn Escape) -> String {
        let mut w = SqlWriter::new();
        self.render(scope, esc, &mut w);
        w.finish().0
    }

    /// Returns the bound arguments in placeholder order under the scope.
    #[must_use]
    pub fn args(&self, scope: ScopeFilter<'_>) -> Vec<SqlValue> {
        let mut w = SqlWriter::new();
        self.render(scope, &crate::ident::Backtick, &mut w);
        w.finish().1
    }
}

fn render_run(items: &[(ChainOp, WhereNode)], scope: ScopeFilter<'_>, esc: &dyn Escape, w: &mut SqlWriter) {
    let mut first = true;
    for (op, node) in items {
        if !node.matches(scope) {
            continue;
        }
        if !first {
            w.push(match op {
                ChainOp::And => " AND ",
                ChainOp::Or => " OR ",
            });
        }
        match node {
            WhereNode::Leaf(c) => render_condition(c, esc, w),
            WhereNode::Group(sub) => {
                w.push("(");
                render_run(sub, scope, esc, w);
                w.push(")");
            }
        }
        first = false;
    }
}

fn render_condition(c: &Condition, esc: &dyn Escape, w: &mut SqlWriter) {
    let column = format!(
        "{}.{}",
        esc.escape_table(&c.table),
        esc.escape_column(&c.column)
    );

    if c.op == CompareOp::In {
        // An empty value list can never match; standard SQL rejects `IN ()`.
        if c.values.is_empty() {
            w.push(if c.negated { "1 = 1" } else { "1 = 0" });
            return;
        }
        if c.negated {
            w.push("NOT (");
        }
        w.push(&column);
        w.push(" IN (");
        w.bind_list(c.values.iter().cloned());
        w.push(")");
        if c.negated {
            w.push(")");
        }
        return;
    }

    let value = c.values.first().cloned().unwrap_or(SqlValue::Null);

    // NULL comparisons fold to IS / IS NOT; negation flips between them
    // instead of wrapping in NOT, so `not().equals(NULL)` reads `IS NOT NULL`.
    if value.is_null() && matches!(c.op, CompareOp::Eq | CompareOp::Ne) {
        let inverted = (c.op == CompareOp::Ne) ^ c.negated;
        w.push(&column);
        w.push(if inverted { " IS NOT NULL" } else { " IS NULL" });
        return;
    }

    if c.negated {
        w.push("NOT (");
    }
    w.push(&column);
    w.push(" ");
    w.push(c.op.token());
    w.push(" ");
    w.bind(value);
    if c.negated {
        w.push(")");
    }
}

/// Errors raised while building a predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateError {
    /// `rel()` named a relationship that is not declared under the current
    /// scope.
    UnknownRelation(String),
    /// An `and`/`or` callback completed no comparison.
    EmptyBranch,
}

impl fmt::Display for PredicateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRelation(name) => {
                write!(f, "unknown relationship `{name}` in filter scope")
            }
            Self::EmptyBranch => write!(f, "filter branch completed no comparison"),
        }
    }
}

impl std::error::Error for PredicateError {}

/// The alias namespace a predicate may reference: the main table and the
/// declared relationship tree beneath it.
#[derive(Debug, Clone, Default)]
pub struct ScopeTree {
    /// Alias of this scope (main table name, or a namespaced relationship
    /// alias).
    pub alias: String,
    /// Child scopes, keyed by relationship name.
    pub children: Vec<(String, ScopeTree)>,
}

impl ScopeTree {
    /// Creates a scope with the given alias and no children.
    #[must_use]
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            children: Vec::new(),
        }
    }

    /// Attaches a child scope under a relationship name.
    #[must_use]
    pub fn child(mut self, name: impl Into<String>, tree: ScopeTree) -> Self {
        self.children.push((name.into(), tree));
        self
    }

    fn find(&self, name: &str) -> Option<&ScopeTree> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }
}

/// A table-scoped handle handed to filter callbacks.
#[derive(Debug, Clone)]
pub struct WhereScope {
    root: Rc<ScopeTree>,
    current: ScopeTree,
    err: Option<PredicateError>,
}

impl WhereScope {
    fn root_scope(root: Rc<ScopeTree>) -> Self {
        let current = (*root).clone();
        Self {
            root,
            current,
            err: None,
        }
    }

    /// Navigates into a declared relationship, scoping subsequent column
    /// references to its namespaced alias. Unknown names surface as a
    /// configuration error when the filter is finished.
    #[must_use]
    pub fn rel(mut self, name: &str) -> Self {
        match self.current.find(name) {
            Some(child) => {
                self.current = child.clone();
                self
            }
            None => {
                self.err
                    .get_or_insert(PredicateError::UnknownRelation(String::from(name)));
                self
            }
        }
    }

    /// References a column in the current scope.
    #[must_use]
    pub fn col(self, name: &str) -> ColumnRef {
        ColumnRef {
            root: self.root,
            table: self.current.alias.clone(),
            column: String::from(name),
            negated: false,
            err: self.err,
        }
    }
}

/// A column reference awaiting its comparison.
#[derive(Debug, Clone)]
pub struct ColumnRef {
    root: Rc<ScopeTree>,
    table: String,
    column: String,
    negated: bool,
    err: Option<PredicateError>,
}

impl ColumnRef {
    /// Negates the next comparison.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    fn complete(self, op: CompareOp, values: Vec<SqlValue>) -> Chain {
        let node = WhereNode::Leaf(Condition {
            table: self.table,
            column: self.column,
            op,
            values,
            negated: self.negated,
        });
        Chain {
            root: self.root,
            nodes: vec![(ChainOp::And, node)],
            err: self.err,
        }
    }

    /// `column = value` (`IS NULL` when the value is NULL).
    #[must_use]
    pub fn equals<V: ToSqlValue>(self, value: V) -> Chain {
        self.complete(CompareOp::Eq, vec![value.to_sql_value()])
    }

    /// `column <> value` (`IS NOT NULL` when the value is NULL).
    #[must_use]
    pub fn not_equals<V: ToSqlValue>(self, value: V) -> Chain {
        self.complete(CompareOp::Ne, vec![value.to_sql_value()])
    }

    /// `column < value`
    #[must_use]
    pub fn less_than<V: ToSqlValue>(self, value: V) -> Chain {
        self.complete(CompareOp::Lt, vec![value.to_sql_value()])
    }

    /// `column <= value`
    #[must_use]
    pub fn less_than_or_equal<V: ToSqlValue>(self, value: V) -> Chain {
        self.complete(CompareOp::Lte, vec![value.to_sql_value()])
    }

    /// `column > value`
    #[must_use]
    pub fn greater_than<V: ToSqlValue>(self, value: V) -> Chain {
        self.complete(CompareOp::Gt, vec![value.to_sql_value()])
    }

    /// `column >= value`
    #[must_use]
    pub fn greater_than_or_equal<V: ToSqlValue>(self, value: V) -> Chain {
        self.complete(CompareOp::Gte, vec![value.to_sql_value()])
    }

    /// `column IN (values...)`. An empty list renders as an always-false
    /// predicate rather than invalid `IN ()`.
    #[must_use]
    pub fn is_in<V: ToSqlValue>(self, values: Vec<V>) -> Chain {
        let values = values.into_iter().map(ToSqlValue::to_sql_value).collect();
        self.complete(CompareOp::In, values)
    }

    /// `column LIKE pattern` (`%` wildcards are the caller's).
    #[must_use]
    pub fn like(self, pattern: &str) -> Chain {
        self.complete(CompareOp::Like, vec![pattern.to_sql_value()])
    }

    /// `column LIKE %fragment%`.
    #[must_use]
    pub fn contains(self, fragment: &str) -> Chain {
        self.complete(CompareOp::Like, vec![format!("%{fragment}%").to_sql_value()])
    }
}

/// A completed comparison, chainable with `and`/`or`.
#[derive(Debug, Clone)]
pub struct Chain {
    root: Rc<ScopeTree>,
    nodes: Vec<(ChainOp, WhereNode)>,
    err: Option<PredicateError>,
}

impl Chain {
    fn extend(mut self, op: ChainOp, f: impl FnOnce(WhereScope) -> Chain) -> Self {
        let sub = f(WhereScope::root_scope(Rc::clone(&self.root)));
        if self.err.is_none() {
            self.err = sub.err;
        }
        match sub.nodes.len() {
            0 => {
                self.err.get_or_insert(PredicateError::EmptyBranch);
            }
            1 => {
                let (_, node) = sub.nodes.into_iter().next().expect("len checked");
                self.nodes.push((op, node));
            }
            _ => self.nodes.push((op, WhereNode::Group(sub.nodes))),
        }
        self
    }

    /// Chains another comparison with `AND`. The callback receives a fresh
    /// scope bound to the original table; a callback that chains further
    /// becomes a parenthesized group.
    #[must_use]
    pub fn and(self, f: impl FnOnce(WhereScope) -> Chain) -> Self {
        self.extend(ChainOp::And, f)
    }

    /// Chains another comparison with `OR`.
    #[must_use]
    pub fn or(self, f: impl FnOnce(WhereScope) -> Chain) -> Self {
        self.extend(ChainOp::Or, f)
    }
}

/// Runs a filter callback against a scope tree and returns the finished
/// predicate tree.
pub fn build(
    tree: ScopeTree,
    f: impl FnOnce(WhereScope) -> Chain,
) -> Result<WhereNode, PredicateError> {
    let root = Rc::new(tree);
    let chain = f(WhereScope::root_scope(root));
    if let Some(err) = chain.err {
        return Err(err);
    }
    if chain.nodes.is_empty() {
        return Err(PredicateError::EmptyBranch);
    }
    Ok(WhereNode::Group(chain.nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::Backtick;

    fn track_scope() -> ScopeTree {
        ScopeTree::new("Track").child(
            "album",
            ScopeTree::new("album").child("artist", ScopeTree::new("album_artist")),
        )
    }

    fn render(node: &WhereNode, scope: ScopeFilter<'_>) -> (String, Vec<SqlValue>) {
        let mut w = SqlWriter::new();
        node.render(scope, &Backtick, &mut w);
        w.finish()
    }

    #[test]
    fn single_condition() {
        let node = build(track_scope(), |s| s.col("Composer").equals("AC/DC")).unwrap();
        let (sql, args) = render(&node, ScopeFilter::All);
        assert_eq!(sql, "`Track`.`Composer` = ?");
        assert_eq!(args, vec![SqlValue::Text(String::from("AC/DC"))]);
    }

    #[test]
    fn and_chain_stays_flat() {
        let node = build(track_scope(), |s| {
            s.col("Composer")
                .equals("AC/DC")
                .and(|s| s.col("Bytes").greater_than(7_032_162_i64))
        })
        .unwrap();
        let (sql, args) = render(&node, ScopeFilter::All);
        assert_eq!(sql, "`Track`.`Composer` = ? AND `Track`.`Bytes` > ?");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn nested_callback_becomes_group() {
        let node = build(track_scope(), |s| {
            s.col("Composer").equals("AC/DC").and(|s| {
                s.col("Bytes")
                    .greater_than(1_i64)
                    .or(|s| s.col("Milliseconds").less_than(100_i64))
            })
        })
        .unwrap();
        let (sql, args) = render(&node, ScopeFilter::All);
        assert_eq!(
            sql,
            "`Track`.`Composer` = ? AND (`Track`.`Bytes` > ? OR `Track`.`Milliseconds` < ?)"
        );
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn placeholder_argument_parity() {
        let node = build(track_scope(), |s| {
            s.col("A")
                .is_in(vec![1_i64, 2, 3])
                .or(|s| s.col("B").not().equals(4_i64))
                .and(|s| s.col("C").like("x%").or(|s| s.col("D").equals(5_i64)))
        })
        .unwrap();
        let (sql, args) = render(&node, ScopeFilter::All);
        assert_eq!(sql.matches('?').count(), args.len());
        assert_eq!(
            args,
            vec![
                SqlValue::Int(1),
                SqlValue::Int(2),
                SqlValue::Int(3),
                SqlValue::Int(4),
                SqlValue::Text(String::from("x%")),
                SqlValue::Int(5),
            ]
        );
    }

    #[test]
    fn null_folds_to_is() {
        let node = build(track_scope(), |s| s.col("Composer").equals(SqlValue::Null)).unwrap();
        assert_eq!(
            node.to_sql(ScopeFilter::All, &Backtick),
            "`Track`.`Composer` IS NULL"
        );
        assert!(node.args(ScopeFilter::All).is_empty());
    }

    #[test]
    fn negated_null_equality_reads_is_not() {
        let node = build(track_scope(), |s| {
            s.col("Composer").not().equals(SqlValue::Null)
        })
        .unwrap();
        assert_eq!(
            node.to_sql(ScopeFilter::All, &Backtick),
            "`Track`.`Composer` IS NOT NULL"
        );
    }

    #[test]
    fn negated_comparison_wraps_not() {
        let node = build(track_scope(), |s| s.col("Bytes").not().equals(1_i64)).unwrap();
        assert_eq!(
            node.to_sql(ScopeFilter::All, &Backtick),
            "NOT (`Track`.`Bytes` = ?)"
        );
    }

    #[test]
    fn empty_in_is_always_false() {
        let node = build(track_scope(), |s| s.col("Bytes").is_in(Vec::<i64>::new())).unwrap();
        assert_eq!(node.to_sql(ScopeFilter::All, &Backtick), "1 = 0");
        assert!(node.args(ScopeFilter::All).is_empty());
    }

    #[test]
    fn contains_wraps_wildcards() {
        let node = build(track_scope(), |s| s.col("Name").contains("rock")).unwrap();
        assert_eq!(
            node.args(ScopeFilter::All),
            vec![SqlValue::Text(String::from("%rock%"))]
        );
    }

    #[test]
    fn relationship_scope_uses_namespaced_alias() {
        let node = build(track_scope(), |s| {
            s.col("Bytes")
                .greater_than(1_i64)
                .and(|s| s.rel("album").rel("artist").col("Name").equals("AC/DC"))
        })
        .unwrap();
        let (sql, _) = render(&node, ScopeFilter::All);
        assert_eq!(
            sql,
            "`Track`.`Bytes` > ? AND `album_artist`.`Name` = ?"
        );
    }

    #[test]
    fn unknown_relationship_is_an_error() {
        let err = build(track_scope(), |s| s.rel("nope").col("X").equals(1_i64)).unwrap_err();
        assert_eq!(err, PredicateError::UnknownRelation(String::from("nope")));
    }

    #[test]
    fn scope_filter_splits_main_from_joined() {
        let node = build(track_scope(), |s| {
            s.col("Bytes")
                .greater_than(1_i64)
                .and(|s| s.rel("album").col("Title").equals("Let There Be Rock"))
        })
        .unwrap();
        let (main_sql, main_args) = render(&node, ScopeFilter::Only("Track"));
        assert_eq!(main_sql, "`Track`.`Bytes` > ?");
        assert_eq!(main_args, vec![SqlValue::Int(1)]);

        let (rest_sql, rest_args) = render(&node, ScopeFilter::Except("Track"));
        assert_eq!(rest_sql, "`album`.`Title` = ?");
        assert_eq!(rest_args.len(), 1);

        assert!(node.matches(ScopeFilter::Only("Track")));
        assert!(!node.matches(ScopeFilter::Only("absent")));
    }

    #[test]
    fn filtered_group_drops_cleanly() {
        // A group whose every member is filtered out must not leave empty
        // parentheses behind.
        let node = build(track_scope(), |s| {
            s.col("Bytes").greater_than(1_i64).and(|s| {
                s.rel("album")
                    .col("Title")
                    .equals("a")
                    .or(|s| s.rel("album").col("Title").equals("b"))
            })
        })
        .unwrap();
        let (sql, args) = render(&node, ScopeFilter::Only("Track"));
        assert_eq!(sql, "`Track`.`Bytes` > ?");
        assert_eq!(args.len(), 1);
    }
}
