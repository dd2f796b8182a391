//! Relationship declarations and the per-context relationship tree.
//!
//! Relationships are declared through a staged builder whose stages are
//! encoded in the type system, so the key pair must be supplied before
//! children can be attached and a half-configured declaration cannot reach
//! the context. The finished tree is plain owned data: forking a context
//! clones it, which is exactly the deep copy that keeps include marks from
//! leaking between sibling forks.

use std::marker::PhantomData;

use crate::error::{OrmError, Result};
use crate::schema::namespaced_alias;

/// Cardinality of a declared relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// 1:1, reconstructed as a single nested object (or `null`).
    One,
    /// 1:n, reconstructed as a deduplicated array of nested objects.
    Many,
}

/// A configured node in a context's relationship tree.
#[derive(Debug, Clone)]
pub struct RelationNode {
    /// Relationship name (distinct from the target table name).
    pub name: String,
    /// 1:1 or 1:n.
    pub cardinality: Cardinality,
    /// Target table name.
    pub table: String,
    /// Key column on the parent side of the join.
    pub local_key: String,
    /// Key column on the target side of the join.
    pub foreign_key: String,
    /// Namespaced alias: `parent_alias '_' name` (root children: the name).
    pub alias: String,
    /// Whether the next compiled query joins this node.
    pub included: bool,
    /// Nested relationships under this node.
    pub children: Vec<RelationNode>,
}

// Typestate markers for the declaration builder.

/// Marker: the key pair has not been supplied yet.
pub struct NeedsKeys;
/// Marker: the primary key is set; the foreign key is still missing.
pub struct NeedsForeign;
/// Marker: the declaration is complete and children may be attached.
pub struct Ready;

#[derive(Debug, Clone)]
struct Draft {
    name: String,
    cardinality: Cardinality,
    table: Option<String>,
    local_key: Option<String>,
    foreign_key: Option<String>,
    children: Vec<Draft>,
}

/// A staged relationship declaration.
///
/// Produced by [`crate::TableContext::has_one`] / `has_many` callbacks and
/// by the nested `and_that_has_*` verbs; only the configuration verbs valid
/// for the current stage are available.
pub struct Declare<Stage> {
    draft: Draft,
    _stage: PhantomData<Stage>,
}

impl<Stage> Declare<Stage> {
    fn advance<Next>(self) -> Declare<Next> {
        Declare {
            draft: self.draft,
            _stage: PhantomData,
        }
    }
}

pub(crate) fn declare(name: &str, cardinality: Cardinality) -> Declare<NeedsKeys> {
    Declare {
        draft: Draft {
            name: String::from(name),
            cardinality,
            table: None,
            local_key: None,
            foreign_key: None,
            children: Vec::new(),
        },
        _stage: PhantomData,
    }
}

impl Declare<NeedsKeys> {
    /// Sets the target table; defaults to the relationship name.
    #[must_use]
    pub fn from_table(mut self, table: &str) -> Self {
        self.draft.table = Some(String::from(table));
        self
    }

    /// Sets the parent-side key column.
    #[must_use]
    pub fn with_primary(mut self, column: &str) -> Declare<NeedsForeign> {
        self.draft.local_key = Some(String::from(column));
        self.advance()
    }

    /// Sets both key columns at once.
    #[must_use]
    pub fn with_keys(mut self, primary: &str, foreign: &str) -> Declare<Ready> {
        self.draft.local_key = Some(String::from(primary));
        self.draft.foreign_key = Some(String::from(foreign));
        self.advance()
    }
}

impl Declare<NeedsForeign> {
    /// Sets the target-side key column, completing the declaration.
    #[must_use]
    pub fn with_foreign(mut self, column: &str) -> Declare<Ready> {
        self.draft.foreign_key = Some(String::from(column));
        self.advance()
    }
}

impl Declare<Ready> {
    fn nest(
        mut self,
        name: &str,
        cardinality: Cardinality,
        f: impl FnOnce(Declare<NeedsKeys>) -> Declare<Ready>,
    ) -> Self {
        let child = f(declare(name, cardinality));
        self.draft.children.push(child.draft);
        self
    }

    /// Declares a nested 1:1 relationship under this one.
    #[must_use]
    pub fn and_that_has_one(
        self,
        name: &str,
        f: impl FnOnce(Declare<NeedsKeys>) -> Declare<Ready>,
    ) -> Self {
        self.nest(name, Cardinality::One, f)
    }

    /// Declares a nested 1:n relationship under this one.
    #[must_use]
    pub fn and_that_has_many(
        self,
        name: &str,
        f: impl FnOnce(Declare<NeedsKeys>) -> Declare<Ready>,
    ) -> Self {
        self.nest(name, Cardinality::Many, f)
    }

    pub(crate) fn into_node(self, parent_namespace: &str) -> Result<RelationNode> {
        draft_into_node(self.draft, parent_namespace)
    }
}

fn draft_into_node(draft: Draft, parent_namespace: &str) -> Result<RelationNode> {
    let alias = namespaced_alias(parent_namespace, &draft.name);
    let table = draft.table.unwrap_or_else(|| draft.name.clone());
    let local_key = draft
        .local_key
        .ok_or_else(|| OrmError::Internal(format!("relationship `{}` lost its keys", draft.name)))?;
    let foreign_key = draft
        .foreign_key
        .ok_or_else(|| OrmError::Internal(format!("relationship `{}` lost its keys", draft.name)))?;

    let mut children = Vec::with_capacity(draft.children.len());
    for child in draft.children {
        if children
            .iter()
            .any(|c: &RelationNode| c.name == child.name)
        {
            return Err(OrmError::DuplicateRelationship(child.name));
        }
        children.push(draft_into_node(child, &alias)?);
    }

    Ok(RelationNode {
        name: draft.name,
        cardinality: draft.cardinality,
        table,
        local_key,
        foreign_key,
        alias,
        included: false,
        children,
    })
}

/// Finds a node by relationship name among siblings.
#[must_use]
pub fn find<'a>(nodes: &'a [RelationNode], name: &str) -> Option<&'a RelationNode> {
    nodes.iter().find(|n| n.name == name)
}

pub(crate) fn find_mut<'a>(
    nodes: &'a mut [RelationNode],
    name: &str,
) -> Option<&'a mut RelationNode> {
    nodes.iter_mut().find(|n| n.name == name)
}

/// Walks a name path down the tree.
pub(crate) fn find_path_mut<'a>(
    mut nodes: &'a mut [RelationNode],
    path: &[String],
) -> Option<&'a mut RelationNode> {
    let (last, ancestors) = path.split_last()?;
    for name in ancestors {
        let node = find_mut(nodes, name)?;
        nodes = &mut node.children;
    }
    find_mut(nodes, last)
}

/// Collects every target table declared in the tree (included or not).
pub(crate) fn declared_tables(nodes: &[RelationNode], out: &mut Vec<String>) {
    for node in nodes {
        out.push(node.table.clone());
        declared_tables(&node.children, out);
    }
}

/// Returns whether any included node in the tree is 1:n.
#[must_use]
pub fn any_included_many(nodes: &[RelationNode]) -> bool {
    nodes.iter().any(|n| {
        n.included
            && (n.cardinality == Cardinality::Many || any_included_many(&n.children))
    })
}
