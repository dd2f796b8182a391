//! Flat-row-to-nested-object reconstruction.
//!
//! A joined SELECT returns one flat row per combination of parent and child
//! rows, with every joined column namespaced by its relationship alias. This
//! module folds those rows back into the object graph the relationship tree
//! declares: 1:1 nodes nest as a single object (or `null` when the LEFT JOIN
//! found no match), 1:n nodes nest as an array deduplicated by the child's
//! own primary key, recursively at any depth.

use std::collections::HashSet;

use serde_json::Value;

use crate::executor::Record;
use crate::relation::Cardinality;

/// How a nested node's rows tie back to their parent in the flat row.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    /// Alias of the parent-side key column in the flat row.
    pub parent_key: String,
    /// Alias of the child-side key column in the flat row.
    pub child_key: String,
}

/// The reconstruction plan for one level of nesting, derived from the
/// included relationship subtree and the resolved schemas.
#[derive(Debug, Clone)]
pub(crate) struct NestPlan {
    /// Relationship name; the reconstructed object's key. Unused at the root.
    pub name: String,
    /// Alias prefix of this level's columns (empty at the root).
    pub prefix: String,
    /// Alias of this level's primary-key column, when the table has one.
    pub pk_alias: Option<String>,
    /// Parent linkage; `None` at the root.
    pub link: Option<Link>,
    /// 1:1 or 1:n; the root behaves as 1:1.
    pub cardinality: Cardinality,
    /// Plans for nested relationships.
    pub children: Vec<NestPlan>,
}

/// Folds a flat joined result set into nested records.
pub(crate) fn reconstruct(rows: &[Record], plan: &NestPlan) -> Vec<Record> {
    let refs: Vec<&Record> = rows.iter().collect();
    dedupe(&refs, plan.pk_alias.as_deref())
        .into_iter()
        .map(|row| build_object(row, &refs, plan))
        .collect()
}

/// Retains the first row per primary-key value, preserving order. Rows with
/// a NULL key are joined padding and dropped; with no key column at all,
/// every row is distinct.
fn dedupe<'a>(rows: &[&'a Record], pk_alias: Option<&str>) -> Vec<&'a Record> {
    let Some(pk) = pk_alias else {
        return rows.to_vec();
    };
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        match row.get(pk) {
            None => out.push(*row),
            Some(Value::Null) => {}
            Some(value) => {
                if seen.insert(value.to_string()) {
                    out.push(*row);
                }
            }
        }
    }
    out
}

fn build_object(row: &Record, rows: &[&Record], plan: &NestPlan) -> Record {
    let mut obj = Record::new();

    // Columns of this level: keys under our prefix that don't belong to a
    // nested relationship's deeper prefix.
    for (key, value) in row {
        if !key.starts_with(&plan.prefix) {
            continue;
        }
        if plan.children.iter().any(|c| key.starts_with(&c.prefix)) {
            continue;
        }
        obj.insert(key[plan.prefix.len()..].to_string(), value.clone());
    }

    for child in &plan.children {
        obj.insert(child.name.clone(), build_child(row, rows, child));
    }
    obj
}

fn build_child(parent_row: &Record, rows: &[&Record], child: &NestPlan) -> Value {
    match child.cardinality {
        Cardinality::One => {
            // All-NULL joined columns mean the LEFT JOIN found no match.
            let all_null = parent_row
                .iter()
                .filter(|(k, _)| k.starts_with(&child.prefix))
                .all(|(_, v)| v.is_null());
            if all_null {
                return Value::Null;
            }
            // Grandchildren under a 1:1 node regroup among the rows sharing
            // this child row's own key.
            let subset: Vec<&Record> = match &child.pk_alias {
                Some(pk) => {
                    let value = parent_row.get(pk);
                    rows.iter()
                        .copied()
                        .filter(|r| r.get(pk) == value)
                        .collect()
                }
                None => vec![parent_row],
            };
            Value::Object(build_object(parent_row, &subset, child))
        }
        Cardinality::Many => {
            let Some(link) = &child.link else {
                return Value::Array(Vec::new());
            };
            let parent_value = parent_row.get(&link.parent_key);
            if parent_value.is_none() || parent_value.is_some_and(Value::is_null) {
                return Value::Array(Vec::new());
            }
            // Regroup against the original (pre-dedup) rows of this branch.
            let subset: Vec<&Record> = rows
                .iter()
                .copied()
                .filter(|r| r.get(&link.child_key) == parent_value)
                .collect();
            let items = dedupe(&subset, child.pk_alias.as_deref())
                .into_iter()
                .map(|row| Value::Object(build_object(row, &subset, child)))
                .collect();
            Value::Array(items)
        }
    }
}
