//! Segment lineage: upstream graph of a segment, downstream dependents, and
//! dependency-first execution order over the catalog.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use audience_core::{AudienceError, AudienceResult, RuleId, SetOperation};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::catalog::{CatalogEntry, CatalogStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Base,
    Composite,
    /// Referenced as a dependency but absent from the catalog.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineageNode {
    pub rule_id: RuleId,
    pub name: Option<String>,
    pub segment_name: Option<String>,
    pub table_name: Option<String>,
    pub kind: NodeKind,
    pub operation: Option<SetOperation>,
    pub row_count: u64,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

/// `parent` feeds `child`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LineageEdge {
    pub parent: RuleId,
    pub child: RuleId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineageGraph {
    pub root: RuleId,
    pub nodes: Vec<LineageNode>,
    pub edges: Vec<LineageEdge>,
}

impl LineageGraph {
    pub fn node(&self, id: RuleId) -> Option<&LineageNode> {
        self.nodes.iter().find(|n| n.rule_id == id)
    }

    pub fn parents_of(&self, id: RuleId) -> Vec<RuleId> {
        self.edges
            .iter()
            .filter(|e| e.child == id)
            .map(|e| e.parent)
            .collect()
    }
}

/// Dependency-first order of a set of rules. Rules caught in a cycle cannot
/// be ordered and are reported separately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOrder {
    pub ordered: Vec<RuleId>,
    pub cyclic: Vec<RuleId>,
}

/// Upstream lineage of `root`, read from one consistent snapshot of the store.
pub fn lineage(store: &dyn CatalogStore, root: RuleId) -> AudienceResult<LineageGraph> {
    lineage_in(&store.list(), root)
}

pub fn lineage_in(entries: &[CatalogEntry], root: RuleId) -> AudienceResult<LineageGraph> {
    let by_id: HashMap<RuleId, &CatalogEntry> = entries.iter().map(|e| (e.id(), e)).collect();
    if !by_id.contains_key(&root) {
        return Err(AudienceError::RuleNotFound(root));
    }

    let mut visited: HashSet<RuleId> = HashSet::new();
    let mut nodes: BTreeMap<RuleId, LineageNode> = BTreeMap::new();
    let mut edges: BTreeSet<LineageEdge> = BTreeSet::new();
    let mut stack = vec![root];

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(entry) = by_id.get(&id) else {
            warn!(rule_id = %id, "Lineage references a rule missing from the catalog");
            nodes.insert(id, missing_node(id));
            continue;
        };
        nodes.insert(id, node_for(entry));
        for parent in entry.segment.depends_on().unwrap_or_default() {
            edges.insert(LineageEdge {
                parent: *parent,
                child: id,
            });
            if !visited.contains(parent) {
                stack.push(*parent);
            }
        }
    }

    Ok(LineageGraph {
        root,
        nodes: nodes.into_values().collect(),
        edges: edges.into_iter().collect(),
    })
}

/// Every rule that directly or transitively depends on `id`.
pub fn dependents(store: &dyn CatalogStore, id: RuleId) -> BTreeSet<RuleId> {
    dependents_in(&store.list(), id)
}

pub fn dependents_in(entries: &[CatalogEntry], id: RuleId) -> BTreeSet<RuleId> {
    let mut children: HashMap<RuleId, Vec<RuleId>> = HashMap::new();
    for entry in entries {
        for parent in entry.segment.depends_on().unwrap_or_default() {
            children.entry(*parent).or_default().push(entry.id());
        }
    }

    let mut found = BTreeSet::new();
    let mut stack = vec![id];
    while let Some(current) = stack.pop() {
        for child in children.get(&current).into_iter().flatten() {
            if *child != id && found.insert(*child) {
                stack.push(*child);
            }
        }
    }
    found
}

/// Kahn's algorithm over `entries`. Dependencies outside the given set are
/// treated as already satisfied.
pub fn execution_order(entries: &[CatalogEntry]) -> ExecutionOrder {
    let ids: BTreeSet<RuleId> = entries.iter().map(|e| e.id()).collect();
    let mut in_degree: BTreeMap<RuleId, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut children: HashMap<RuleId, Vec<RuleId>> = HashMap::new();

    for entry in entries {
        let parents: BTreeSet<RuleId> = entry
            .segment
            .depends_on()
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(|p| ids.contains(p))
            .collect();
        for parent in parents {
            children.entry(parent).or_default().push(entry.id());
            *in_degree.entry(entry.id()).or_default() += 1;
        }
    }

    let mut ready: BTreeSet<RuleId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut ordered = Vec::with_capacity(ids.len());

    while let Some(id) = ready.pop_first() {
        ordered.push(id);
        for child in children.get(&id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*child);
                }
            }
        }
    }

    let placed: HashSet<RuleId> = ordered.iter().copied().collect();
    let cyclic: Vec<RuleId> = ids.into_iter().filter(|id| !placed.contains(id)).collect();
    if !cyclic.is_empty() {
        warn!(rules = ?cyclic, "Dependency cycle detected; rules left unordered");
    }
    ExecutionOrder { ordered, cyclic }
}

fn node_for(entry: &CatalogEntry) -> LineageNode {
    let segment = &entry.segment;
    LineageNode {
        rule_id: entry.id(),
        name: Some(entry.rule.name.clone()),
        segment_name: Some(segment.segment_name.clone()),
        table_name: Some(segment.table_name.clone()),
        kind: if segment.depends_on().is_some() {
            NodeKind::Composite
        } else {
            NodeKind::Base
        },
        operation: segment.operation(),
        row_count: segment.row_count,
        last_refreshed_at: segment.last_refreshed_at,
    }
}

fn missing_node(id: RuleId) -> LineageNode {
    LineageNode {
        rule_id: id,
        name: None,
        segment_name: None,
        table_name: None,
        kind: NodeKind::Missing,
        operation: None,
        row_count: 0,
        last_refreshed_at: None,
    }
}
