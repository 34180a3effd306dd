//! Directed acyclic dependency graph over variable ids.
//!
//! An edge `from -> to` records that `from` depends on `to`. The graph keeps
//! both directions so dependents and dependencies are direct lookups.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::VariableId;

/// Kind recorded on an edge when the caller does not name one.
pub const DEFAULT_EDGE_KIND: &str = "depends_on";

/// A directed dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: VariableId,
    pub to: VariableId,
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// from -> (to -> kind)
    forward: BTreeMap<VariableId, BTreeMap<VariableId, String>>,
    /// to -> {from}
    reverse: BTreeMap<VariableId, BTreeSet<VariableId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `from -> to`.
    ///
    /// Rejects self-loops and any edge that would close a cycle, leaving the
    /// graph untouched. Re-adding an existing edge succeeds without change.
    pub fn add_edge(&mut self, from: &VariableId, to: &VariableId, kind: &str) -> Result<()> {
        if self.contains_edge(from, to) {
            return Ok(());
        }
        if from == to || self.reaches(to, from) {
            return Err(Error::CycleDetected {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.forward
            .entry(from.clone())
            .or_default()
            .insert(to.clone(), kind.to_string());
        self.reverse
            .entry(to.clone())
            .or_default()
            .insert(from.clone());
        Ok(())
    }

    /// Remove `from -> to`. Returns whether the edge existed.
    pub fn remove_edge(&mut self, from: &VariableId, to: &VariableId) -> bool {
        let removed = match self.forward.get_mut(from) {
            Some(targets) => targets.remove(to).is_some(),
            None => false,
        };
        if removed {
            if self.forward.get(from).is_some_and(BTreeMap::is_empty) {
                self.forward.remove(from);
            }
            if let Some(sources) = self.reverse.get_mut(to) {
                sources.remove(from);
                if sources.is_empty() {
                    self.reverse.remove(to);
                }
            }
        }
        removed
    }

    /// Drop every edge touching `id`.
    pub fn remove_node(&mut self, id: &VariableId) {
        for to in self.dependencies(id) {
            self.remove_edge(id, &to);
        }
        for from in self.dependents(id) {
            self.remove_edge(&from, id);
        }
    }

    pub fn contains_edge(&self, from: &VariableId, to: &VariableId) -> bool {
        self.forward
            .get(from)
            .is_some_and(|targets| targets.contains_key(to))
    }

    /// Variables that directly depend on `id`.
    pub fn dependents(&self, id: &VariableId) -> Vec<VariableId> {
        self.reverse
            .get(id)
            .map(|sources| sources.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Variables `id` directly depends on.
    pub fn dependencies(&self, id: &VariableId) -> Vec<VariableId> {
        self.forward
            .get(id)
            .map(|targets| targets.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.forward
            .iter()
            .flat_map(|(from, targets)| {
                targets.iter().map(move |(to, kind)| DependencyEdge {
                    from: from.clone(),
                    to: to.clone(),
                    kind: kind.clone(),
                })
            })
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(BTreeMap::len).sum()
    }

    /// Breadth-first search along forward edges.
    fn reaches(&self, start: &VariableId, goal: &VariableId) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            if node == goal {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(targets) = self.forward.get(node) {
                queue.extend(targets.keys());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids<const N: usize>() -> [VariableId; N] {
        std::array::from_fn(|_| VariableId::generate())
    }

    #[test]
    fn reverse_edge_is_a_cycle() {
        let [a, b] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(&b, &a, DEFAULT_EDGE_KIND).unwrap();

        let before = graph.clone();
        let err = graph.add_edge(&a, &b, DEFAULT_EDGE_KIND).unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));
        assert_eq!(graph, before);
    }

    #[test]
    fn transitive_cycle_is_rejected() {
        let [a, b, c] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(&a, &b, DEFAULT_EDGE_KIND).unwrap();
        graph.add_edge(&b, &c, DEFAULT_EDGE_KIND).unwrap();
        assert!(graph.add_edge(&c, &a, DEFAULT_EDGE_KIND).is_err());
        // A diamond is fine.
        graph.add_edge(&a, &c, DEFAULT_EDGE_KIND).unwrap();
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn self_loop_is_rejected() {
        let [a] = ids();
        let mut graph = DependencyGraph::new();
        assert!(graph.add_edge(&a, &a, DEFAULT_EDGE_KIND).is_err());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn duplicate_edge_is_a_no_op() {
        let [a, b] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(&a, &b, "derived").unwrap();
        graph.add_edge(&a, &b, "other").unwrap();
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.edges()[0].kind, "derived");
    }

    #[test]
    fn dependents_are_one_hop() {
        let [a, b, c] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(&b, &a, DEFAULT_EDGE_KIND).unwrap();
        graph.add_edge(&c, &b, DEFAULT_EDGE_KIND).unwrap();

        assert_eq!(graph.dependents(&a), vec![b.clone()]);
        assert_eq!(graph.dependencies(&c), vec![b.clone()]);
        assert!(graph.dependents(&c).is_empty());
    }

    #[test]
    fn remove_node_drops_incident_edges() {
        let [a, b, c] = ids();
        let mut graph = DependencyGraph::new();
        graph.add_edge(&b, &a, DEFAULT_EDGE_KIND).unwrap();
        graph.add_edge(&c, &b, DEFAULT_EDGE_KIND).unwrap();

        graph.remove_node(&b);
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.dependents(&a).is_empty());
        assert!(!graph.remove_edge(&c, &b));
    }
}
