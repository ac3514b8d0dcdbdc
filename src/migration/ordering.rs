//! Dependency ordering for importers.
//!
//! Builds a directed graph where an edge `a -> b` means "a runs before b".
//! Required edges must form a DAG; a cycle among them is a configuration
//! error. Optional edges are ordering hints that are dropped when they would
//! close a cycle.
//!
//! ## Tie-break
//!
//! Among importers that are ready at the same time, the one declared first
//! wins, so identical importer sets always produce identical orders.
//!
//! ```text
//! declared:  A (requires B), B (requires C), C
//! resolved:  C, B, A
//! ```

use super::dependency::{DependencyKind, ImporterDependency};
use super::entity::EntityId;
use crate::error::ConfigError;
use std::collections::{BTreeSet, HashMap};

pub struct DependencyGraph {
    nodes: Vec<EntityId>,
    index: HashMap<EntityId, usize>,
    successors: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Build the graph from importers in declaration order.
    ///
    /// Dependencies naming an entity outside `nodes` are ignored here; the
    /// orchestrator decides whether those are satisfied.
    pub fn build(nodes: &[(EntityId, Vec<ImporterDependency>)]) -> Result<Self, ConfigError> {
        let mut index = HashMap::new();
        for (position, (entity, _)) in nodes.iter().enumerate() {
            if index.insert(*entity, position).is_some() {
                return Err(ConfigError::DuplicateImporter(entity.to_string()));
            }
        }

        let mut graph = Self {
            nodes: nodes.iter().map(|(entity, _)| *entity).collect(),
            index,
            successors: vec![BTreeSet::new(); nodes.len()],
        };

        // Required edges first; they are never dropped.
        for (entity, deps) in nodes {
            for dep in deps.iter().filter(|d| d.kind.is_required()) {
                if let Some((from, to)) = graph.edge_for(*entity, dep) {
                    graph.successors[from].insert(to);
                }
            }
        }

        if let Some(path) = graph.find_cycle() {
            return Err(ConfigError::DependencyCycle {
                path: path.iter().map(|e| e.to_string()).collect(),
            });
        }

        for (entity, deps) in nodes {
            for dep in deps.iter().filter(|d| !d.kind.is_required()) {
                let Some((from, to)) = graph.edge_for(*entity, dep) else {
                    continue;
                };
                if from == to || graph.reaches(to, from) {
                    log::debug!(
                        "ignoring optional ordering hint {} -> {}: would create a cycle",
                        graph.nodes[from],
                        graph.nodes[to]
                    );
                    continue;
                }
                graph.successors[from].insert(to);
            }
        }

        Ok(graph)
    }

    fn edge_for(&self, entity: EntityId, dep: &ImporterDependency) -> Option<(usize, usize)> {
        let own = *self.index.get(&entity)?;
        let other = *self.index.get(&dep.entity)?;
        match dep.kind {
            DependencyKind::RequiredPre | DependencyKind::OptionalPre => Some((other, own)),
            DependencyKind::RequiredPost | DependencyKind::OptionalPost => Some((own, other)),
        }
    }

    /// Whether `to` is reachable from `from` following edges.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![from];

        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if std::mem::replace(&mut visited[current], true) {
                continue;
            }
            stack.extend(self.successors[current].iter().copied());
        }

        false
    }

    /// Find one cycle, returned as a closed path (`a -> b -> a`).
    fn find_cycle(&self) -> Option<Vec<EntityId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }

            // (node, remaining successors) frames for an iterative DFS
            let mut path: Vec<usize> = vec![start];
            let mut frames: Vec<Vec<usize>> =
                vec![self.successors[start].iter().rev().copied().collect()];
            marks[start] = Mark::OnStack;

            while let Some(frame) = frames.last_mut() {
                match frame.pop() {
                    Some(next) => match marks[next] {
                        Mark::OnStack => {
                            let begin = path.iter().position(|&n| n == next).unwrap_or(0);
                            let mut cycle: Vec<EntityId> =
                                path[begin..].iter().map(|&n| self.nodes[n]).collect();
                            cycle.push(self.nodes[next]);
                            return Some(cycle);
                        }
                        Mark::Unvisited => {
                            marks[next] = Mark::OnStack;
                            path.push(next);
                            frames.push(self.successors[next].iter().rev().copied().collect());
                        }
                        Mark::Done => {}
                    },
                    None => {
                        frames.pop();
                        if let Some(done) = path.pop() {
                            marks[done] = Mark::Done;
                        }
                    }
                }
            }
        }

        None
    }

    /// Topological order with declaration-order tie-break.
    pub fn order(&self) -> Vec<EntityId> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for successors in &self.successors {
            for &next in successors {
                in_degree[next] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|&n| in_degree[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(current) = ready.pop_first() {
            order.push(self.nodes[current]);
            for &next in &self.successors[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        order
    }
}

/// Resolve the run order for importers given in declaration order.
pub fn resolve_order(
    nodes: &[(EntityId, Vec<ImporterDependency>)],
) -> Result<Vec<EntityId>, ConfigError> {
    Ok(DependencyGraph::build(nodes)?.order())
}
