//! # Dependency Graph Module / 依赖图模块
//!
//! Builds a directed graph from each test's prerequisite list and partitions it
//! into generations: every prerequisite of a test sits in a strictly earlier
//! generation. Cycles and missing prerequisites are reported per test instead of
//! aborting the whole run, and anything downstream of a broken test is blocked.
//!
//! 根据每个测试的前置条件列表构建有向图，并将其划分为若干代：
//! 每个测试的所有前置测试都位于更早的代中。
//! 环和缺失的前置测试按测试逐个报告，而不会中止整个运行。

use petgraph::Direction;
use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;

use crate::core::spec::TestSpec;

/// Why a test cannot be placed in any generation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("cyclic dependency: {}", members.join(" -> "))]
    Cycle { members: Vec<String> },
    #[error("missing prerequisite '{prerequisite}'")]
    MissingPrerequisite { prerequisite: String },
    #[error("prerequisite '{prerequisite}' cannot run")]
    BlockedBy { prerequisite: String },
}

/// Structural errors that make the suite itself unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate test name '{0}'")]
    DuplicateName(String),
}

/// Tests whose prerequisites all live in earlier generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub index: usize,
    /// Test names in discovery order.
    pub members: Vec<String>,
}

/// The result of partitioning the graph.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub generations: Vec<Generation>,
    /// Tests that cannot run, in discovery order.
    pub rejected: Vec<(String, DependencyError)>,
}

impl Resolution {
    /// The generation a test landed in, or why it has none.
    pub fn outcome(&self, name: &str) -> Option<Result<usize, &DependencyError>> {
        if let Some((_, error)) = self.rejected.iter().find(|(n, _)| n == name) {
            return Some(Err(error));
        }
        self.generations
            .iter()
            .find(|g| g.members.iter().any(|m| m == name))
            .map(|g| Ok(g.index))
    }
}

/// Prerequisite edges between tests, pointing from prerequisite to dependent.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    by_name: HashMap<String, NodeIndex>,
    missing: BTreeMap<NodeIndex, Vec<String>>,
}

impl DependencyGraph {
    /// Builds the graph. Nodes are added in discovery order, which is also the
    /// tie-break order inside a generation.
    pub fn build(specs: &[TestSpec]) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut by_name = HashMap::with_capacity(specs.len());

        for spec in specs {
            if by_name.contains_key(&spec.name) {
                return Err(GraphError::DuplicateName(spec.name.clone()));
            }
            let node = graph.add_node(spec.name.clone());
            by_name.insert(spec.name.clone(), node);
        }

        let mut missing: BTreeMap<NodeIndex, Vec<String>> = BTreeMap::new();
        for spec in specs {
            let dependent = by_name[&spec.name];
            for prereq in &spec.prereqs {
                match by_name.get(prereq) {
                    Some(&prerequisite) => {
                        graph.update_edge(prerequisite, dependent, ());
                    }
                    None => missing.entry(dependent).or_default().push(prereq.clone()),
                }
            }
        }

        Ok(Self {
            graph,
            by_name,
            missing,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Position of a test in discovery order.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).map(|n| n.index())
    }

    /// Known prerequisites of a test, in discovery order.
    pub fn prerequisites(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct dependents of a test, in discovery order.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        let Some(&node) = self.by_name.get(name) else {
            return vec![];
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(node, direction).collect();
        found.sort();
        found.into_iter().map(|n| self.graph[n].as_str()).collect()
    }

    /// Whether the graph forces an order between two tests, in either direction.
    /// Tests that are not ordered may run at the same time.
    pub fn is_ordered(&self, a: &str, b: &str) -> bool {
        match (self.by_name.get(a), self.by_name.get(b)) {
            (Some(&a), Some(&b)) => {
                a == b
                    || has_path_connecting(&self.graph, a, b, None)
                    || has_path_connecting(&self.graph, b, a, None)
            }
            _ => false,
        }
    }

    /// Partitions the tests into generations and collects the ones that cannot run.
    pub fn resolve(&self) -> Resolution {
        let mut broken: BTreeMap<NodeIndex, DependencyError> = BTreeMap::new();

        for (&node, prereqs) in &self.missing {
            if let Some(first) = prereqs.first() {
                broken.insert(
                    node,
                    DependencyError::MissingPrerequisite {
                        prerequisite: first.clone(),
                    },
                );
            }
        }

        for mut component in tarjan_scc(&self.graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&n| self.graph.contains_edge(n, n));
            if !cyclic {
                continue;
            }
            component.sort();
            let members: Vec<String> = component.iter().map(|&n| self.graph[n].clone()).collect();
            for node in component {
                broken.insert(
                    node,
                    DependencyError::Cycle {
                        members: members.clone(),
                    },
                );
            }
        }

        // Everything reachable from a broken test is blocked by it.
        let mut queue: VecDeque<NodeIndex> = broken.keys().copied().collect();
        while let Some(node) = queue.pop_front() {
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect();
            next.sort();
            for dependent in next {
                if broken.contains_key(&dependent) {
                    continue;
                }
                broken.insert(
                    dependent,
                    DependencyError::BlockedBy {
                        prerequisite: self.graph[node].clone(),
                    },
                );
                queue.push_back(dependent);
            }
        }

        // Layered Kahn's algorithm over the healthy nodes: a node joins the
        // generation after its last prerequisite.
        let mut indegree: HashMap<NodeIndex, usize> = HashMap::new();
        for node in self.graph.node_indices() {
            if broken.contains_key(&node) {
                continue;
            }
            let count = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter(|n| !broken.contains_key(n))
                .count();
            indegree.insert(node, count);
        }

        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| indegree.get(n) == Some(&0))
            .collect();
        let mut generations = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            current.sort();
            let mut next = Vec::new();
            for &node in &current {
                for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    if let Some(count) = indegree.get_mut(&dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            placed += current.len();
            generations.push(Generation {
                index: generations.len(),
                members: current.iter().map(|&n| self.graph[n].clone()).collect(),
            });
            current = next;
        }

        if placed != indegree.len() {
            tracing::warn!(
                unplaced = indegree.len() - placed,
                "dependency graph left tests unplaced"
            );
        }

        let rejected = broken
            .into_iter()
            .map(|(node, error)| (self.graph[node].clone(), error))
            .collect();

        Resolution {
            generations,
            rejected,
        }
    }
}
