//! Detects tests that could run at the same time while writing the same output file.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use thiserror::Error;

use crate::core::graph::DependencyGraph;

/// Two tests that may overlap in time and declare the same output file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tests '{first}' and '{second}' both write '{}'", file.display())]
pub struct RaceConflict {
    pub first: String,
    pub second: String,
    pub file: PathBuf,
}

/// Checks declared output files for collisions between concurrently runnable tests.
///
/// Without a graph every pair of candidates counts as concurrent. With one,
/// pairs the graph orders (one is upstream of the other) are left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct RaceConditionChecker<'g> {
    graph: Option<&'g DependencyGraph>,
}

impl<'g> RaceConditionChecker<'g> {
    pub fn new() -> Self {
        Self { graph: None }
    }

    pub fn with_graph(graph: &'g DependencyGraph) -> Self {
        Self { graph: Some(graph) }
    }

    /// Returns the first conflict among `candidates`, if any.
    pub fn check(
        &self,
        candidates: &[&str],
        outputs: &BTreeMap<String, BTreeSet<PathBuf>>,
        finished: &HashSet<String>,
    ) -> Result<(), RaceConflict> {
        match self.conflicts(candidates, outputs, finished).into_iter().next() {
            Some(conflict) => Err(conflict),
            None => Ok(()),
        }
    }

    /// Every conflicting pair among `candidates`, ordered by file then by candidate order.
    /// Tests in `finished` already reached a terminal state and never run.
    pub fn conflicts(
        &self,
        candidates: &[&str],
        outputs: &BTreeMap<String, BTreeSet<PathBuf>>,
        finished: &HashSet<String>,
    ) -> Vec<RaceConflict> {
        let mut writers: BTreeMap<&PathBuf, Vec<&str>> = BTreeMap::new();
        for &name in candidates {
            if finished.contains(name) {
                continue;
            }
            for file in outputs.get(name).into_iter().flatten() {
                let entry = writers.entry(file).or_default();
                if !entry.contains(&name) {
                    entry.push(name);
                }
            }
        }

        let mut found = Vec::new();
        for (file, names) in writers {
            for (i, &first) in names.iter().enumerate() {
                for &second in &names[i + 1..] {
                    if self.graph.is_some_and(|g| g.is_ordered(first, second)) {
                        continue;
                    }
                    found.push(RaceConflict {
                        first: first.to_string(),
                        second: second.to_string(),
                        file: file.clone(),
                    });
                }
            }
        }
        found
    }
}
