//! Graph construction and validation for stage pipelines.
//!
//! The builder takes the stage kinds of a profile plus its dependency edges
//! and produces a [`StageGraph`] that the scheduler consults when expanding
//! scans into tasks.

use crate::errors::PipelineError;
use crate::stage::StageKind;
use std::collections::{HashMap, HashSet};

/// Index into the stage list.
pub type StageIndex = usize;

/// A directed acyclic graph of stage kinds.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// Stages in declaration order
    stages: Vec<StageKind>,
    /// Map from stage kind to index
    index_map: HashMap<StageKind, StageIndex>,
    /// index -> stages that depend on it
    forward_edges: Vec<Vec<StageIndex>>,
    /// index -> stages it depends on
    reverse_edges: Vec<Vec<StageIndex>>,
}

impl StageGraph {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[StageKind] {
        &self.stages
    }

    /// Stages that `kind` directly depends on.
    pub fn dependencies(&self, kind: StageKind) -> Vec<StageKind> {
        self.index_map
            .get(&kind)
            .map(|&i| self.reverse_edges[i].iter().map(|&d| self.stages[d]).collect())
            .unwrap_or_default()
    }

    /// Group stages into waves that could run in parallel once all previous
    /// waves have succeeded.
    pub fn compute_waves(&self) -> Vec<Vec<StageKind>> {
        let mut waves = Vec::new();
        let mut done: HashSet<StageIndex> = HashSet::new();

        loop {
            let ready: Vec<StageIndex> = (0..self.stages.len())
                .filter(|i| !done.contains(i))
                .filter(|&i| self.reverse_edges[i].iter().all(|d| done.contains(d)))
                .collect();

            if ready.is_empty() {
                break;
            }
            done.extend(ready.iter().copied());
            waves.push(ready.into_iter().map(|i| self.stages[i]).collect());
        }

        waves
    }
}

/// Builder for constructing stage graphs.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: Vec<StageKind>,
    edges: Vec<(StageKind, StageKind)>,
}

impl PipelineBuilder {
    pub fn new(stages: Vec<StageKind>) -> Self {
        Self {
            stages,
            edges: Vec::new(),
        }
    }

    /// Declare dependency edges: each `(from, to)` means `from` must
    /// succeed before `to` may run.
    pub fn edges(mut self, edges: impl IntoIterator<Item = (StageKind, StageKind)>) -> Self {
        self.edges.extend(edges);
        self
    }

    /// Build the stage graph.
    ///
    /// Rejects empty profiles, duplicate stages, edges naming stages outside
    /// the profile, self-dependencies and cycles.
    pub fn build(self) -> Result<StageGraph, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut index_map = HashMap::new();
        for (i, &kind) in self.stages.iter().enumerate() {
            if index_map.insert(kind, i).is_some() {
                return Err(PipelineError::DuplicateStage(kind));
            }
        }

        let mut forward_edges: Vec<Vec<StageIndex>> = vec![Vec::new(); self.stages.len()];
        let mut reverse_edges: Vec<Vec<StageIndex>> = vec![Vec::new(); self.stages.len()];

        for (from, to) in self.edges {
            if from == to {
                return Err(PipelineError::SelfDependency(from));
            }
            let (Some(&from_idx), Some(&to_idx)) = (index_map.get(&from), index_map.get(&to))
            else {
                return Err(PipelineError::DanglingEdge { from, to });
            };
            if reverse_edges[to_idx].contains(&from_idx) {
                continue;
            }
            forward_edges[from_idx].push(to_idx);
            reverse_edges[to_idx].push(from_idx);
        }

        let graph = StageGraph {
            stages: self.stages,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Kahn's algorithm; whatever keeps a non-zero in-degree sits on a cycle.
    fn validate_no_cycles(graph: &StageGraph) -> Result<(), PipelineError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<StageIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in &graph.forward_edges[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let involved: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| graph.stages[i].to_string())
                .collect();
            return Err(PipelineError::Cycle(involved));
        }

        Ok(())
    }
}
