//! Plan graph construction, cycle detection, and frontier computation.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Both step
//! requirements and artifact requirements become edges: an artifact
//! requirement resolves to the step whose `creates` list declares that
//! artifact. Topological sort detects cycles, and the full cycle path is
//! recovered with a coloring DFS so the error names every step on the loop.

use std::collections::HashMap;

use gantry_types::error::PlanError;
use gantry_types::plan::{ExecutionPlan, Requirement, Step};
use gantry_types::state::{StepStatus, WorkflowState};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

// ---------------------------------------------------------------------------
// PlanGraph
// ---------------------------------------------------------------------------

/// Validated dependency graph over the steps of one [`ExecutionPlan`].
///
/// Construction performs all structural validation: duplicate ids, unknown
/// step requirements, artifact requirements with no producer, and cycles.
/// After `build` succeeds the graph is immutable and every query is
/// infallible.
#[derive(Debug)]
pub struct PlanGraph {
    steps: Vec<Step>,
    index_of: HashMap<String, usize>,
    /// `preds[i]` holds the indices of steps that must finish before step `i`.
    preds: Vec<Vec<usize>>,
    /// `succs[i]` holds the indices of steps that directly depend on step `i`.
    succs: Vec<Vec<usize>>,
}

impl PlanGraph {
    /// Validate the plan and build its dependency graph.
    pub fn build(plan: &ExecutionPlan) -> Result<Self, PlanError> {
        if plan.steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        let mut index_of: HashMap<String, usize> = HashMap::new();
        for (i, step) in plan.steps.iter().enumerate() {
            if index_of.insert(step.id.clone(), i).is_some() {
                return Err(PlanError::DuplicateStepId(step.id.clone()));
            }
        }

        // Map each declared artifact to the single step that produces it.
        let mut producer_of: HashMap<&str, usize> = HashMap::new();
        for (i, step) in plan.steps.iter().enumerate() {
            for artifact in &step.creates {
                producer_of.insert(artifact.as_str(), i);
            }
        }

        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); plan.steps.len()];
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); plan.steps.len()];

        for (to, step) in plan.steps.iter().enumerate() {
            for requirement in &step.requires {
                let from = match requirement {
                    Requirement::Step { id } => {
                        *index_of
                            .get(id)
                            .ok_or_else(|| PlanError::UnknownDependency {
                                step_id: step.id.clone(),
                                dependency: id.clone(),
                            })?
                    }
                    Requirement::Artifact { name } => *producer_of
                        .get(name.as_str())
                        .ok_or_else(|| PlanError::UnresolvedArtifact {
                            step_id: step.id.clone(),
                            artifact: name.clone(),
                        })?,
                };
                if !preds[to].contains(&from) {
                    preds[to].push(from);
                    succs[from].push(to);
                }
            }
            // A remediation step runs on demand inside the loopback cycle,
            // but it must at least exist in the plan.
            if let Some(target) = &step.gate_spec.remediation_step {
                if !index_of.contains_key(target) {
                    return Err(PlanError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: target.clone(),
                    });
                }
            }
        }

        // Topological sort over a petgraph view detects cycles; the DFS below
        // recovers the full path for the error message.
        let mut graph = DiGraph::<usize, ()>::new();
        let node_indices: Vec<_> = (0..plan.steps.len()).map(|i| graph.add_node(i)).collect();
        for (to, deps) in preds.iter().enumerate() {
            for &from in deps {
                graph.add_edge(node_indices[from], node_indices[to], ());
            }
        }
        if toposort(&graph, None).is_err() {
            let path = cycle_path(&plan.steps, &succs);
            return Err(PlanError::CycleDetected { path });
        }

        Ok(Self {
            steps: plan.steps.clone(),
            index_of,
            preds,
            succs,
        })
    }

    /// Number of steps in the plan.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.index_of.get(step_id).map(|&i| &self.steps[i])
    }

    /// Step ids whose requirements are all satisfied and that have not yet
    /// run, given the current workflow state.
    ///
    /// A step requirement is satisfied when the dependency reached a status
    /// that satisfies dependents ([`StepStatus::satisfies_dependents`]) and
    /// was not skipped because of an upstream failure. An artifact
    /// requirement is additionally satisfied only when the named artifact is
    /// present in the state's artifact map.
    pub fn frontier<'a>(&'a self, state: &WorkflowState) -> Vec<&'a str> {
        let mut ready = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            let Some(step_state) = state.step(&step.id) else {
                continue;
            };
            if !matches!(step_state.status, StepStatus::Pending | StepStatus::Ready) {
                continue;
            }
            let deps_ok = self.preds[i].iter().all(|&p| {
                state
                    .step(&self.steps[p].id)
                    .is_some_and(|s| s.status.satisfies_dependents() && !s.skipped_for_upstream_failure())
            });
            let artifacts_ok = step.requires.iter().all(|r| match r {
                Requirement::Artifact { name } => state.artifacts.contains_key(name),
                Requirement::Step { .. } => true,
            });
            if deps_ok && artifacts_ok {
                ready.push(step.id.as_str());
            }
        }
        ready
    }

    /// All transitive dependents of a step, in breadth-first order.
    pub fn dependents_of<'a>(&'a self, step_id: &str) -> Vec<&'a str> {
        let Some(&start) = self.index_of.get(step_id) else {
            return Vec::new();
        };
        let mut visited = vec![false; self.steps.len()];
        let mut queue = std::collections::VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for &next in &self.succs[current] {
                if !visited[next] {
                    visited[next] = true;
                    out.push(self.steps[next].id.as_str());
                    queue.push_back(next);
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Cycle path recovery
// ---------------------------------------------------------------------------

/// Walk the adjacency with a white/gray/black DFS and return the ids along
/// the first back edge found, closed with a repeat of the entry step.
fn cycle_path(steps: &[Step], succs: &[Vec<usize>]) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        node: usize,
        succs: &[Vec<usize>],
        colors: &mut [Color],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        colors[node] = Color::Gray;
        stack.push(node);
        for &next in &succs[node] {
            match colors[next] {
                Color::Gray => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut path: Vec<usize> = stack[start..].to_vec();
                    path.push(next);
                    return Some(path);
                }
                Color::White => {
                    if let Some(path) = visit(next, succs, colors, stack) {
                        return Some(path);
                    }
                }
                Color::Black => {}
            }
        }
        stack.pop();
        colors[node] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; steps.len()];
    for start in 0..steps.len() {
        if colors[start] == Color::White {
            let mut stack = Vec::new();
            if let Some(path) = visit(start, succs, &mut colors, &mut stack) {
                return path.into_iter().map(|i| steps[i].id.clone()).collect();
            }
        }
    }
    Vec::new()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
