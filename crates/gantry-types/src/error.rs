//! Error types shared across the engine boundary.

use thiserror::Error;
use uuid::Uuid;

/// Errors detected while building the step graph from a plan.
///
/// All of these are fatal before any execution starts; nothing is persisted
/// when a plan fails validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle. `path` lists the step IDs
    /// along the cycle, ending where it started.
    #[error("cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// A step depends on a step ID not present in the plan.
    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    /// A step requires an artifact no step in the plan creates.
    #[error("step '{step_id}' requires artifact '{artifact}' that no step creates")]
    UnresolvedArtifact { step_id: String, artifact: String },

    /// Two steps share the same ID.
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    /// A step names a worker not present in the registry.
    #[error("step '{step_id}' references unknown worker '{worker_ref}'")]
    UnknownWorker { step_id: String, worker_ref: String },

    /// The plan declares no steps.
    #[error("plan contains no steps")]
    EmptyPlan,
}

/// Errors from state-store operations (used by trait definitions in
/// gantry-core and implemented by gantry-infra).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No persisted state exists for the run.
    #[error("workflow run not found: {0}")]
    NotFound(Uuid),

    /// The snapshot (or log) is unreadable. Resume refuses to proceed
    /// rather than reconstructing a guessed state.
    #[error("state corruption for run {workflow_id}: {detail}")]
    Corrupt { workflow_id: Uuid, detail: String },

    /// Another writer holds the run lock.
    #[error("run {0} is already locked by another writer")]
    LockHeld(Uuid),

    #[error("serialization error: {0}")]
    Serialize(String),
}
