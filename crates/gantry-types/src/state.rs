//! Per-run workflow state: the document the engine persists and resumes from.
//!
//! [`WorkflowState`] is the materialized snapshot written after every
//! transition. It is the only artifact the engine itself writes to storage
//! and the only one it reads on resume. Created at run start, mutated only
//! by the scheduler loop, retained after terminal status for audit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::{LoopbackAttempt, ResultEnvelope};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Blocked,
    Aborted,
    Paused,
}

impl WorkflowStatus {
    /// Whether this status is terminal (Paused is resumable, not terminal).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Blocked | Self::Aborted)
    }
}

/// Status of an individual step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Blocked,
    Skipped,
}

impl StepStatus {
    /// Whether this status is terminal for the step.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Blocked | Self::Skipped
        )
    }

    /// Whether this status satisfies a dependent step's ordering edge.
    ///
    /// Only genuine success counts; a step skipped because its own upstream
    /// failed never unblocks dependents (they are skipped transitively by
    /// the scheduler instead).
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

// ---------------------------------------------------------------------------
// Step execution records
// ---------------------------------------------------------------------------

/// One invocation of a step's worker (initial run or loopback re-run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// 1-based attempt number across plain retries and loopbacks.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Terminal step status this attempt produced.
    pub status: StepStatus,
    /// Error message for invocation failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The structured result, when the worker returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<ResultEnvelope>,
}

/// Reason recorded when a step is skipped by the scheduler.
pub const SKIP_REASON_UPSTREAM_FAILURE: &str = "upstream-failure";

/// Execution state of a single step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    /// Every invocation of the step, in order.
    #[serde(default)]
    pub attempts: Vec<StepExecution>,
    /// Ordered, append-only audit of remediation attempts.
    #[serde(default)]
    pub loopback_history: Vec<LoopbackAttempt>,
    /// Why the step was skipped, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StepState {
    /// A fresh, never-dispatched step.
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: vec![],
            loopback_history: vec![],
            skip_reason: None,
        }
    }

    /// Whether this step was skipped because an upstream step failed.
    pub fn skipped_for_upstream_failure(&self) -> bool {
        self.status == StepStatus::Skipped
            && self.skip_reason.as_deref() == Some(SKIP_REASON_UPSTREAM_FAILURE)
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// An artifact recorded in the workflow state once its producing step passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub location: String,
    /// Step that produced the artifact.
    pub produced_by: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflow state
// ---------------------------------------------------------------------------

/// Durable per-run state, snapshotted after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// UUIDv7 run ID.
    pub workflow_id: Uuid,
    /// The plan this run executes.
    pub plan_id: Uuid,
    /// Plan name (denormalized for reporting).
    pub plan_name: String,
    pub status: WorkflowStatus,
    /// Step states keyed by step ID. BTreeMap for stable serialization.
    pub step_states: BTreeMap<String, StepState>,
    /// Artifacts recorded so far, keyed by artifact name.
    pub artifacts: BTreeMap<String, ArtifactRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Create the initial state for a new run: every step Pending.
    pub fn new(
        workflow_id: Uuid,
        plan_id: Uuid,
        plan_name: String,
        step_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            workflow_id,
            plan_id,
            plan_name,
            status: WorkflowStatus::Running,
            step_states: step_ids
                .into_iter()
                .map(|id| (id, StepState::pending()))
                .collect(),
            artifacts: BTreeMap::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// The step state for `step_id`, if the plan contains it.
    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.step_states.get(step_id)
    }

    /// Whether every step reached Completed or Skipped.
    pub fn all_steps_succeeded(&self) -> bool {
        self.step_states
            .values()
            .all(|s| s.status.satisfies_dependents())
    }

    /// Step IDs that are not Completed, for the final report.
    pub fn unfinished_step_ids(&self) -> Vec<&str> {
        self.step_states
            .iter()
            .filter(|(_, s)| s.status != StepStatus::Completed)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
