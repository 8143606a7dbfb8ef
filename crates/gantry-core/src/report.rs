//! Final run report assembled from the terminal workflow state.

use std::collections::BTreeMap;

use gantry_types::envelope::{Issue, LoopbackAttempt};
use gantry_types::state::{ArtifactRecord, StepStatus, WorkflowState, WorkflowStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Summary returned to the caller when a run reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    /// Everything the run produced, keyed by artifact name.
    pub artifacts: BTreeMap<String, ArtifactRecord>,
    /// Steps that reached Completed, in plan-state order.
    pub completed_steps: Vec<String>,
    /// Every step that did not complete, with the evidence of why.
    pub unfinished: Vec<StepReport>,
}

/// Per-step detail for a step that did not complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Last recorded invocation error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Issues reported across all attempts of this step.
    #[serde(default)]
    pub issues: Vec<Issue>,
    /// Full loopback audit trail.
    #[serde(default)]
    pub loopback_history: Vec<LoopbackAttempt>,
}

impl RunReport {
    /// Assemble the report from a (typically terminal) workflow state.
    pub fn from_state(state: &WorkflowState) -> Self {
        let mut completed_steps = Vec::new();
        let mut unfinished = Vec::new();
        for (step_id, step_state) in &state.step_states {
            if step_state.status == StepStatus::Completed {
                completed_steps.push(step_id.clone());
                continue;
            }
            let issues = step_state
                .attempts
                .iter()
                .filter_map(|a| a.envelope.as_ref())
                .flat_map(|e| e.issues.iter().cloned())
                .collect();
            let error = step_state
                .attempts
                .iter()
                .rev()
                .find_map(|a| a.error.clone());
            unfinished.push(StepReport {
                step_id: step_id.clone(),
                status: step_state.status,
                skip_reason: step_state.skip_reason.clone(),
                error,
                issues,
                loopback_history: step_state.loopback_history.clone(),
            });
        }
        Self {
            workflow_id: state.workflow_id,
            status: state.status,
            artifacts: state.artifacts.clone(),
            completed_steps,
            unfinished,
        }
    }
}
