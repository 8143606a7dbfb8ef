//! Transition events: the append-only persisted log and the telemetry feed.
//!
//! Every state transition produces one [`TransitionEvent`] appended to the
//! run's event log before the snapshot is replaced. The same kinds double
//! as the telemetry feed published to external observers; the engine has no
//! opinion on how they are displayed or stored downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{GateDecision, GateReason};
use crate::state::{StepStatus, WorkflowStatus};

// ---------------------------------------------------------------------------
// Transition kinds
// ---------------------------------------------------------------------------

/// What happened, one record per transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionKind {
    WorkflowStarted {
        plan_id: Uuid,
        step_count: usize,
    },
    WorkflowResumed {
        from_status: WorkflowStatus,
        unfinished_steps: usize,
    },
    StepStarted {
        step_id: String,
        attempt: u32,
    },
    StepCompleted {
        step_id: String,
        attempt: u32,
        duration_ms: u64,
    },
    StepFailed {
        step_id: String,
        attempt: u32,
        error: String,
        #[serde(default)]
        reasons: Vec<GateReason>,
    },
    StepBlocked {
        step_id: String,
        loopback_attempts: u32,
    },
    StepSkipped {
        step_id: String,
        reason: String,
    },
    LoopbackAttempted {
        step_id: String,
        attempt: u32,
        decision: GateDecision,
    },
    WorkflowFinished {
        status: WorkflowStatus,
    },
}

impl TransitionKind {
    /// The step this transition concerns, when it concerns one.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step_id, .. }
            | Self::StepCompleted { step_id, .. }
            | Self::StepFailed { step_id, .. }
            | Self::StepBlocked { step_id, .. }
            | Self::StepSkipped { step_id, .. }
            | Self::LoopbackAttempted { step_id, .. } => Some(step_id),
            Self::WorkflowStarted { .. }
            | Self::WorkflowResumed { .. }
            | Self::WorkflowFinished { .. } => None,
        }
    }

    /// The step status this transition records, when it records one.
    pub fn step_status(&self) -> Option<StepStatus> {
        match self {
            Self::StepStarted { .. } => Some(StepStatus::Running),
            Self::StepCompleted { .. } => Some(StepStatus::Completed),
            Self::StepFailed { .. } => Some(StepStatus::Failed),
            Self::StepBlocked { .. } => Some(StepStatus::Blocked),
            Self::StepSkipped { .. } => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Event record
// ---------------------------------------------------------------------------

/// One appended record in a run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    /// UUIDv7 event ID (time-sortable).
    pub event_id: Uuid,
    /// The run this event belongs to.
    pub workflow_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TransitionKind,
}

impl TransitionEvent {
    /// Stamp a new event for `workflow_id` at the current time.
    pub fn now(workflow_id: Uuid, kind: TransitionKind) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            workflow_id,
            at: Utc::now(),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
