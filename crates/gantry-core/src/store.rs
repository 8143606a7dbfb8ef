//! The state store port: append-then-snapshot persistence for runs.
//!
//! Every transition is persisted as an event appended to the run's log,
//! followed by a full snapshot replace. The snapshot is the source of truth
//! on resume; the event log is the audit trail. The filesystem
//! implementation lives in gantry-infra; [`MemoryStateStore`] here backs
//! tests and embedded use.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use gantry_types::error::StoreError;
use gantry_types::event::TransitionEvent;
use gantry_types::state::WorkflowState;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Durable storage for workflow runs.
///
/// Implementations must make `append` atomic per run: after a crash, the
/// snapshot read back by `load` reflects some prefix of the appended events,
/// never a torn write.
pub trait StateStore: Send + Sync {
    /// Append one transition event and replace the run's snapshot.
    fn append(
        &self,
        event: &TransitionEvent,
        snapshot: &WorkflowState,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Load the latest snapshot for a run.
    fn load(
        &self,
        workflow_id: Uuid,
    ) -> impl Future<Output = Result<WorkflowState, StoreError>> + Send;

    /// Read back the full event log for a run, in append order.
    fn events(
        &self,
        workflow_id: Uuid,
    ) -> impl Future<Output = Result<Vec<TransitionEvent>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryRun {
    events: Vec<TransitionEvent>,
    snapshot: Option<WorkflowState>,
}

/// Non-durable store keeping runs in a process-local map.
#[derive(Default)]
pub struct MemoryStateStore {
    runs: Mutex<HashMap<Uuid, MemoryRun>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    async fn append(
        &self,
        event: &TransitionEvent,
        snapshot: &WorkflowState,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().map_err(|e| StoreError::Serialize(e.to_string()))?;
        let run = runs.entry(event.workflow_id).or_default();
        run.events.push(event.clone());
        run.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: Uuid) -> Result<WorkflowState, StoreError> {
        let runs = self.runs.lock().map_err(|e| StoreError::Serialize(e.to_string()))?;
        runs.get(&workflow_id)
            .and_then(|r| r.snapshot.clone())
            .ok_or(StoreError::NotFound(workflow_id))
    }

    async fn events(&self, workflow_id: Uuid) -> Result<Vec<TransitionEvent>, StoreError> {
        let runs = self.runs.lock().map_err(|e| StoreError::Serialize(e.to_string()))?;
        runs.get(&workflow_id)
            .map(|r| r.events.clone())
            .ok_or(StoreError::NotFound(workflow_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
