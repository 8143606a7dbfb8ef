//! The worker port: the trait step invocations are dispatched through, its
//! object-safe wrapper, and the runtime registry that maps `worker_ref`
//! strings to worker instances.
//!
//! `Worker` uses RPITIT, so it cannot be a trait object directly. The
//! blanket-impl pattern provides dynamic dispatch:
//! 1. Define an object-safe `WorkerDyn` trait with boxed futures
//! 2. Blanket-impl `WorkerDyn` for all `T: Worker`
//! 3. `BoxWorker` wraps `Arc<dyn WorkerDyn>` and delegates

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use gantry_types::envelope::{RemediationPayload, ResultEnvelope};
use gantry_types::error::PlanError;
use gantry_types::plan::{ExecutionPlan, Step};
use gantry_types::state::ArtifactRecord;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Invocation input and errors
// ---------------------------------------------------------------------------

/// Everything a worker receives for one invocation.
#[derive(Debug, Clone)]
pub struct WorkerInput {
    /// The step's declared action.
    pub action: String,
    /// Artifacts the step's requirements resolve to, keyed by name.
    pub artifacts: BTreeMap<String, ArtifactRecord>,
    /// Present on loopback attempts: the issues to address.
    pub remediation: Option<RemediationPayload>,
    /// 1-based invocation attempt for this step.
    pub attempt: u32,
}

/// Errors a worker can return. The engine converts these into synthetic
/// critical issues so they flow through the normal gate path.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker could not perform the action at all.
    #[error("worker failed: {0}")]
    Failed(String),
    /// The worker produced something, but not a usable result envelope.
    #[error("malformed result envelope: {0}")]
    MalformedEnvelope(String),
}

// ---------------------------------------------------------------------------
// Worker trait (RPITIT) and object-safe wrapper
// ---------------------------------------------------------------------------

/// A unit of execution capability (a crawler, an auditor, a fixer).
///
/// Workers are stateless from the engine's point of view: all context
/// arrives in the [`WorkerInput`], and all results leave in the
/// [`ResultEnvelope`]. A worker must never mutate workflow state directly.
pub trait Worker: Send + Sync {
    /// Name used for registry diagnostics.
    fn name(&self) -> &str;

    /// Perform the step's action and report the result.
    fn invoke(
        &self,
        step: &Step,
        input: WorkerInput,
    ) -> impl Future<Output = Result<ResultEnvelope, WorkerError>> + Send;
}

/// Object-safe version of [`Worker`] with boxed futures.
pub trait WorkerDyn: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_boxed<'a>(
        &'a self,
        step: &'a Step,
        input: WorkerInput,
    ) -> Pin<Box<dyn Future<Output = Result<ResultEnvelope, WorkerError>> + Send + 'a>>;
}

/// Blanket implementation: any `Worker` automatically implements `WorkerDyn`.
impl<T: Worker> WorkerDyn for T {
    fn name(&self) -> &str {
        Worker::name(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        step: &'a Step,
        input: WorkerInput,
    ) -> Pin<Box<dyn Future<Output = Result<ResultEnvelope, WorkerError>> + Send + 'a>> {
        Box::pin(self.invoke(step, input))
    }
}

/// Type-erased, cheaply cloneable worker handle.
///
/// The engine clones a `BoxWorker` into every spawned invocation task, so
/// the inner trait object is shared behind an `Arc`.
#[derive(Clone)]
pub struct BoxWorker {
    inner: Arc<dyn WorkerDyn>,
}

impl BoxWorker {
    /// Wrap a concrete `Worker` in a type-erased handle.
    pub fn new<T: Worker + 'static>(worker: T) -> Self {
        Self {
            inner: Arc::new(worker),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Perform the step's action and report the result.
    pub async fn invoke(
        &self,
        step: &Step,
        input: WorkerInput,
    ) -> Result<ResultEnvelope, WorkerError> {
        self.inner.invoke_boxed(step, input).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps the `worker_ref` strings a plan uses to registered worker instances.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, BoxWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under the given reference. Replaces any previous
    /// worker with the same reference.
    pub fn register<T: Worker + 'static>(&mut self, worker_ref: impl Into<String>, worker: T) {
        self.workers.insert(worker_ref.into(), BoxWorker::new(worker));
    }

    /// Look up a worker by reference.
    pub fn get(&self, worker_ref: &str) -> Option<BoxWorker> {
        self.workers.get(worker_ref).cloned()
    }

    /// Verify that every `worker_ref` and every escalation worker the plan
    /// names is registered. Run before execution starts so a missing worker
    /// surfaces as a plan error instead of a mid-run failure.
    pub fn resolve_plan(&self, plan: &ExecutionPlan) -> Result<(), PlanError> {
        for step in &plan.steps {
            if !self.workers.contains_key(&step.worker_ref) {
                return Err(PlanError::UnknownWorker {
                    step_id: step.id.clone(),
                    worker_ref: step.worker_ref.clone(),
                });
            }
            if let Some(escalation) = &step.retry_policy.escalation {
                if !self.workers.contains_key(escalation) {
                    return Err(PlanError::UnknownWorker {
                        step_id: step.id.clone(),
                        worker_ref: escalation.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
