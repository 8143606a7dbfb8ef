//! Workflow engine: frontier scheduling, gate routing, and crash-safe state.
//!
//! The engine drives one run at a time per call with a single-writer loop:
//! spawned tasks only invoke workers and report back; all gating, loopback
//! decisions, and state mutation happen on the loop. Every transition is
//! persisted (event appended, snapshot replaced) before the loop moves on,
//! so a crash at any point leaves a resumable snapshot.
//!
//! # Execution flow
//!
//! 1. Validate the plan (graph build + worker resolution) and persist the
//!    initial snapshot.
//! 2. Dispatch every frontier step onto a `tokio::JoinSet`, bounded by the
//!    plan's concurrency cap.
//! 3. As invocations settle, route each result envelope through the quality
//!    gate: Pass completes the step and records its artifacts, SoftFail
//!    enters bounded loopback, HardFail fails the step and skips its
//!    dependents.
//! 4. Worker errors and timeouts become synthetic critical issues and flow
//!    through the same gate path.
//! 5. When nothing is in flight and nothing is runnable, finalize the run
//!    status and persist the terminal snapshot.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use gantry_types::envelope::{
    GateDecision, Issue, RemediationPayload, ResultEnvelope, VerificationOutcome,
};
use gantry_types::error::{PlanError, StoreError};
use gantry_types::event::{TransitionEvent, TransitionKind};
use gantry_types::plan::{ExecutionPlan, Requirement, Step};
use gantry_types::state::{
    ArtifactRecord, StepExecution, StepStatus, WorkflowState, WorkflowStatus,
    SKIP_REASON_UPSTREAM_FAILURE,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::gate;
use crate::graph::PlanGraph;
use crate::loopback::{self, LoopbackDecision};
use crate::report::RunReport;
use crate::store::StateStore;
use crate::telemetry::EventBus;
use crate::worker::{BoxWorker, WorkerInput, WorkerRegistry};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default workflow-level timeout (30 minutes).
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 1800;

/// Default per-invocation timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Default cap on concurrently running steps.
pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 4;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The workflow engine, generic over the state store implementation.
pub struct WorkflowEngine<S: StateStore> {
    store: S,
    registry: WorkerRegistry,
    bus: EventBus,
    /// Cancellation tokens keyed by workflow id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: StateStore> WorkflowEngine<S> {
    pub fn new(store: S, registry: WorkerRegistry) -> Self {
        Self {
            store,
            registry,
            bus: EventBus::default(),
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Access the underlying state store (event log and snapshot queries).
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Subscribe to the live telemetry feed of transition events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TransitionEvent> {
        self.bus.subscribe()
    }

    /// Execute a plan from the beginning and drive it to a terminal status.
    pub async fn start(&self, plan: &ExecutionPlan) -> Result<RunReport, EngineError> {
        let graph = PlanGraph::build(plan)?;
        self.registry.resolve_plan(plan)?;

        let workflow_id = Uuid::now_v7();
        let mut state = WorkflowState::new(
            workflow_id,
            plan.plan_id,
            plan.name.clone(),
            plan.steps.iter().map(|s| s.id.clone()),
        );
        self.persist(
            &state,
            TransitionKind::WorkflowStarted {
                plan_id: plan.plan_id,
                step_count: plan.steps.len(),
            },
        )
        .await?;

        tracing::info!(
            workflow_id = %workflow_id,
            plan = plan.name.as_str(),
            steps = plan.steps.len(),
            "starting workflow"
        );

        self.run_to_terminal(plan, &graph, &mut state).await?;
        Ok(RunReport::from_state(&state))
    }

    /// Resume a run from its last persisted snapshot.
    ///
    /// Idempotent: a run that already reached a terminal status is returned
    /// as-is without invoking any worker. Steps interrupted mid-invocation
    /// are reset to Pending and re-dispatched; completed steps and their
    /// artifacts are never re-run.
    pub async fn resume(
        &self,
        workflow_id: Uuid,
        plan: &ExecutionPlan,
    ) -> Result<RunReport, EngineError> {
        let graph = PlanGraph::build(plan)?;
        self.registry.resolve_plan(plan)?;

        let mut state = self.store.load(workflow_id).await?;
        if state.plan_id != plan.plan_id {
            return Err(EngineError::PlanMismatch {
                workflow_id,
                expected: state.plan_id,
                actual: plan.plan_id,
            });
        }
        if state.status.is_terminal() {
            return Ok(RunReport::from_state(&state));
        }

        let from_status = state.status;
        for step_state in state.step_states.values_mut() {
            if matches!(step_state.status, StepStatus::Running | StepStatus::Ready) {
                step_state.status = StepStatus::Pending;
            }
        }
        state.status = WorkflowStatus::Running;
        state.completed_at = None;
        let unfinished = state.unfinished_step_ids().len();
        self.persist(
            &state,
            TransitionKind::WorkflowResumed {
                from_status,
                unfinished_steps: unfinished,
            },
        )
        .await?;

        tracing::info!(
            workflow_id = %workflow_id,
            plan = plan.name.as_str(),
            unfinished,
            "resuming workflow"
        );

        self.run_to_terminal(plan, &graph, &mut state).await?;
        Ok(RunReport::from_state(&state))
    }

    /// Request cancellation of a running workflow.
    ///
    /// Dispatch stops immediately; in-flight invocations are allowed to
    /// finish but their results are discarded, and the run ends Aborted.
    pub fn cancel(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        match self.cancellation_tokens.get(&workflow_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(workflow_id = %workflow_id, "cancellation requested");
                Ok(())
            }
            None => Err(EngineError::RunNotFound(workflow_id)),
        }
    }

    // ---------  Run loop  ---------

    async fn run_to_terminal(
        &self,
        plan: &ExecutionPlan,
        graph: &PlanGraph,
        state: &mut WorkflowState,
    ) -> Result<(), EngineError> {
        let token = CancellationToken::new();
        self.cancellation_tokens
            .insert(state.workflow_id, token.clone());

        let workflow_timeout =
            Duration::from_secs(plan.timeout_secs.unwrap_or(DEFAULT_WORKFLOW_TIMEOUT_SECS));
        let outcome =
            tokio::time::timeout(workflow_timeout, self.drive(plan, graph, state, &token)).await;
        self.cancellation_tokens.remove(&state.workflow_id);

        let timed_out = outcome.is_err();
        if let Ok(drive_result) = outcome {
            if let Err(e) = drive_result {
                // Persistence failed mid-run: best-effort terminal marker.
                state.status = WorkflowStatus::Aborted;
                state.completed_at = Some(Utc::now());
                let _ = self
                    .persist(
                        state,
                        TransitionKind::WorkflowFinished {
                            status: WorkflowStatus::Aborted,
                        },
                    )
                    .await;
                return Err(e);
            }
        }

        // Steps interrupted by cancellation or the global timeout go back to
        // Pending so a later resume re-dispatches them.
        for step_state in state.step_states.values_mut() {
            if matches!(step_state.status, StepStatus::Running | StepStatus::Ready) {
                step_state.status = StepStatus::Pending;
            }
        }

        let status = if timed_out || token.is_cancelled() {
            WorkflowStatus::Aborted
        } else {
            final_status(state)
        };
        state.status = status;
        state.completed_at = Some(Utc::now());
        self.persist(state, TransitionKind::WorkflowFinished { status })
            .await?;

        tracing::info!(
            workflow_id = %state.workflow_id,
            status = ?status,
            timed_out,
            "workflow finished"
        );
        Ok(())
    }

    /// The single-writer scheduling loop. Returns when nothing is runnable
    /// and nothing is in flight.
    async fn drive(
        &self,
        plan: &ExecutionPlan,
        graph: &PlanGraph,
        state: &mut WorkflowState,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let max_parallel = plan
            .max_parallel_steps
            .unwrap_or(DEFAULT_MAX_PARALLEL_STEPS);
        let mut join_set: JoinSet<Invocation> = JoinSet::new();

        loop {
            if !token.is_cancelled() {
                let frontier: Vec<String> = graph
                    .frontier(state)
                    .into_iter()
                    .map(String::from)
                    .collect();
                for step_id in frontier {
                    if join_set.len() >= max_parallel {
                        break;
                    }
                    let Some(step) = graph.step(&step_id).cloned() else {
                        continue;
                    };
                    let worker = self.worker_for(&step.worker_ref)?;
                    let action = step.action.clone();
                    self.dispatch(
                        state,
                        step,
                        worker,
                        action,
                        InvocationPhase::Initial,
                        None,
                        None,
                        &mut join_set,
                        token,
                    )
                    .await?;
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let invocation = joined.map_err(|e| EngineError::Join(e.to_string()))?;
            if token.is_cancelled() {
                // Result discarded; the step is normalized back to Pending
                // when the run finalizes.
                continue;
            }
            self.settle(graph, state, invocation, &mut join_set, token)
                .await?;
        }
        Ok(())
    }

    /// Mark a step Running, persist the start transition, and spawn the
    /// worker invocation.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        state: &mut WorkflowState,
        step: Step,
        worker: BoxWorker,
        action: String,
        phase: InvocationPhase,
        remediation: Option<RemediationPayload>,
        delay: Option<Duration>,
        join_set: &mut JoinSet<Invocation>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let artifacts = required_artifacts(state, &step);
        let attempt = {
            let Some(step_state) = state.step_states.get_mut(&step.id) else {
                return Ok(());
            };
            step_state.status = StepStatus::Running;
            step_state.attempts.len() as u32 + 1
        };
        let input = WorkerInput {
            action,
            artifacts,
            remediation: remediation.clone(),
            attempt,
        };

        self.persist(
            state,
            TransitionKind::StepStarted {
                step_id: step.id.clone(),
                attempt,
            },
        )
        .await?;

        tracing::debug!(
            workflow_id = %state.workflow_id,
            step_id = step.id.as_str(),
            attempt,
            phase = ?phase,
            "dispatching step"
        );

        let step_timeout = Duration::from_secs(
            step.retry_policy
                .timeout_secs
                .unwrap_or(DEFAULT_STEP_TIMEOUT_SECS),
        );
        let task_token = token.clone();

        join_set.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let step_id = step.id.clone();
            if task_token.is_cancelled() {
                return Invocation {
                    step_id,
                    phase,
                    attempt,
                    remediation,
                    started_at: Utc::now(),
                    duration_ms: 0,
                    outcome: Outcome::Cancelled,
                };
            }
            let started_at = Utc::now();
            let start = std::time::Instant::now();
            // The worker runs in its own task so a panicking worker is
            // contained here and reported like any other invocation failure
            // instead of tearing down the scheduler loop.
            let mut worker_task = tokio::spawn(async move { worker.invoke(&step, input).await });
            let result = tokio::time::timeout(step_timeout, &mut worker_task).await;
            let duration_ms = start.elapsed().as_millis() as u64;
            let outcome = match result {
                Ok(Ok(Ok(envelope))) => Outcome::Envelope(envelope),
                Ok(Ok(Err(worker_err))) => Outcome::Failure {
                    category: "infrastructure",
                    error: worker_err.to_string(),
                },
                Ok(Err(join_err)) => {
                    let error = if join_err.is_panic() {
                        format!("worker panicked: {join_err}")
                    } else {
                        join_err.to_string()
                    };
                    Outcome::Failure {
                        category: "infrastructure",
                        error,
                    }
                }
                Err(_elapsed) => {
                    worker_task.abort();
                    Outcome::Failure {
                        category: "timeout",
                        error: format!("invocation exceeded {}s", step_timeout.as_secs()),
                    }
                }
            };
            Invocation {
                step_id,
                phase,
                attempt,
                remediation,
                started_at,
                duration_ms,
                outcome,
            }
        });
        Ok(())
    }

    /// Route one settled invocation through the gate and apply the outcome.
    async fn settle(
        &self,
        graph: &PlanGraph,
        state: &mut WorkflowState,
        invocation: Invocation,
        join_set: &mut JoinSet<Invocation>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let Some(step) = graph.step(&invocation.step_id).cloned() else {
            return Ok(());
        };

        let (envelope, invocation_error) = match invocation.outcome {
            Outcome::Cancelled => return Ok(()),
            Outcome::Envelope(envelope) => (envelope, None),
            // Worker errors and timeouts become synthetic critical issues and
            // take the normal gate path (hard failure, rule 1).
            Outcome::Failure { category, error } => (
                ResultEnvelope {
                    artifacts: vec![],
                    issues: vec![Issue::synthetic_critical(category, error.clone())],
                    verification: VerificationOutcome::Skipped,
                    confidence: None,
                    logs: vec![],
                    duration_ms: invocation.duration_ms,
                },
                Some(error),
            ),
        };

        let gate_result = gate::evaluate(&step, &envelope);
        tracing::debug!(
            workflow_id = %state.workflow_id,
            step_id = step.id.as_str(),
            attempt = invocation.attempt,
            decision = ?gate_result.decision,
            "gate evaluated"
        );

        // Each loopback re-invocation is audited with its resulting decision.
        if let InvocationPhase::Loopback { attempt, ref target } = invocation.phase {
            let issues = invocation
                .remediation
                .as_ref()
                .map(|p| p.issues.clone())
                .unwrap_or_default();
            if let Some(step_state) = state.step_states.get_mut(&step.id) {
                step_state
                    .loopback_history
                    .push(gantry_types::envelope::LoopbackAttempt {
                        attempt,
                        decision: gate_result.decision,
                        issues,
                        remediation_step: target.clone(),
                        at: Utc::now(),
                    });
            }
            self.persist(
                state,
                TransitionKind::LoopbackAttempted {
                    step_id: step.id.clone(),
                    attempt,
                    decision: gate_result.decision,
                },
            )
            .await?;
        }

        let attempt_status = match gate_result.decision {
            GateDecision::Pass => StepStatus::Completed,
            GateDecision::SoftFail | GateDecision::HardFail => StepStatus::Failed,
        };
        let execution = StepExecution {
            attempt: invocation.attempt,
            started_at: invocation.started_at,
            completed_at: Some(Utc::now()),
            duration_ms: Some(invocation.duration_ms),
            status: attempt_status,
            error: invocation_error.clone(),
            envelope: Some(envelope.clone()),
        };
        if let Some(step_state) = state.step_states.get_mut(&step.id) {
            step_state.attempts.push(execution);
        }

        match gate_result.decision {
            GateDecision::Pass => {
                for produced in &envelope.artifacts {
                    state.artifacts.insert(
                        produced.name.clone(),
                        ArtifactRecord {
                            name: produced.name.clone(),
                            location: produced.location.clone(),
                            produced_by: step.id.clone(),
                            metadata: produced.metadata.clone(),
                            created_at: Utc::now(),
                        },
                    );
                }
                if let Some(step_state) = state.step_states.get_mut(&step.id) {
                    step_state.status = StepStatus::Completed;
                }
                self.persist(
                    state,
                    TransitionKind::StepCompleted {
                        step_id: step.id.clone(),
                        attempt: invocation.attempt,
                        duration_ms: invocation.duration_ms,
                    },
                )
                .await?;
                tracing::info!(
                    workflow_id = %state.workflow_id,
                    step_id = step.id.as_str(),
                    attempt = invocation.attempt,
                    "step completed"
                );
            }

            GateDecision::SoftFail if invocation.phase == InvocationPhase::Escalation => {
                self.block_step(state, &step, invocation.attempt).await?;
            }

            GateDecision::SoftFail => {
                let attempts_used = state
                    .step(&step.id)
                    .map(|s| s.loopback_history.len() as u32)
                    .unwrap_or(0);
                match loopback::decide(&step, attempts_used, &gate_result, &envelope) {
                    LoopbackDecision::Remediate {
                        payload,
                        target,
                        delay,
                    } => {
                        let (worker, action) = match &target {
                            Some(target_id) => {
                                let Some(target_step) = graph.step(target_id) else {
                                    return Err(EngineError::WorkerUnavailable(target_id.clone()));
                                };
                                (
                                    self.worker_for(&target_step.worker_ref)?,
                                    target_step.action.clone(),
                                )
                            }
                            None => (self.worker_for(&step.worker_ref)?, step.action.clone()),
                        };
                        tracing::warn!(
                            workflow_id = %state.workflow_id,
                            step_id = step.id.as_str(),
                            loopback_attempt = payload.attempt,
                            "gate soft-failed, entering loopback"
                        );
                        let phase = InvocationPhase::Loopback {
                            attempt: payload.attempt,
                            target,
                        };
                        self.dispatch(
                            state,
                            step,
                            worker,
                            action,
                            phase,
                            Some(payload),
                            delay,
                            join_set,
                            token,
                        )
                        .await?;
                    }
                    LoopbackDecision::Exhausted {
                        escalation: Some(escalation_ref),
                    } => {
                        let payload = loopback::escalation_payload(
                            &step,
                            attempts_used,
                            &gate_result,
                            &envelope,
                        );
                        let worker = self.worker_for(&escalation_ref)?;
                        let action = step.action.clone();
                        tracing::warn!(
                            workflow_id = %state.workflow_id,
                            step_id = step.id.as_str(),
                            escalation = escalation_ref.as_str(),
                            "loopback budget exhausted, escalating"
                        );
                        self.dispatch(
                            state,
                            step,
                            worker,
                            action,
                            InvocationPhase::Escalation,
                            Some(payload),
                            None,
                            join_set,
                            token,
                        )
                        .await?;
                    }
                    LoopbackDecision::Exhausted { escalation: None } => {
                        self.block_step(state, &step, invocation.attempt).await?;
                    }
                }
            }

            GateDecision::HardFail if invocation.phase == InvocationPhase::Escalation => {
                self.block_step(state, &step, invocation.attempt).await?;
            }

            GateDecision::HardFail => {
                let retries_used = match invocation.phase {
                    InvocationPhase::Initial => Some(0),
                    InvocationPhase::TransientRetry { retries_used } => Some(retries_used),
                    _ => None,
                };
                let transient_budget_left = retries_used
                    .is_some_and(|used| used < step.retry_policy.transient_retries);
                if invocation_error.is_some() && transient_budget_left {
                    let retries_used = retries_used.unwrap_or(0);
                    tracing::warn!(
                        workflow_id = %state.workflow_id,
                        step_id = step.id.as_str(),
                        retries_used,
                        "transient invocation failure, retrying"
                    );
                    let worker = self.worker_for(&step.worker_ref)?;
                    let action = step.action.clone();
                    self.dispatch(
                        state,
                        step,
                        worker,
                        action,
                        InvocationPhase::TransientRetry {
                            retries_used: retries_used + 1,
                        },
                        None,
                        None,
                        join_set,
                        token,
                    )
                    .await?;
                } else {
                    self.fail_step(
                        graph,
                        state,
                        &step,
                        invocation.attempt,
                        invocation_error,
                        gate_result,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Fail a step terminally and skip its transitive dependents.
    async fn fail_step(
        &self,
        graph: &PlanGraph,
        state: &mut WorkflowState,
        step: &Step,
        attempt: u32,
        invocation_error: Option<String>,
        gate_result: gantry_types::envelope::GateResult,
    ) -> Result<(), EngineError> {
        let error =
            invocation_error.unwrap_or_else(|| "quality gate hard-failed".to_string());
        if let Some(step_state) = state.step_states.get_mut(&step.id) {
            step_state.status = StepStatus::Failed;
        }
        self.persist(
            state,
            TransitionKind::StepFailed {
                step_id: step.id.clone(),
                attempt,
                error: error.clone(),
                reasons: gate_result.reasons,
            },
        )
        .await?;
        tracing::error!(
            workflow_id = %state.workflow_id,
            step_id = step.id.as_str(),
            error = error.as_str(),
            "step failed"
        );

        let dependents: Vec<String> = graph
            .dependents_of(&step.id)
            .into_iter()
            .map(String::from)
            .collect();
        for dependent in dependents {
            let skip = state
                .step(&dependent)
                .is_some_and(|s| s.status == StepStatus::Pending);
            if !skip {
                continue;
            }
            if let Some(step_state) = state.step_states.get_mut(&dependent) {
                step_state.status = StepStatus::Skipped;
                step_state.skip_reason = Some(SKIP_REASON_UPSTREAM_FAILURE.to_string());
            }
            self.persist(
                state,
                TransitionKind::StepSkipped {
                    step_id: dependent.clone(),
                    reason: SKIP_REASON_UPSTREAM_FAILURE.to_string(),
                },
            )
            .await?;
            tracing::warn!(
                workflow_id = %state.workflow_id,
                step_id = dependent.as_str(),
                upstream = step.id.as_str(),
                "step skipped, upstream failed"
            );
        }
        Ok(())
    }

    /// Block a step after its remediation budget (and escalation, if any)
    /// ran out without producing acceptable work.
    async fn block_step(
        &self,
        state: &mut WorkflowState,
        step: &Step,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let loopback_attempts = state
            .step(&step.id)
            .map(|s| s.loopback_history.len() as u32)
            .unwrap_or(0);
        if let Some(step_state) = state.step_states.get_mut(&step.id) {
            step_state.status = StepStatus::Blocked;
        }
        self.persist(
            state,
            TransitionKind::StepBlocked {
                step_id: step.id.clone(),
                loopback_attempts,
            },
        )
        .await?;
        tracing::error!(
            workflow_id = %state.workflow_id,
            step_id = step.id.as_str(),
            attempt,
            loopback_attempts,
            "step blocked"
        );
        Ok(())
    }

    // ---------  Helpers  ---------

    fn worker_for(&self, worker_ref: &str) -> Result<BoxWorker, EngineError> {
        self.registry
            .get(worker_ref)
            .ok_or_else(|| EngineError::WorkerUnavailable(worker_ref.to_string()))
    }

    /// Append one event and replace the snapshot, then publish to telemetry.
    async fn persist(
        &self,
        state: &WorkflowState,
        kind: TransitionKind,
    ) -> Result<(), EngineError> {
        let event = TransitionEvent::now(state.workflow_id, kind);
        self.store.append(&event, state).await?;
        self.bus.publish(event);
        Ok(())
    }
}

/// Terminal status precedence once the loop has drained: any failed step
/// aborts the run, otherwise any blocked step blocks it, otherwise all steps
/// satisfied means completion. Steps left pending behind a blocked upstream
/// keep the run in Blocked.
fn final_status(state: &WorkflowState) -> WorkflowStatus {
    let statuses: Vec<StepStatus> = state.step_states.values().map(|s| s.status).collect();
    if statuses.contains(&StepStatus::Failed) {
        WorkflowStatus::Aborted
    } else if state.all_steps_succeeded() {
        WorkflowStatus::Completed
    } else {
        WorkflowStatus::Blocked
    }
}

/// Artifacts named by the step's requirements, resolved from the state.
fn required_artifacts(state: &WorkflowState, step: &Step) -> BTreeMap<String, ArtifactRecord> {
    let mut artifacts = BTreeMap::new();
    for requirement in &step.requires {
        if let Requirement::Artifact { name } = requirement {
            if let Some(record) = state.artifacts.get(name) {
                artifacts.insert(name.clone(), record.clone());
            }
        }
    }
    artifacts
}

// ---------------------------------------------------------------------------
// Invocation bookkeeping
// ---------------------------------------------------------------------------

/// Which leg of a step's lifecycle an invocation belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum InvocationPhase {
    Initial,
    TransientRetry { retries_used: u32 },
    Loopback { attempt: u32, target: Option<String> },
    Escalation,
}

/// What a spawned invocation task reports back to the loop.
struct Invocation {
    step_id: String,
    phase: InvocationPhase,
    attempt: u32,
    remediation: Option<RemediationPayload>,
    started_at: chrono::DateTime<Utc>,
    duration_ms: u64,
    outcome: Outcome,
}

enum Outcome {
    Envelope(ResultEnvelope),
    Failure { category: &'static str, error: String },
    Cancelled,
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced to the engine's caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Plan validation failed (graph or worker resolution).
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    /// The state store failed to persist or load.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    /// No run with this id is currently executing.
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// The snapshot belongs to a different plan than the one supplied.
    #[error("run {workflow_id} belongs to plan {expected}, not {actual}")]
    PlanMismatch {
        workflow_id: Uuid,
        expected: Uuid,
        actual: Uuid,
    },

    /// A worker reference resolved at dispatch time was not registered.
    #[error("worker '{0}' is not registered")]
    WorkerUnavailable(String),

    /// An invocation task panicked or was aborted.
    #[error("task join error: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use crate::worker::{Worker, WorkerError};
    use gantry_types::envelope::{ProducedArtifact, Severity};
    use gantry_types::plan::{GateSpec, RetryPolicy};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    // -----------------------------------------------------------------------
    // Test workers
    // -----------------------------------------------------------------------

    /// Worker that pops scripted results; when the script runs dry it
    /// returns the fallback envelope.
    #[derive(Clone)]
    struct ScriptedWorker {
        script: Arc<Mutex<VecDeque<Result<ResultEnvelope, String>>>>,
        fallback: ResultEnvelope,
        calls: Arc<AtomicU32>,
        inputs: Arc<Mutex<Vec<WorkerInput>>>,
    }

    impl ScriptedWorker {
        fn new(script: Vec<Result<ResultEnvelope, String>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                fallback: ResultEnvelope::passed(),
                calls: Arc::new(AtomicU32::new(0)),
                inputs: Arc::new(Mutex::new(vec![])),
            }
        }

        fn passing() -> Self {
            Self::new(vec![])
        }

        fn with_fallback(fallback: ResultEnvelope) -> Self {
            Self {
                fallback,
                ..Self::new(vec![])
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn recorded_inputs(&self) -> Vec<WorkerInput> {
            self.inputs.lock().unwrap().clone()
        }
    }

    impl Worker for ScriptedWorker {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn invoke(
            &self,
            _step: &Step,
            input: WorkerInput,
        ) -> Result<ResultEnvelope, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(input);
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(envelope)) => Ok(envelope),
                Some(Err(error)) => Err(WorkerError::Failed(error)),
                None => Ok(self.fallback.clone()),
            }
        }
    }

    /// Worker that always panics mid-invocation.
    struct PanickyWorker;

    impl Worker for PanickyWorker {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn invoke(
            &self,
            _step: &Step,
            _input: WorkerInput,
        ) -> Result<ResultEnvelope, WorkerError> {
            panic!("worker blew up");
        }
    }

    /// Worker that sleeps forever (until the test clock advances past a
    /// timeout).
    struct SleepyWorker {
        secs: u64,
    }

    impl Worker for SleepyWorker {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn invoke(
            &self,
            _step: &Step,
            _input: WorkerInput,
        ) -> Result<ResultEnvelope, WorkerError> {
            tokio::time::sleep(Duration::from_secs(self.secs)).await;
            Ok(ResultEnvelope::passed())
        }
    }

    // -----------------------------------------------------------------------
    // Plan builders
    // -----------------------------------------------------------------------

    fn step(id: &str, worker_ref: &str, requires: Vec<&str>) -> Step {
        Step {
            id: id.to_string(),
            worker_ref: worker_ref.to_string(),
            action: format!("run {id}"),
            requires: requires
                .into_iter()
                .map(|id| Requirement::Step { id: id.to_string() })
                .collect(),
            creates: vec![],
            gate_spec: GateSpec::default(),
            retry_policy: RetryPolicy::default(),
        }
    }

    fn plan(steps: Vec<Step>) -> ExecutionPlan {
        ExecutionPlan {
            plan_id: Uuid::now_v7(),
            name: "site-audit".to_string(),
            steps,
            max_parallel_steps: None,
            timeout_secs: None,
            metadata: HashMap::new(),
        }
    }

    fn high_issues(n: usize) -> Vec<Issue> {
        (0..n)
            .map(|i| Issue {
                severity: Severity::High,
                category: "completeness".to_string(),
                evidence: format!("finding {i}"),
                suggested_fix: None,
                owner_step: None,
            })
            .collect()
    }

    fn soft_failing_envelope() -> ResultEnvelope {
        // One high issue against the default threshold of zero.
        ResultEnvelope {
            issues: high_issues(1),
            ..ResultEnvelope::passed()
        }
    }

    fn critical_envelope() -> ResultEnvelope {
        ResultEnvelope {
            issues: vec![Issue::synthetic_critical("completeness", "page corpus empty")],
            ..ResultEnvelope::passed()
        }
    }

    fn engine_with(
        workers: Vec<(&str, ScriptedWorker)>,
    ) -> WorkflowEngine<MemoryStateStore> {
        let mut registry = WorkerRegistry::new();
        for (worker_ref, worker) in workers {
            registry.register(worker_ref, worker);
        }
        WorkflowEngine::new(MemoryStateStore::new(), registry)
    }

    // -----------------------------------------------------------------------
    // Happy path
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn linear_plan_completes_with_artifacts() {
        let crawler = ScriptedWorker::with_fallback(ResultEnvelope {
            artifacts: vec![ProducedArtifact {
                name: "pages".to_string(),
                location: "mem://pages".to_string(),
                metadata: serde_json::Value::Null,
            }],
            ..ResultEnvelope::passed()
        });
        let auditor = ScriptedWorker::passing();
        let engine = engine_with(vec![("crawler", crawler.clone()), ("auditor", auditor.clone())]);

        let mut crawl = step("crawl", "crawler", vec![]);
        crawl.creates = vec!["pages".to_string()];
        let mut audit = step("audit", "auditor", vec![]);
        audit.requires = vec![Requirement::Artifact {
            name: "pages".to_string(),
        }];
        let plan = plan(vec![crawl, audit]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(report.completed_steps, vec!["audit", "crawl"]);
        assert!(report.unfinished.is_empty());
        assert_eq!(report.artifacts["pages"].produced_by, "crawl");
        assert_eq!(crawler.call_count(), 1);
        assert_eq!(auditor.call_count(), 1);

        // The auditor saw the crawl artifact in its input.
        let inputs = auditor.recorded_inputs();
        assert!(inputs[0].artifacts.contains_key("pages"));

        // Event log brackets the run.
        let events = engine.store().events(report.workflow_id).await.unwrap();
        assert!(matches!(events[0].kind, TransitionKind::WorkflowStarted { .. }));
        assert!(matches!(
            events.last().unwrap().kind,
            TransitionKind::WorkflowFinished {
                status: WorkflowStatus::Completed
            }
        ));
    }

    #[tokio::test]
    async fn parallel_branches_both_run() {
        let worker = ScriptedWorker::passing();
        let engine = engine_with(vec![("w", worker.clone())]);
        let plan = plan(vec![
            step("a", "w", vec![]),
            step("b", "w", vec!["a"]),
            step("c", "w", vec!["a"]),
            step("d", "w", vec!["b", "c"]),
        ]);
        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(worker.call_count(), 4);
    }

    // -----------------------------------------------------------------------
    // Hard failure and dependent skipping
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn hard_failure_skips_dependents_and_aborts() {
        // a -> {b, c}; b -> d. The b worker reports a critical issue.
        let good = ScriptedWorker::passing();
        let bad = ScriptedWorker::with_fallback(critical_envelope());
        let engine = engine_with(vec![("good", good.clone()), ("bad", bad)]);
        let plan = plan(vec![
            step("a", "good", vec![]),
            step("b", "bad", vec!["a"]),
            step("c", "good", vec!["a"]),
            step("d", "good", vec!["b"]),
        ]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Aborted);
        assert!(report.completed_steps.contains(&"a".to_string()));
        assert!(report.completed_steps.contains(&"c".to_string()));

        let b = report.unfinished.iter().find(|s| s.step_id == "b").unwrap();
        assert_eq!(b.status, StepStatus::Failed);
        let d = report.unfinished.iter().find(|s| s.step_id == "d").unwrap();
        assert_eq!(d.status, StepStatus::Skipped);
        assert_eq!(d.skip_reason.as_deref(), Some(SKIP_REASON_UPSTREAM_FAILURE));

        // d was never dispatched.
        assert_eq!(good.call_count(), 2);
    }

    // -----------------------------------------------------------------------
    // Loopback
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn loopback_is_bounded_and_audited() {
        // Always soft-fails: default budget of 3, then Blocked.
        let worker = ScriptedWorker::with_fallback(soft_failing_envelope());
        let engine = engine_with(vec![("w", worker.clone())]);
        let plan = plan(vec![step("audit", "w", vec![])]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Blocked);
        let audit = &report.unfinished[0];
        assert_eq!(audit.status, StepStatus::Blocked);
        assert_eq!(audit.loopback_history.len(), 3, "exactly the budget");
        assert!(audit
            .loopback_history
            .iter()
            .all(|a| a.decision == GateDecision::SoftFail));
        assert_eq!(
            audit
                .loopback_history
                .iter()
                .map(|a| a.attempt)
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        // Initial invocation plus three remediation attempts.
        assert_eq!(worker.call_count(), 4);
    }

    #[tokio::test]
    async fn loopback_recovery_completes_step() {
        let worker = ScriptedWorker::new(vec![
            Ok(soft_failing_envelope()),
            Ok(ResultEnvelope::passed()),
        ]);
        let engine = engine_with(vec![("w", worker.clone())]);
        let plan = plan(vec![step("audit", "w", vec![])]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(worker.call_count(), 2);

        // The remediation attempt carried the triggering issues.
        let inputs = worker.recorded_inputs();
        assert!(inputs[0].remediation.is_none());
        let payload = inputs[1].remediation.as_ref().unwrap();
        assert_eq!(payload.step_id, "audit");
        assert_eq!(payload.attempt, 1);
        assert_eq!(payload.issues.len(), 1);

        // History records the successful attempt too.
        let state = engine.store().load(report.workflow_id).await.unwrap();
        let history = &state.step("audit").unwrap().loopback_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].decision, GateDecision::Pass);
    }

    #[tokio::test]
    async fn loopback_targets_designated_remediation_step() {
        let auditor = ScriptedWorker::new(vec![Ok(soft_failing_envelope())]);
        let fixer = ScriptedWorker::passing();
        let engine = engine_with(vec![("auditor", auditor.clone()), ("fixer", fixer.clone())]);

        let mut audit = step("audit", "auditor", vec![]);
        audit.gate_spec.remediation_step = Some("fix".to_string());
        // The fix step exists in the plan but only runs via loopback: its
        // gate requirements keep it off the frontier.
        let mut fix = step("fix", "fixer", vec![]);
        fix.requires = vec![Requirement::Step {
            id: "audit".to_string(),
        }];
        let plan = plan(vec![audit, fix]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        // Remediation went to the fixer's worker, with the payload.
        assert_eq!(fixer.call_count(), 2, "loopback invocation plus own step");
        let remediation_calls: Vec<_> = fixer
            .recorded_inputs()
            .into_iter()
            .filter(|i| i.remediation.is_some())
            .collect();
        assert_eq!(remediation_calls.len(), 1);

        let state = engine.store().load(report.workflow_id).await.unwrap();
        let history = &state.step("audit").unwrap().loopback_history;
        assert_eq!(history[0].remediation_step.as_deref(), Some("fix"));
    }

    // -----------------------------------------------------------------------
    // Escalation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn escalation_worker_gets_one_final_attempt() {
        let worker = ScriptedWorker::with_fallback(soft_failing_envelope());
        let senior = ScriptedWorker::passing();
        let engine = engine_with(vec![("w", worker.clone()), ("senior", senior.clone())]);

        let mut audit = step("audit", "w", vec![]);
        audit.retry_policy.max_attempts = 0; // straight to escalation
        audit.retry_policy.escalation = Some("senior".to_string());
        let plan = plan(vec![audit]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(worker.call_count(), 1);
        assert_eq!(senior.call_count(), 1);
        let payload = senior.recorded_inputs()[0].remediation.clone().unwrap();
        assert_eq!(payload.step_id, "audit");
    }

    #[tokio::test]
    async fn failed_escalation_blocks_step() {
        let worker = ScriptedWorker::with_fallback(soft_failing_envelope());
        let senior = ScriptedWorker::with_fallback(soft_failing_envelope());
        let engine = engine_with(vec![("w", worker), ("senior", senior)]);

        let mut audit = step("audit", "w", vec![]);
        audit.retry_policy.max_attempts = 0;
        audit.retry_policy.escalation = Some("senior".to_string());
        let plan = plan(vec![audit]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Blocked);
        assert_eq!(report.unfinished[0].status, StepStatus::Blocked);
    }

    #[tokio::test]
    async fn blocked_step_leaves_dependents_pending() {
        let worker = ScriptedWorker::with_fallback(soft_failing_envelope());
        let good = ScriptedWorker::passing();
        let engine = engine_with(vec![("w", worker), ("good", good.clone())]);

        let mut audit = step("audit", "w", vec![]);
        audit.retry_policy.max_attempts = 0;
        let publish = step("publish", "good", vec!["audit"]);
        let plan = plan(vec![audit, publish]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Blocked);
        let publish_report = report
            .unfinished
            .iter()
            .find(|s| s.step_id == "publish")
            .unwrap();
        assert_eq!(publish_report.status, StepStatus::Pending);
        assert_eq!(good.call_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Worker errors and timeouts
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn transient_worker_error_is_retried() {
        let worker = ScriptedWorker::new(vec![
            Err("backend unreachable".to_string()),
            Ok(ResultEnvelope::passed()),
        ]);
        let engine = engine_with(vec![("w", worker.clone())]);
        let plan = plan(vec![step("crawl", "w", vec![])]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(worker.call_count(), 2);

        // The failed attempt is on the record with its synthetic issue.
        let state = engine.store().load(report.workflow_id).await.unwrap();
        let attempts = &state.step("crawl").unwrap().attempts;
        assert_eq!(attempts.len(), 2);
        let first_envelope = attempts[0].envelope.as_ref().unwrap();
        assert_eq!(first_envelope.issues[0].category, "infrastructure");
        assert_eq!(first_envelope.issues[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn exhausted_transient_retries_fail_the_step() {
        // Default transient budget is 1: two invocation errors fail the step.
        let worker = ScriptedWorker::new(vec![
            Err("backend unreachable".to_string()),
            Err("backend unreachable".to_string()),
        ]);
        let engine = engine_with(vec![("w", worker.clone())]);
        let plan = plan(vec![step("crawl", "w", vec![])]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Aborted);
        assert_eq!(worker.call_count(), 2);
        let crawl = &report.unfinished[0];
        assert_eq!(crawl.status, StepStatus::Failed);
        assert!(crawl.error.as_deref().unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn panicking_worker_fails_step_through_the_gate() {
        let good = ScriptedWorker::passing();
        let mut registry = WorkerRegistry::new();
        registry.register("panicky", PanickyWorker);
        registry.register("good", good.clone());
        let engine = WorkflowEngine::new(MemoryStateStore::new(), registry);

        let mut crawl = step("crawl", "panicky", vec![]);
        crawl.retry_policy.transient_retries = 0;
        let publish = step("publish", "good", vec!["crawl"]);
        let plan = plan(vec![crawl, publish]);

        // The panic is contained: the run still produces a report, the step
        // fails through the gate, and dependents are skipped.
        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Aborted);

        let crawl_report = report
            .unfinished
            .iter()
            .find(|s| s.step_id == "crawl")
            .unwrap();
        assert_eq!(crawl_report.status, StepStatus::Failed);
        assert!(crawl_report.error.as_deref().unwrap().contains("panicked"));
        assert_eq!(crawl_report.issues[0].severity, Severity::Critical);
        assert_eq!(crawl_report.issues[0].category, "infrastructure");

        let publish_report = report
            .unfinished
            .iter()
            .find(|s| s.step_id == "publish")
            .unwrap();
        assert_eq!(publish_report.status, StepStatus::Skipped);
        assert_eq!(good.call_count(), 0);
    }

    #[tokio::test]
    async fn panicking_worker_consumes_transient_retries() {
        // Default transient budget of 1: two panics, then the step fails.
        let mut registry = WorkerRegistry::new();
        registry.register("panicky", PanickyWorker);
        let engine = WorkflowEngine::new(MemoryStateStore::new(), registry);
        let plan = plan(vec![step("crawl", "panicky", vec![])]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Aborted);

        let state = engine.store().load(report.workflow_id).await.unwrap();
        assert_eq!(state.step("crawl").unwrap().attempts.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_synthetic_critical_issue() {
        let mut registry = WorkerRegistry::new();
        registry.register("slow", SleepyWorker { secs: 3600 });
        let engine = WorkflowEngine::new(MemoryStateStore::new(), registry);

        let mut crawl = step("crawl", "slow", vec![]);
        crawl.retry_policy.timeout_secs = Some(5);
        crawl.retry_policy.transient_retries = 0;
        let plan = plan(vec![crawl]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Aborted);
        assert_eq!(report.unfinished[0].issues[0].category, "timeout");
        assert_eq!(report.unfinished[0].issues[0].severity, Severity::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn workflow_timeout_aborts_run() {
        let mut registry = WorkerRegistry::new();
        registry.register("slow", SleepyWorker { secs: 60 });
        let engine = WorkflowEngine::new(MemoryStateStore::new(), registry);

        let mut plan = plan(vec![step("crawl", "slow", vec![])]);
        plan.timeout_secs = Some(1);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Aborted);
        // The interrupted step is back to Pending for a later resume.
        assert_eq!(report.unfinished[0].status, StepStatus::Pending);
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn resume_of_terminal_run_is_idempotent() {
        let worker = ScriptedWorker::passing();
        let engine = engine_with(vec![("w", worker.clone())]);
        let plan = plan(vec![step("a", "w", vec![]), step("b", "w", vec!["a"])]);

        let report = engine.start(&plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(worker.call_count(), 2);

        let resumed = engine.resume(report.workflow_id, &plan).await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Completed);
        assert_eq!(worker.call_count(), 2, "no worker re-invoked");
    }

    #[tokio::test]
    async fn resume_runs_only_unfinished_steps() {
        let worker = ScriptedWorker::passing();
        let mut registry = WorkerRegistry::new();
        registry.register("w", worker.clone());

        let plan = plan(vec![step("a", "w", vec![]), step("b", "w", vec!["a"])]);

        // Snapshot as left behind by an interrupted run: a completed, b
        // caught mid-invocation.
        let workflow_id = Uuid::now_v7();
        let mut state = WorkflowState::new(
            workflow_id,
            plan.plan_id,
            plan.name.clone(),
            plan.steps.iter().map(|s| s.id.clone()),
        );
        state.step_states.get_mut("a").unwrap().status = StepStatus::Completed;
        state.step_states.get_mut("b").unwrap().status = StepStatus::Running;

        let store = MemoryStateStore::new();
        store
            .append(
                &TransitionEvent::now(
                    workflow_id,
                    TransitionKind::WorkflowStarted {
                        plan_id: plan.plan_id,
                        step_count: 2,
                    },
                ),
                &state,
            )
            .await
            .unwrap();

        let engine = WorkflowEngine::new(store, registry);
        let report = engine.resume(workflow_id, &plan).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(worker.call_count(), 1, "only b re-dispatched");
        assert_eq!(worker.recorded_inputs()[0].action, "run b");
    }

    #[tokio::test]
    async fn resume_rejects_mismatched_plan() {
        let worker = ScriptedWorker::passing();
        let engine = engine_with(vec![("w", worker)]);
        let plan_a = plan(vec![step("a", "w", vec![])]);
        let report = engine.start(&plan_a).await.unwrap();

        let plan_b = plan(vec![step("a", "w", vec![])]);
        let err = engine.resume(report.workflow_id, &plan_b).await.unwrap_err();
        assert!(matches!(err, EngineError::PlanMismatch { .. }));
    }

    #[tokio::test]
    async fn resume_unknown_run_is_not_found() {
        let engine = engine_with(vec![("w", ScriptedWorker::passing())]);
        let plan = plan(vec![step("a", "w", vec![])]);
        let err = engine.resume(Uuid::now_v7(), &plan).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::NotFound(_))));
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_without_completing_in_flight_work() {
        let mut registry = WorkerRegistry::new();
        registry.register("slow", SleepyWorker { secs: 30 });
        let engine = Arc::new(WorkflowEngine::new(MemoryStateStore::new(), registry));
        let plan = plan(vec![step("crawl", "slow", vec![])]);

        let mut events = engine.subscribe();
        let run = tokio::spawn({
            let engine = Arc::clone(&engine);
            let plan = plan.clone();
            async move { engine.start(&plan).await }
        });

        // Wait until the step is in flight, then cancel.
        let workflow_id = loop {
            let event = events.recv().await.unwrap();
            if matches!(event.kind, TransitionKind::StepStarted { .. }) {
                break event.workflow_id;
            }
        };
        engine.cancel(workflow_id).unwrap();

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.status, WorkflowStatus::Aborted);
        // The in-flight invocation's result was discarded.
        assert!(report.completed_steps.is_empty());
        assert_eq!(report.unfinished[0].status, StepStatus::Pending);
        assert!(report.artifacts.is_empty());
    }

    #[tokio::test]
    async fn cancel_unknown_run_is_not_found() {
        let engine = engine_with(vec![]);
        assert!(matches!(
            engine.cancel(Uuid::now_v7()).unwrap_err(),
            EngineError::RunNotFound(_)
        ));
    }
}
