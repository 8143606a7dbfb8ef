//! Bounded loopback remediation.
//!
//! When the gate soft-fails a step, the loopback controller decides whether
//! to re-invoke (the step itself, or its designated remediation step) with a
//! structured [`RemediationPayload`], or to declare the budget exhausted.
//! The controller is stateless: the engine owns the attempt count via the
//! step's loopback history and passes it in on every call.

use std::time::Duration;

use gantry_types::envelope::{GateResult, Issue, RemediationPayload, ResultEnvelope, Severity};
use gantry_types::plan::{RetryPolicy, Step};

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// What to do after a soft failure.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopbackDecision {
    /// Re-invoke with the given payload. `target` names the designated
    /// remediation step when the gate spec has one; otherwise the step
    /// itself is re-invoked.
    Remediate {
        payload: RemediationPayload,
        target: Option<String>,
        delay: Option<Duration>,
    },
    /// Budget exhausted. When `escalation` names a worker, the engine gives
    /// it one final invocation before blocking the step.
    Exhausted { escalation: Option<String> },
}

/// Decide the next move after a soft failure.
///
/// `attempts_used` is the number of loopback attempts already recorded for
/// this step (zero right after the initial invocation).
pub fn decide(
    step: &Step,
    attempts_used: u32,
    gate: &GateResult,
    envelope: &ResultEnvelope,
) -> LoopbackDecision {
    let policy = &step.retry_policy;
    if attempts_used >= policy.max_attempts {
        return LoopbackDecision::Exhausted {
            escalation: policy.escalation.clone(),
        };
    }
    let attempt = attempts_used + 1;
    LoopbackDecision::Remediate {
        payload: RemediationPayload {
            step_id: step.id.clone(),
            attempt,
            issues: remediation_issues(envelope),
            reasons: gate.reasons.clone(),
        },
        target: step.gate_spec.remediation_step.clone(),
        delay: backoff_delay(policy, attempt),
    }
}

/// Payload handed to the escalation worker once the loopback budget is
/// exhausted. Carries the attempt number past the budget so the audit trail
/// distinguishes it from regular loopback attempts.
pub fn escalation_payload(
    step: &Step,
    attempts_used: u32,
    gate: &GateResult,
    envelope: &ResultEnvelope,
) -> RemediationPayload {
    RemediationPayload {
        step_id: step.id.clone(),
        attempt: attempts_used + 1,
        issues: remediation_issues(envelope),
        reasons: gate.reasons.clone(),
    }
}

/// Delay before the given 1-based loopback attempt, per the step's backoff
/// schedule. `None` when the policy has no backoff configured.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Option<Duration> {
    let backoff = policy.backoff.as_ref()?;
    let factor = backoff.multiplier.max(0.0).powi(attempt.saturating_sub(1) as i32);
    let millis = (backoff.initial_ms as f64 * factor).min(u64::MAX as f64) as u64;
    Some(Duration::from_millis(millis))
}

/// The issues a remediation attempt is asked to address: the high-severity
/// issues from the failing envelope, or every reported issue when none of
/// them are high-severity (confidence or verification failures).
fn remediation_issues(envelope: &ResultEnvelope) -> Vec<Issue> {
    let highs: Vec<Issue> = envelope
        .issues
        .iter()
        .filter(|i| i.severity == Severity::High)
        .cloned()
        .collect();
    if highs.is_empty() {
        envelope.issues.clone()
    } else {
        highs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
