//! Composite quality gate.
//!
//! The gate is a pure function from a step's spec and a result envelope to a
//! [`GateResult`]. Rules are evaluated in a fixed order so the same envelope
//! always yields the same decision and the same reason list:
//!
//! 1. Any critical issue            -> HardFail
//! 2. Declared artifact missing     -> HardFail
//! 3. Verification failed, no
//!    remediation step configured   -> HardFail
//! 4. Verification failed with a
//!    remediation step              -> SoftFail
//! 5. High-issue count over the
//!    gate threshold                -> SoftFail
//! 6. Regression against baseline   -> SoftFail
//! 7. Confidence under the minimum  -> SoftFail
//! 8. Otherwise                     -> Pass
//!
//! A hard failure short-circuits the soft rules: the reasons of a HardFail
//! only contain hard-rule evidence. A soft failure collects every matching
//! soft rule so the remediation payload carries the full picture.

use gantry_types::envelope::{
    GateDecision, GateReason, GateResult, ResultEnvelope, Severity, VerificationOutcome,
};
use gantry_types::plan::Step;

/// Evaluate the composite gate for one step result.
pub fn evaluate(step: &Step, envelope: &ResultEnvelope) -> GateResult {
    let spec = &step.gate_spec;

    // ---------  Hard rules  ---------

    let mut hard_reasons: Vec<GateReason> = envelope
        .issues
        .iter()
        .filter(|i| i.severity == Severity::Critical)
        .map(|issue| GateReason::CriticalIssue {
            issue: issue.clone(),
        })
        .collect();

    for declared in &step.creates {
        if envelope.artifact(declared).is_none() {
            hard_reasons.push(GateReason::MissingArtifact {
                name: declared.clone(),
            });
        }
    }

    let verification_failed = envelope.verification == VerificationOutcome::Failed;
    if verification_failed && spec.remediation_step.is_none() {
        hard_reasons.push(GateReason::VerificationFailed);
    }

    if !hard_reasons.is_empty() {
        return GateResult {
            decision: GateDecision::HardFail,
            reasons: hard_reasons,
        };
    }

    // ---------  Soft rules  ---------

    let mut soft_reasons: Vec<GateReason> = Vec::new();

    if verification_failed {
        // Remediable because a remediation step is configured.
        soft_reasons.push(GateReason::VerificationFailed);
    }

    let high_count = envelope.issue_count(Severity::High);
    if high_count > spec.high_threshold {
        soft_reasons.push(GateReason::HighIssueCount {
            count: high_count,
            threshold: spec.high_threshold,
        });
    }

    if let Some(baseline) = &spec.baseline {
        if high_count > baseline.high_issues {
            soft_reasons.push(GateReason::Regression {
                high_issues: high_count,
                baseline: baseline.high_issues,
            });
        }
    }

    if let (Some(score), Some(min)) = (envelope.confidence, spec.min_confidence) {
        if score < min {
            soft_reasons.push(GateReason::LowConfidence { score, min });
        }
    }

    if soft_reasons.is_empty() {
        GateResult::pass()
    } else {
        GateResult {
            decision: GateDecision::SoftFail,
            reasons: soft_reasons,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
