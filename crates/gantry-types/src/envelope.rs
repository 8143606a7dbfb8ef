//! Worker result envelopes, issues, gate results, and remediation payloads.
//!
//! A [`ResultEnvelope`] is the structured return value of every worker
//! invocation. The gate evaluator turns an envelope into a [`GateResult`];
//! soft failures produce a [`RemediationPayload`] fed back to the worker on
//! the next loopback attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// Severity of a reported issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

/// A single defect or concern attached to a step's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// How bad it is. A single `Critical` hard-fails the gate.
    pub severity: Severity,
    /// Free-form category (e.g. "completeness", "infrastructure", "timeout").
    pub category: String,
    /// What was observed.
    pub evidence: String,
    /// Suggested fix carried into the remediation payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    /// Step responsible for addressing this issue, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_step: Option<String>,
}

impl Issue {
    /// Build a synthetic critical issue for invocation failures.
    ///
    /// Used by the engine to convert worker errors and timeouts into the
    /// normal gate path instead of crashing the scheduler loop.
    pub fn synthetic_critical(category: &str, evidence: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            category: category.to_string(),
            evidence: evidence.into(),
            suggested_fix: None,
            owner_step: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Result envelope
// ---------------------------------------------------------------------------

/// Verification outcome reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Passed,
    Failed,
    Skipped,
}

/// An artifact a worker reports having produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducedArtifact {
    /// Artifact name, matched against the step's `creates` declaration.
    pub name: String,
    /// Where the artifact lives (path, URL, object key -- opaque to the engine).
    pub location: String,
    /// Worker-defined metadata.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Structured result of one worker invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Artifacts the worker produced.
    #[serde(default)]
    pub artifacts: Vec<ProducedArtifact>,
    /// Issues found while performing or verifying the work.
    #[serde(default)]
    pub issues: Vec<Issue>,
    /// Verification outcome for the produced work.
    pub verification: VerificationOutcome,
    /// Confidence score in [0, 1], if the worker reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Worker log lines for the audit trail.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    /// Wall-clock duration of the invocation in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

impl ResultEnvelope {
    /// An envelope with no artifacts, no issues, and passed verification.
    pub fn passed() -> Self {
        Self {
            artifacts: vec![],
            issues: vec![],
            verification: VerificationOutcome::Passed,
            confidence: None,
            logs: vec![],
            duration_ms: 0,
        }
    }

    /// Look up a produced artifact by name.
    pub fn artifact(&self, name: &str) -> Option<&ProducedArtifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    /// Count issues of the given severity.
    pub fn issue_count(&self, severity: Severity) -> u32 {
        self.issues.iter().filter(|i| i.severity == severity).count() as u32
    }
}

// ---------------------------------------------------------------------------
// Gate results
// ---------------------------------------------------------------------------

/// The gate's verdict on a result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Work is acceptable; the step completes.
    Pass,
    /// Work is deficient but remediable; enter loopback.
    SoftFail,
    /// Work is fatally broken; the step fails.
    HardFail,
}

/// Why the gate decided the way it did.
///
/// Internally tagged so persisted reasons read as
/// `{ "reason": "high_issue_count", "count": 3, "threshold": 2 }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GateReason {
    /// A critical-severity issue was present.
    CriticalIssue { issue: Issue },
    /// A declared artifact was missing from the envelope.
    MissingArtifact { name: String },
    /// Verification failed and no remediation path is configured.
    VerificationFailed,
    /// More high-severity issues than the gate spec tolerates.
    HighIssueCount { count: u32, threshold: u32 },
    /// The envelope regressed against the recorded baseline.
    Regression { high_issues: u32, baseline: u32 },
    /// Confidence below the configured minimum.
    LowConfidence { score: f64, min: f64 },
}

/// The composite gate decision plus the reasons behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub decision: GateDecision,
    /// Empty on Pass; otherwise the matched rule evidence, in rule order.
    #[serde(default)]
    pub reasons: Vec<GateReason>,
}

impl GateResult {
    /// A passing result with no reasons attached.
    pub fn pass() -> Self {
        Self {
            decision: GateDecision::Pass,
            reasons: vec![],
        }
    }
}

// ---------------------------------------------------------------------------
// Remediation
// ---------------------------------------------------------------------------

/// Structured input fed back into a step on a loopback attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationPayload {
    /// The step whose output is being remediated.
    pub step_id: String,
    /// 1-based loopback attempt number this payload belongs to.
    pub attempt: u32,
    /// The issues that triggered the soft failure, with suggested fixes.
    pub issues: Vec<Issue>,
    /// Gate reasons in rule order (threshold breaches, regressions, ...).
    #[serde(default)]
    pub reasons: Vec<GateReason>,
}

/// One audited remediation attempt. Appended, never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopbackAttempt {
    /// 1-based loopback attempt number.
    pub attempt: u32,
    /// The gate decision this attempt produced.
    pub decision: GateDecision,
    /// Issues addressed by this attempt.
    pub issues: Vec<Issue>,
    /// Remediation step invoked, when the gate spec designates one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_step: Option<String>,
    /// When the attempt was recorded.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
