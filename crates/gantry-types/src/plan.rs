//! Execution plan types: steps, gate specs, and retry policies.
//!
//! An [`ExecutionPlan`] is the validated, normalized input to the engine.
//! It arrives pre-parsed from an external plan builder; the engine never
//! reads raw workflow definitions. Plans and their steps are immutable once
//! the step graph has been built.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single step in an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// User-defined step ID (e.g. "gather-sources"). Unique within a plan.
    pub id: String,
    /// Which registered worker performs this step.
    pub worker_ref: String,
    /// The action the worker is asked to perform.
    pub action: String,
    /// Steps and artifacts this step needs before it can run (DAG edges).
    #[serde(default)]
    pub requires: Vec<Requirement>,
    /// Artifact names this step declares it will produce.
    #[serde(default)]
    pub creates: Vec<String>,
    /// Composite quality-gate thresholds for this step's results.
    #[serde(default)]
    pub gate_spec: GateSpec,
    /// Retry/loopback policy for this step.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// A single dependency declared by a step.
///
/// Internally tagged by `type` so plans serialize as:
/// ```json
/// { "type": "step", "id": "gather-sources" }
/// { "type": "artifact", "name": "source-list" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Requirement {
    /// The named step must reach a terminal success status first.
    Step { id: String },
    /// The named artifact must exist in the workflow state.
    Artifact { name: String },
}

// ---------------------------------------------------------------------------
// Gate specification
// ---------------------------------------------------------------------------

/// Thresholds for the composite quality gate, loaded from the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    /// Maximum tolerated count of high-severity issues (inclusive).
    #[serde(default)]
    pub high_threshold: u32,
    /// Minimum acceptable confidence score, if the worker reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f64>,
    /// Baseline for regression detection, if one was recorded for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Baseline>,
    /// Designated remediation step for loopback re-invocation. When absent,
    /// loopback re-invokes the step itself; when absent AND verification
    /// fails, the gate hard-fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_step: Option<String>,
}

impl Default for GateSpec {
    fn default() -> Self {
        Self {
            high_threshold: 0,
            min_confidence: None,
            baseline: None,
            remediation_step: None,
        }
    }
}

/// A recorded baseline a new result envelope is compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// High-severity issue count of the baseline run.
    pub high_issues: u32,
    /// Confidence score of the baseline run, if one was reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry and loopback policy for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Loopback budget: maximum remediation attempts after a soft failure
    /// (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Optional backoff applied between loopback attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    /// Plain re-run budget for transient hard failures (worker error or
    /// timeout), independent of the loopback budget (default 1).
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    /// Per-invocation timeout in seconds (default 300).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Worker to hand the step to once the loopback budget is exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_transient_retries() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: None,
            transient_retries: default_transient_retries(),
            timeout_secs: None,
            escalation: None,
        }
    }
}

/// Delay schedule between loopback attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry, in milliseconds.
    pub initial_ms: u64,
    /// Multiplier applied for each subsequent attempt (1.0 = fixed delay).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// The validated, normalized graph of steps for one workflow definition.
///
/// Invariant: acyclic, and every `requires` reference resolves to a prior
/// step or a produced artifact. `PlanGraph::build` in gantry-core enforces
/// this before any execution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// UUIDv7 assigned by the plan builder.
    pub plan_id: Uuid,
    /// Human-readable plan name.
    pub name: String,
    /// Ordered list of step definitions forming the workflow DAG.
    pub steps: Vec<Step>,
    /// Concurrency cap for dispatched steps (None = engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,
    /// Global workflow timeout in seconds (None = engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Extensible metadata passed through untouched.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionPlan {
    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_plan() -> ExecutionPlan {
        ExecutionPlan {
            plan_id: Uuid::now_v7(),
            name: "site-audit".to_string(),
            steps: vec![
                Step {
                    id: "crawl".to_string(),
                    worker_ref: "crawler".to_string(),
                    action: "crawl-site".to_string(),
                    requires: vec![],
                    creates: vec!["page-index".to_string()],
                    gate_spec: GateSpec::default(),
                    retry_policy: RetryPolicy::default(),
                },
                Step {
                    id: "audit".to_string(),
                    worker_ref: "auditor".to_string(),
                    action: "audit-pages".to_string(),
                    requires: vec![
                        Requirement::Step {
                            id: "crawl".to_string(),
                        },
                        Requirement::Artifact {
                            name: "page-index".to_string(),
                        },
                    ],
                    creates: vec!["audit-report".to_string()],
                    gate_spec: GateSpec {
                        high_threshold: 2,
                        min_confidence: Some(0.8),
                        baseline: Some(Baseline {
                            high_issues: 1,
                            confidence: Some(0.9),
                        }),
                        remediation_step: None,
                    },
                    retry_policy: RetryPolicy {
                        max_attempts: 2,
                        backoff: Some(Backoff {
                            initial_ms: 250,
                            multiplier: 2.0,
                        }),
                        transient_retries: 1,
                        timeout_secs: Some(60),
                        escalation: Some("senior-auditor".to_string()),
                    },
                },
            ],
            max_parallel_steps: Some(2),
            timeout_secs: Some(600),
            metadata: HashMap::from([("origin".to_string(), json!("test"))]),
        }
    }

    #[test]
    fn plan_json_roundtrip() {
        let original = sample_plan();
        let json_str = serde_json::to_string_pretty(&original).unwrap();
        let parsed: ExecutionPlan = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.name, "site-audit");
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(parsed.steps[1].requires.len(), 2);
        assert_eq!(parsed.max_parallel_steps, Some(2));
    }

    #[test]
    fn requirement_serde_tagging() {
        let req = Requirement::Artifact {
            name: "page-index".to_string(),
        };
        let json_str = serde_json::to_string(&req).unwrap();
        assert!(json_str.contains("\"type\":\"artifact\""));
        let parsed: Requirement = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn retry_policy_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.transient_retries, 1);
        assert!(policy.backoff.is_none());
        assert!(policy.escalation.is_none());
    }

    #[test]
    fn backoff_default_multiplier() {
        let backoff: Backoff = serde_json::from_str(r#"{"initial_ms": 100}"#).unwrap();
        assert_eq!(backoff.multiplier, 1.0);
    }

    #[test]
    fn gate_spec_defaults() {
        let spec = GateSpec::default();
        assert_eq!(spec.high_threshold, 0);
        assert!(spec.min_confidence.is_none());
        assert!(spec.baseline.is_none());
    }

    #[test]
    fn plan_step_lookup() {
        let plan = sample_plan();
        assert!(plan.step("crawl").is_some());
        assert!(plan.step("missing").is_none());
    }
}
