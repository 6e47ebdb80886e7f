use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The fixed vocabulary of proof-log events. Every pipeline decision with
/// evidentiary value is recorded as one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofEvent {
    Dispatch,
    Evaluate,
    Complete,
    Retry,
    Blocked,
    Failed,
    VerifyPass,
    VerifyFail,
    PrReview,
    Merge,
    Deploy,
    QualityGate,
    Escalate,
    SelfHeal,
    DeliverableVerified,
    AutoRecover,
    Transition,
}

/// An append-only evidence record. Writes are best-effort: a failure to
/// persist a proof-log entry must never propagate up or block a pipeline
/// step (see `foreman::proof_log::record_best_effort`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofLogEntry {
    pub id: i64,
    pub task_id: String,
    pub event: ProofEvent,
    pub stage: String,
    pub decision: String,
    pub evidence: String,
    pub decision_maker: String,
    pub pr_url: Option<String>,
    pub duration_secs: Option<f64>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}
