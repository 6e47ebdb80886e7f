use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The status alphabet a `Task` moves through. Order here is documentation
/// only — legality of a transition is governed entirely by
/// [`VALID_TRANSITIONS`], not by enum declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Dispatched,
    Running,
    Evaluating,
    Retrying,
    Blocked,
    Failed,
    Cancelled,
    Complete,
    PrReview,
    ReviewTriage,
    Merging,
    Merged,
    Deploying,
    Deployed,
    Verifying,
    Verified,
    VerifyFailed,
}

impl TaskStatus {
    /// Terminal states retain history but are never mutated by the pulse
    /// again, except for the self-healer's reset of a `Blocked` parent.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Deployed
                | TaskStatus::Verified
                | TaskStatus::Merged
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Evaluating => "evaluating",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Complete => "complete",
            TaskStatus::PrReview => "pr_review",
            TaskStatus::ReviewTriage => "review_triage",
            TaskStatus::Merging => "merging",
            TaskStatus::Merged => "merged",
            TaskStatus::Deploying => "deploying",
            TaskStatus::Deployed => "deployed",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Verified => "verified",
            TaskStatus::VerifyFailed => "verify_failed",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => TaskStatus::Queued,
            "dispatched" => TaskStatus::Dispatched,
            "running" => TaskStatus::Running,
            "evaluating" => TaskStatus::Evaluating,
            "retrying" => TaskStatus::Retrying,
            "blocked" => TaskStatus::Blocked,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            "complete" => TaskStatus::Complete,
            "pr_review" => TaskStatus::PrReview,
            "review_triage" => TaskStatus::ReviewTriage,
            "merging" => TaskStatus::Merging,
            "merged" => TaskStatus::Merged,
            "deploying" => TaskStatus::Deploying,
            "deployed" => TaskStatus::Deployed,
            "verifying" => TaskStatus::Verifying,
            "verified" => TaskStatus::Verified,
            "verify_failed" => TaskStatus::VerifyFailed,
            _ => return None,
        })
    }

    /// Transitions representing a pipeline stage, which earn a proof-log
    /// entry. Micro-transitions (e.g. `running -> evaluating`) do not.
    pub fn is_significant_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            to,
            TaskStatus::Dispatched
                | TaskStatus::PrReview
                | TaskStatus::ReviewTriage
                | TaskStatus::Merging
                | TaskStatus::Merged
                | TaskStatus::Deploying
                | TaskStatus::Deployed
                | TaskStatus::Verifying
                | TaskStatus::Verified
                | TaskStatus::VerifyFailed
        ) || from == to
    }
}

/// The fixed whitelist of legal `(from, to)` edges. Anything not listed here
/// is rejected by the state machine with an error naming the legal next
/// states for `from`.
pub const VALID_TRANSITIONS: &[(TaskStatus, TaskStatus)] = {
    use TaskStatus::*;
    &[
        (Queued, Dispatched),
        (Queued, Cancelled),
        (Queued, Blocked),
        (Dispatched, Running),
        (Dispatched, Failed),
        (Dispatched, Cancelled),
        (Running, Evaluating),
        (Running, Cancelled),
        (Running, Failed),
        (Evaluating, Complete),
        (Evaluating, Retrying),
        (Evaluating, Blocked),
        (Evaluating, Failed),
        (Retrying, Queued),
        (Retrying, Blocked),
        (Retrying, Cancelled),
        (Blocked, Queued),
        (Blocked, Cancelled),
        (Failed, Queued),
        (Failed, Cancelled),
        (Complete, PrReview),
        (Complete, Deployed),
        (Complete, Cancelled),
        (PrReview, PrReview),
        (PrReview, ReviewTriage),
        (PrReview, Merging),
        (PrReview, Merged),
        (PrReview, Blocked),
        (PrReview, Dispatched),
        (PrReview, Cancelled),
        (ReviewTriage, Merging),
        (ReviewTriage, Blocked),
        (ReviewTriage, Dispatched),
        (ReviewTriage, Cancelled),
        (Merging, Merged),
        (Merging, Blocked),
        (Merging, PrReview),
        (Merged, Deploying),
        (Merged, Deployed),
        (Merged, Cancelled),
        (Deploying, Deployed),
        (Deploying, Blocked),
        (Deploying, Deploying),
        (Deployed, Verifying),
        (Deployed, Cancelled),
        (Verifying, Verified),
        (Verifying, VerifyFailed),
        (VerifyFailed, Verifying),
        (VerifyFailed, Cancelled),
    ]
};

/// An append-only row recording one status change. Never mutated or
/// deleted once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLogEntry {
    pub id: i64,
    pub task_id: String,
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
