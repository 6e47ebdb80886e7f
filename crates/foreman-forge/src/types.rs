use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Pending,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub conclusion: CheckConclusion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRollup {
    pub runs: Vec<CheckRun>,
}

impl CheckRollup {
    pub fn all_passed(&self) -> bool {
        self.runs
            .iter()
            .all(|r| matches!(r.conclusion, CheckConclusion::Success | CheckConclusion::Skipped))
    }

    pub fn any_pending(&self) -> bool {
        self.runs.iter().any(|r| matches!(r.conclusion, CheckConclusion::Pending))
    }

    pub fn failing(&self) -> Vec<&CheckRun> {
        self.runs
            .iter()
            .filter(|r| matches!(r.conclusion, CheckConclusion::Failure))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub title: String,
    pub head_branch: String,
    pub state: PullRequestState,
    pub draft: bool,
    pub review_decision: ReviewDecision,
    pub checks: CheckRollup,
    pub merge_commit_sha: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Resolved,
    Unresolved,
    Outdated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewThread {
    pub id: String,
    pub author_login: String,
    pub body: String,
    pub state: ThreadState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub login: String,
}
