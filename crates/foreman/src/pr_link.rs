//! The single source of truth for linking a PR URL to a task (§4.9, §9
//! "Branch-ownership/cross-contamination"). Every path that could attach a
//! PR URL to a task row — the evaluator's fallback discovery, the eager
//! per-task orphan scan, the broad 10-minute sweep, and the lifecycle
//! controller — must flow through `link_pr_to_task`. Validation is
//! mandatory: an unvalidated URL is cleared, never stored.

use foreman_forge::{Forge, PullRequest};
use foreman_git::word_boundary_match;

/// The outcome of attempting to link a PR to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// A validated PR was found and should be persisted.
    Linked { pr_url: String, pr_number: u64 },
    /// No PR referencing this task could be found.
    NotFound,
    /// A candidate was found but failed the word-boundary check; the task's
    /// stored URL (if any) must be cleared rather than left unvalidated.
    Rejected { candidate_url: String },
}

/// Validate that `pr`'s title or head branch references `task_id` with a
/// word-boundary match, so `t195` matches `feature/t195` but not `t1950`.
pub fn validate(pr: &PullRequest, task_id: &str) -> bool {
    word_boundary_match(&pr.title, task_id) || word_boundary_match(&pr.head_branch, task_id)
}

/// Discover a PR for `task_id` on `branch` (or by the `feature/<task_id>`
/// convention if `branch` is `None`) and validate it before linking.
pub fn link_pr_to_task(
    forge: &dyn Forge,
    repo: &str,
    task_id: &str,
    branch: Option<&str>,
) -> anyhow::Result<LinkOutcome> {
    let convention_branch = format!("feature/{task_id}");
    let branch = branch.unwrap_or(&convention_branch);

    let candidates = forge.list_prs_for_branch(repo, branch)?;
    let Some(pr) = candidates.into_iter().next() else {
        return Ok(LinkOutcome::NotFound);
    };

    if validate(&pr, task_id) {
        Ok(LinkOutcome::Linked {
            pr_url: pr.url,
            pr_number: pr.number,
        })
    } else {
        Ok(LinkOutcome::Rejected { candidate_url: pr.url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_forge::{CheckRollup, PullRequestState, ReviewDecision};

    fn pr(title: &str, branch: &str) -> PullRequest {
        PullRequest {
            number: 1,
            url: "https://forge.example/o/r/pull/1".to_string(),
            title: title.to_string(),
            head_branch: branch.to_string(),
            state: PullRequestState::Open,
            draft: false,
            review_decision: ReviewDecision::None,
            checks: CheckRollup { runs: vec![] },
            merge_commit_sha: None,
        }
    }

    #[test]
    fn validate_accepts_word_boundary_match_in_branch() {
        let p = pr("Fix thing", "feature/t195");
        assert!(validate(&p, "t195"));
    }

    #[test]
    fn validate_rejects_prefix_collision() {
        let p = pr("Fix thing", "feature/t1950");
        assert!(!validate(&p, "t195"));
    }

    #[test]
    fn validate_accepts_match_in_title() {
        let p = pr("t300: add retry logic", "some-branch");
        assert!(validate(&p, "t300"));
    }
}
