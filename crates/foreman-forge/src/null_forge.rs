//! A deterministic, in-memory `Forge` test double. Every orchestration test
//! in `foreman` builds one of these rather than touching the network.

use std::sync::Mutex;

use crate::{ForgeError, Forge, PullRequest, ReviewThread, User};

#[derive(Default)]
pub struct NullForge {
    prs: Mutex<Vec<PullRequest>>,
    threads: Mutex<std::collections::HashMap<u64, Vec<ReviewThread>>>,
    user: Mutex<Option<User>>,
    merge_calls: Mutex<Vec<(u64, bool)>>,
}

impl NullForge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pr(self, pr: PullRequest) -> Self {
        self.prs.lock().unwrap().push(pr);
        self
    }

    pub fn with_threads(self, number: u64, threads: Vec<ReviewThread>) -> Self {
        self.threads.lock().unwrap().insert(number, threads);
        self
    }

    pub fn with_user(self, login: &str) -> Self {
        *self.user.lock().unwrap() = Some(User {
            login: login.to_string(),
        });
        self
    }

    pub fn merge_calls(&self) -> Vec<(u64, bool)> {
        self.merge_calls.lock().unwrap().clone()
    }
}

impl Forge for NullForge {
    fn list_prs_for_branch(&self, _repo: &str, branch: &str) -> Result<Vec<PullRequest>, ForgeError> {
        Ok(self
            .prs
            .lock()
            .unwrap()
            .iter()
            .filter(|pr| pr.head_branch == branch)
            .cloned()
            .collect())
    }

    fn view_pr(&self, _repo: &str, number: u64) -> Result<PullRequest, ForgeError> {
        self.prs
            .lock()
            .unwrap()
            .iter()
            .find(|pr| pr.number == number)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(format!("pr #{number}")))
    }

    fn merge_pr(&self, _repo: &str, number: u64, admin: bool) -> Result<(), ForgeError> {
        self.merge_calls.lock().unwrap().push((number, admin));
        let mut prs = self.prs.lock().unwrap();
        if let Some(pr) = prs.iter_mut().find(|pr| pr.number == number) {
            pr.state = crate::PullRequestState::Merged;
            pr.merge_commit_sha = Some(format!("merge-{number}"));
            Ok(())
        } else {
            Err(ForgeError::NotFound(format!("pr #{number}")))
        }
    }

    fn review_threads(&self, _repo: &str, number: u64) -> Result<Vec<ReviewThread>, ForgeError> {
        Ok(self
            .threads
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    fn dismiss_bot_reviews(&self, _repo: &str, _number: u64) -> Result<u32, ForgeError> {
        Ok(0)
    }

    fn create_issue(&self, _repo: &str, _title: &str, _body: &str) -> Result<String, ForgeError> {
        Ok("https://forge.example/o/r/issues/1".to_string())
    }

    fn close_issue(&self, _repo: &str, _url: &str) -> Result<(), ForgeError> {
        Ok(())
    }

    fn authenticated_user(&self) -> Result<User, ForgeError> {
        self.user
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ForgeError::Auth("no user configured in NullForge".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CheckRun, PullRequestState, ReviewDecision};

    fn sample_pr(number: u64, branch: &str) -> PullRequest {
        PullRequest {
            number,
            url: format!("https://forge.example/o/r/pull/{number}"),
            title: format!("fix {branch}"),
            head_branch: branch.to_string(),
            state: PullRequestState::Open,
            draft: false,
            review_decision: ReviewDecision::None,
            checks: CheckRollup {
                runs: vec![CheckRun {
                    name: "ci".to_string(),
                    conclusion: crate::CheckConclusion::Success,
                }],
            },
            merge_commit_sha: None,
        }
    }

    #[test]
    fn list_prs_filters_by_branch() {
        let forge = NullForge::new().with_pr(sample_pr(1, "feature/t1"));
        let prs = forge.list_prs_for_branch("o/r", "feature/t1").unwrap();
        assert_eq!(prs.len(), 1);
        let prs = forge.list_prs_for_branch("o/r", "feature/other").unwrap();
        assert!(prs.is_empty());
    }

    #[test]
    fn merge_pr_updates_state_and_records_call() {
        let forge = NullForge::new().with_pr(sample_pr(1, "feature/t1"));
        forge.merge_pr("o/r", 1, true).unwrap();
        assert_eq!(forge.merge_calls(), vec![(1, true)]);
        let pr = forge.view_pr("o/r", 1).unwrap();
        assert_eq!(pr.state, PullRequestState::Merged);
    }
}
