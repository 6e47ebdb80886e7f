//! The worktree reuse decision table from §4.6.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{commits_ahead, diverged_file_count};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git worktree command failed: {0}")]
    Command(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseDecision {
    /// Worktree present, >=1 commit ahead, <max_diverged_files diverged.
    Reuse,
    /// Worktree present, 0 commits ahead, no open PR.
    DeleteAndRecreate,
    /// Worktree present, 0 commits ahead, open PR exists.
    KeepResetToOriginMain,
    /// No worktree, branch ahead, open PR exists.
    CreateOnExistingBranch,
    /// None of the above.
    CreateFresh,
}

#[derive(Debug, Clone)]
pub struct WorktreePlan {
    pub decision: ReuseDecision,
    pub worktree_path: PathBuf,
    pub branch: String,
}

/// Decide how to provision the worktree for `task_id` on `branch`, given
/// whether a worktree directory already exists at `worktree_path` and
/// whether an open PR already exists for `branch`.
pub fn decide_reuse(
    repo_root: &Path,
    worktree_path: &Path,
    branch: &str,
    worktree_exists: bool,
    open_pr_exists: bool,
    max_diverged_files: usize,
) -> ReuseDecision {
    let ahead = commits_ahead(repo_root, branch);
    if worktree_exists {
        if ahead >= 1 {
            let diverged = diverged_file_count(repo_root, branch);
            if diverged < max_diverged_files {
                return ReuseDecision::Reuse;
            }
            // Heavily diverged: treat like the "no commits" branches below
            // rather than silently reusing a worktree that has drifted too
            // far to trust.
            return if open_pr_exists {
                ReuseDecision::KeepResetToOriginMain
            } else {
                ReuseDecision::DeleteAndRecreate
            };
        }
        return if open_pr_exists {
            ReuseDecision::KeepResetToOriginMain
        } else {
            ReuseDecision::DeleteAndRecreate
        };
    }

    if ahead >= 1 && open_pr_exists {
        return ReuseDecision::CreateOnExistingBranch;
    }

    ReuseDecision::CreateFresh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_worktree_no_branch_creates_fresh() {
        let td = tempfile::tempdir().unwrap();
        let decision = decide_reuse(td.path(), &td.path().join("wt"), "feature/t1", false, false, 50);
        assert_eq!(decision, ReuseDecision::CreateFresh);
    }
}
