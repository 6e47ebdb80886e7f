//! Worktree provisioning and cleanup, already-done detection, and the
//! sibling-rebase/force-push plumbing used by the lifecycle controller.
//!
//! All git interaction shells out to the `git` binary, matching the
//! teacher's `collect_git_context` style (`Command::new("git")...output()`)
//! rather than linking `git2`/libgit2 — the spec's out-of-scope boundary
//! excludes the forge's own client, and the rest of the retrieval corpus
//! that touches git does so the same way.

mod registry;
mod worktree;

pub use registry::{RegistryError, WorktreeRegistry};
pub use worktree::{decide_reuse, ReuseDecision, WorktreeError, WorktreePlan};

use std::path::Path;
use std::process::Command;

fn git_output(repo_root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

fn git_ok(repo_root: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Detect whether `task_id` already has a completed footprint in `main`'s
/// history: a commit message referencing the task id with a word-boundary
/// match. This is the dispatcher's "already-done" pre-flight guard (§4.6).
pub fn already_done_in_history(repo_root: &Path, task_id: &str) -> bool {
    let Some(log) = git_output(
        repo_root,
        &["log", "--oneline", "-n", "500", "main", "--"],
    ) else {
        return false;
    };
    word_boundary_match(&log, task_id)
}

/// Word-boundary containment: `t195` matches `feature/t195` and
/// `fix t195: ...` but never `t1950` (§4.9's validation rule, shared here
/// since both the dispatcher's already-done guard and the PR linker need
/// it).
pub fn word_boundary_match(haystack: &str, needle: &str) -> bool {
    let is_boundary = |c: Option<char>| match c {
        None => true,
        Some(c) => !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'),
    };
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let before = haystack[..abs].chars().next_back();
        let after = haystack[abs + needle.len()..].chars().next();
        if is_boundary(before) && is_boundary(after) {
            return true;
        }
        start = abs + 1;
        if start >= haystack.len() {
            break;
        }
    }
    false
}

/// Count commits on `branch` that are ahead of `main`.
pub fn commits_ahead(repo_root: &Path, branch: &str) -> u32 {
    git_output(
        repo_root,
        &["rev-list", "--count", &format!("main..{branch}")],
    )
    .and_then(|s| s.parse().ok())
    .unwrap_or(0)
}

/// Count files whose content differs between `branch` and `main`.
pub fn diverged_file_count(repo_root: &Path, branch: &str) -> usize {
    git_output(
        repo_root,
        &["diff", "--name-only", &format!("main...{branch}")],
    )
    .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
    .unwrap_or(0)
}

/// Whether the worktree has uncommitted changes (tracked or untracked).
pub fn has_uncommitted_changes(worktree_path: &Path) -> bool {
    git_output(worktree_path, &["status", "--porcelain"])
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

/// Reset `branch`'s contents to `origin/main` and force-push, preserving any
/// open PR's review thread (used both for "0 commits ahead, open PR exists"
/// worktree reuse and for the clean-slate reprompt after
/// `retry:clean_exit_no_signal`).
pub fn reset_branch_to_origin_main(repo_root: &Path, branch: &str) -> bool {
    git_ok(repo_root, &["fetch", "origin", "main"])
        && git_ok(
            repo_root,
            &[
                "push",
                "origin",
                &format!("origin/main:refs/heads/{branch}"),
                "--force",
            ],
        )
}

/// Rebase `branch` onto the current `main` and force-push with lease — the
/// serial-merge guard's sibling-rebase step (§4.8).
pub fn rebase_onto_main_and_push(repo_root: &Path, branch: &str) -> bool {
    git_ok(repo_root, &["fetch", "origin", "main"])
        && git_ok(repo_root, &["checkout", branch])
        && git_ok(repo_root, &["rebase", "origin/main"])
        && git_ok(
            repo_root,
            &["push", "--force-with-lease", "origin", branch],
        )
}

/// Diff of file paths changed between `base` and `head`, used to derive
/// `VERIFY.md` check directives from a merged PR's changed files.
pub fn changed_files(repo_root: &Path, base: &str, head: &str) -> Vec<String> {
    git_output(
        repo_root,
        &["diff", "--name-only", &format!("{base}..{head}")],
    )
    .map(|s| s.lines().map(str::to_string).collect())
    .unwrap_or_default()
}

/// Whether the diff between `base` and `head` touches anything beyond
/// planning/tracking files — the "deliverable verification" check from the
/// glossary.
pub fn has_non_trivial_changes(repo_root: &Path, base: &str, head: &str) -> bool {
    changed_files(repo_root, base, head)
        .iter()
        .any(|f| f != "TODO.md" && !f.starts_with("todo/"))
}
