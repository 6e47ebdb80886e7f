//! The post-PR pipeline (§4.8): `complete -> pr_review -> review_triage ->
//! merging -> merged -> deploying -> deployed -> verifying -> verified`.
//! Each stage is its own function taking the [`Supervisor`] and the task,
//! returning the decision it reached — `pulse.rs` is the only caller, and
//! it's the one place responsible for turning a decision into an actual
//! `Store::transition` plus any side-band bookkeeping shared across stages
//! (the serial-merge guard lives in [`PulseState`]).

use std::path::Path;

use foreman_store::TransitionFields;
use foreman_types::{ProofEvent, Task, TaskStatus};

use crate::pr_link::{link_pr_to_task, LinkOutcome};
use crate::supervisor::{PulseState, Supervisor};
use crate::todo_registry;
use crate::verify_queue::{self, Directive};

/// Bot login patterns recognised for auto-dismissal (§4.8 step 2) and
/// excluded from blocking a merge on `changes_requested`.
const BOT_LOGIN_PATTERNS: &[&str] = &["[bot]", "-bot", "dependabot", "renovate", "coderabbit", "sonarcloud"];

fn is_bot_login(login: &str) -> bool {
    let lower = login.to_lowercase();
    BOT_LOGIN_PATTERNS.iter().any(|p| lower.contains(p))
}

/// §4.8 step 1: `complete -> pr_review`, or straight to `deployed` if no PR
/// was ever opened for this task.
pub fn advance_complete(sup: &Supervisor, task: &Task) -> anyhow::Result<()> {
    if task.pr_url.is_some() {
        sup.store.transition(&task.id, TaskStatus::PrReview, None, TransitionFields::default())?;
        return Ok(());
    }

    let repo = repo_slug(&sup.repo_root);
    match link_pr_to_task(sup.forge.as_ref(), &repo, &task.id, task.branch.as_deref())? {
        LinkOutcome::Linked { pr_url, .. } => {
            sup.store.transition(
                &task.id,
                TaskStatus::PrReview,
                Some("pr_discovered"),
                TransitionFields { pr_url: Some(pr_url), ..Default::default() },
            )?;
        }
        LinkOutcome::NotFound | LinkOutcome::Rejected { .. } => {
            sup.store.transition(&task.id, TaskStatus::Deployed, Some("no_pr_opened"), TransitionFields::default())?;
        }
    }
    Ok(())
}

/// The decision reached for a task sitting in `pr_review`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrReviewDecision {
    StayInReview,
    AlreadyMerged,
    Blocked { reason: String },
    ReadyForTriage,
    ReadyToMerge,
    UnstableButGreen,
    RetryReviewFix,
    PromoteDraft,
}

/// §4.8 step 2. `worker_alive` tells the draft/auto-promote branch whether
/// the spawning worker process is still running.
pub fn decide_pr_review(pr: &foreman_forge::PullRequest, worker_alive: bool, admin_overridable_checks: &[String]) -> PrReviewDecision {
    use foreman_forge::{CheckConclusion, PullRequestState, ReviewDecision};

    if pr.state == PullRequestState::Merged {
        return PrReviewDecision::AlreadyMerged;
    }
    if pr.state == PullRequestState::Closed {
        return PrReviewDecision::Blocked { reason: "pr_closed_without_merge".to_string() };
    }
    if pr.draft {
        return if worker_alive {
            PrReviewDecision::StayInReview
        } else {
            // The worker that opened this draft has already exited; nothing
            // will ever mark it ready for review, so promote it ourselves.
            PrReviewDecision::PromoteDraft
        };
    }
    if pr.checks.any_pending() {
        return PrReviewDecision::StayInReview;
    }

    let failing = pr.checks.failing();
    if !failing.is_empty() {
        let only_overridable = failing
            .iter()
            .all(|c| admin_overridable_checks.iter().any(|name| c.name.to_lowercase().contains(&name.to_lowercase())));
        let mainline_passed = pr
            .checks
            .runs
            .iter()
            .any(|c| c.name.to_lowercase().contains("quality") && matches!(c.conclusion, CheckConclusion::Success));
        if only_overridable && mainline_passed {
            return PrReviewDecision::UnstableButGreen;
        }
        return PrReviewDecision::Blocked { reason: "ci_failed".to_string() };
    }

    if pr.review_decision == ReviewDecision::ChangesRequested {
        return PrReviewDecision::Blocked { reason: "changes_requested_by_human".to_string() };
    }

    PrReviewDecision::ReadyForTriage
}

/// Severity classification for one review thread (§4.8 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadSeverity {
    Dismiss,
    Low,
    Medium,
    High,
    Critical,
}

const CRITICAL_PATTERNS: &[&str] = &["security vulnerability", "sql injection", "data loss", "credential", "must fix before merge"];
const HIGH_PATTERNS: &[&str] = &["bug", "incorrect", "race condition", "panic", "crash"];
const MEDIUM_PATTERNS: &[&str] = &["consider", "nit", "could be cleaner", "style"];
const DISMISS_PATTERNS: &[&str] = &["lgtm", "looks good", "resolved", "nevermind"];

pub fn classify_thread(thread: &foreman_forge::ReviewThread) -> ThreadSeverity {
    let body = thread.body.to_lowercase();
    if DISMISS_PATTERNS.iter().any(|p| body.contains(p)) {
        return ThreadSeverity::Dismiss;
    }
    if CRITICAL_PATTERNS.iter().any(|p| body.contains(p)) {
        return ThreadSeverity::Critical;
    }
    if HIGH_PATTERNS.iter().any(|p| body.contains(p)) {
        return ThreadSeverity::High;
    }
    if MEDIUM_PATTERNS.iter().any(|p| body.contains(p)) {
        return ThreadSeverity::Medium;
    }
    ThreadSeverity::Low
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriageAction {
    ReadyToMerge,
    SpawnReviewFixWorker { thread_ids: Vec<String> },
    Blocked,
}

/// Summarise unresolved, non-outdated threads to one batch action.
pub fn triage_threads(threads: &[foreman_forge::ReviewThread]) -> TriageAction {
    use foreman_forge::ThreadState;

    let actionable: Vec<&foreman_forge::ReviewThread> =
        threads.iter().filter(|t| t.state == ThreadState::Unresolved).collect();

    let mut highest = ThreadSeverity::Dismiss;
    let mut medium_or_above = Vec::new();
    for thread in &actionable {
        let severity = classify_thread(thread);
        if severity >= ThreadSeverity::Medium {
            medium_or_above.push(thread.id.clone());
        }
        if severity > highest {
            highest = severity;
        }
    }

    if highest == ThreadSeverity::Critical {
        return TriageAction::Blocked;
    }
    if highest >= ThreadSeverity::Medium {
        return TriageAction::SpawnReviewFixWorker { thread_ids: medium_or_above };
    }
    TriageAction::ReadyToMerge
}

/// §4.8 step 4: defense-in-depth re-validation, then squash-merge.
pub fn advance_merging(
    sup: &Supervisor,
    pulse: &mut PulseState,
    task: &Task,
    pr_number: u64,
    admin_override: bool,
) -> anyhow::Result<bool> {
    if pulse.already_merged_this_pulse(&task.parent_prefix_owned()) {
        // A sibling already merged this pulse; defer to the next one so CI
        // re-runs on the rebased commits.
        return Ok(false);
    }

    let repo = repo_slug(&sup.repo_root);
    let pr = sup.forge.view_pr(&repo, pr_number)?;
    if !crate::pr_link::validate(&pr, &task.id) {
        sup.store.transition(
            &task.id,
            TaskStatus::Blocked,
            Some("merge_revalidation_failed"),
            TransitionFields::default(),
        )?;
        return Ok(false);
    }

    sup.forge.merge_pr(&repo, pr_number, admin_override)?;
    sup.store.transition(&task.id, TaskStatus::Merged, Some("squash_merged"), TransitionFields::default())?;
    sup.store.record_proof(
        &task.id,
        ProofEvent::Merge,
        "merging",
        "merged",
        &format!("pr #{pr_number}, admin={admin_override}"),
        "lifecycle",
        task.pr_url.as_deref(),
        None,
    )?;
    pulse.mark_merged(&task.parent_prefix_owned());

    for sibling in sup.store.siblings_of(task)? {
        if let Some(branch) = &sibling.branch {
            foreman_git::rebase_onto_main_and_push(&sup.repo_root, branch);
        }
    }

    Ok(true)
}

/// §4.8 step 5: `merged` post-flight. Fast-forwards local `main` to the
/// just-merged commit and routes to `deploying` (self-deploying repos) or
/// straight to `deployed` (everything else skips a deploy step entirely).
pub fn advance_merged(sup: &Supervisor, task: &Task) -> anyhow::Result<()> {
    let pulled = foreman_process::run_with_timeout(
        "git",
        &["pull", "--ff-only", "origin", "main"],
        &sup.repo_root,
        None,
    );
    let confirmed = pulled.is_ok_and(|out| out.exit_code == 0) && !foreman_git::has_uncommitted_changes(&sup.repo_root);
    if !confirmed {
        sup.store.transition(&task.id, TaskStatus::Blocked, Some("post_merge_ff_failed"), TransitionFields::default())?;
        return Ok(());
    }

    let next = if is_self_deploying_repo(
        &sup.repo_root,
        &sup.config.lifecycle.self_deploying_marker_file,
        &sup.config.lifecycle.self_deploying_marker_string,
    ) {
        TaskStatus::Deploying
    } else {
        TaskStatus::Deployed
    };
    sup.store.transition(&task.id, next, Some("post_merge_ff_confirmed"), TransitionFields::default())?;
    Ok(())
}

/// §4.8 step 6: `deploying`. Runs the repo's own deploy entrypoint —
/// targeted to the changed paths when the deploy script accepts a path
/// argument, a full deploy otherwise — under the configured timeout. A
/// deploy still running past `stuck_deploying_recovery` is treated as a
/// crashed previous attempt and retried from scratch, not left to hang.
pub fn advance_deploying(sup: &Supervisor, task: &Task) -> anyhow::Result<bool> {
    if deploy_is_stuck(task, sup.config.lifecycle.stuck_deploying_recovery) {
        sup.store.record_proof(
            &task.id,
            ProofEvent::Deploy,
            "deploying",
            "stuck_recovery",
            "previous deploy attempt exceeded the recovery threshold, replaying",
            "lifecycle",
            None,
            None,
        )?;
    }

    let changed = task.branch.as_deref().map(|b| foreman_git::changed_files(&sup.repo_root, "main", b)).unwrap_or_default();
    let args: Vec<&str> = if changed.len() <= 5 && !changed.is_empty() {
        changed.iter().map(String::as_str).collect()
    } else {
        vec![]
    };

    let result = foreman_process::run_with_timeout(
        "./deploy.sh",
        &args,
        &sup.repo_root,
        Some(sup.config.lifecycle.deploy_timeout),
    );

    match result {
        Ok(out) if out.exit_code == 0 && !out.timed_out => {
            sup.store.transition(&task.id, TaskStatus::Deployed, Some("deploy_succeeded"), TransitionFields::default())?;
            Ok(true)
        }
        Ok(out) if out.timed_out => {
            // Stay in `deploying`; the stuck-recovery check above will replay
            // it once `stuck_deploying_recovery` has elapsed.
            let _ = out;
            Ok(false)
        }
        _ => {
            sup.store.transition(&task.id, TaskStatus::Blocked, Some("deploy_failed"), TransitionFields::default())?;
            Ok(false)
        }
    }
}

/// §4.8 step 6: is `repo_root` a "self-deploying" repository.
pub fn is_self_deploying_repo(repo_root: &Path, marker_file: &str, marker_string: &str) -> bool {
    let path = repo_root.join(marker_file);
    if path.exists() {
        return true;
    }
    let setup = repo_root.join("setup.sh");
    std::fs::read_to_string(setup).is_ok_and(|s| s.contains(marker_string))
}

/// §4.8 "auto-recovered on the next pulse": a task stuck in `deploying`
/// longer than `recovery_threshold` since its last update is replayed.
pub fn deploy_is_stuck(task: &Task, recovery_threshold: std::time::Duration) -> bool {
    if task.status != TaskStatus::Deploying {
        return false;
    }
    let elapsed = chrono::Utc::now() - task.updated_at;
    elapsed.to_std().map(|d| d > recovery_threshold).unwrap_or(false)
}

/// §4.8 step 7: `deployed` housekeeping — worktree cleanup, `TODO.md`
/// flip, and a fresh `VERIFY.md` entry. Returns the directive chosen for
/// the new entry so callers can log it.
pub fn advance_deployed(sup: &Supervisor, task: &Task) -> anyhow::Result<Directive> {
    if let Some(worktree) = &task.worktree {
        let registry = foreman_git::WorktreeRegistry::new(sup.registry_dir());
        if registry.authorize_cleanup(worktree, &sup.identity).is_ok() {
            let _ = std::process::Command::new("git")
                .args(["worktree", "remove", "--force", &worktree.to_string_lossy()])
                .current_dir(&sup.repo_root)
                .status();
            registry.forget(worktree);
        }
    }

    let todo_path = sup.repo_root.join("TODO.md");
    let content = std::fs::read_to_string(&todo_path).unwrap_or_default();
    if let Some(updated) = todo_registry::mark_done(&content, &task.id) {
        std::fs::write(&todo_path, &updated)?;
        todo_registry::commit_and_push(&sup.repo_root, &format!("deployed: {}", task.id));
    }

    let directive = derive_verify_directive(&sup.repo_root, task.branch.as_deref());
    let verify_path = sup.repo_root.join("todo").join("VERIFY.md");
    if let Some(parent) = verify_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let verify_content = std::fs::read_to_string(&verify_path).unwrap_or_default();
    let updated = verify_queue::append_entry(&verify_content, &task.id, directive.clone());
    std::fs::write(&verify_path, updated)?;

    sup.store.transition(&task.id, TaskStatus::Verifying, None, TransitionFields::default())?;
    Ok(directive)
}

/// Pick a `VERIFY.md` directive from the PR's changed files: `shellcheck`
/// for shell scripts, `rg` for index files, `file-exists` otherwise.
fn derive_verify_directive(repo_root: &Path, branch: Option<&str>) -> Directive {
    let Some(branch) = branch else {
        return Directive::FileExists("README.md".to_string());
    };
    let changed = foreman_git::changed_files(repo_root, "main", branch);
    if let Some(shell_file) = changed.iter().find(|f| f.ends_with(".sh")) {
        return Directive::Shellcheck(shell_file.clone());
    }
    if let Some(index_file) = changed.iter().find(|f| f.ends_with("index.ts") || f.ends_with("mod.rs") || f.ends_with("lib.rs")) {
        return Directive::Grep(format!("\"{index_file}\""));
    }
    changed
        .first()
        .map(|f| Directive::FileExists(f.clone()))
        .unwrap_or_else(|| Directive::FileExists("README.md".to_string()))
}

/// §4.8 step 8: run every pending directive for `task_id`, transition to
/// `verified` if all pass, `verify_failed` otherwise.
pub fn advance_verifying(sup: &Supervisor, task: &Task, timeout: std::time::Duration) -> anyhow::Result<bool> {
    let verify_path = sup.repo_root.join("todo").join("VERIFY.md");
    let content = std::fs::read_to_string(&verify_path).unwrap_or_default();
    let entries: Vec<_> = verify_queue::parse_all(&content).into_iter().filter(|e| e.task_id == task.id && !e.done).collect();

    let mut all_passed = true;
    let mut updated = content;
    for entry in &entries {
        let result = verify_queue::run_directive(&sup.repo_root, &entry.directive, timeout);
        if result == crate::verify_queue::VerifyResult::Passed {
            if let Some(marked) = verify_queue::mark_verified(&updated, &task.id) {
                updated = marked;
            }
        } else {
            all_passed = false;
        }
    }
    std::fs::write(&verify_path, &updated)?;

    let to = if all_passed { TaskStatus::Verified } else { TaskStatus::VerifyFailed };
    sup.store.transition(&task.id, to, None, TransitionFields::default())?;
    Ok(all_passed)
}

fn repo_slug(repo_root: &Path) -> String {
    repo_root.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

trait ParentPrefixOwned {
    fn parent_prefix_owned(&self) -> String;
}

impl ParentPrefixOwned for Task {
    fn parent_prefix_owned(&self) -> String {
        self.parent_prefix().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_forge::{CheckConclusion, CheckRollup, CheckRun, PullRequest, PullRequestState, ReviewDecision, ReviewThread, ThreadState};
    use std::path::PathBuf;

    fn pr(state: PullRequestState, draft: bool, checks: Vec<(&str, CheckConclusion)>, review: ReviewDecision) -> PullRequest {
        PullRequest {
            number: 1,
            url: "https://forge.example/o/r/pull/1".to_string(),
            title: "t1: fix".to_string(),
            head_branch: "feature/t1".to_string(),
            state,
            draft,
            review_decision: review,
            checks: CheckRollup {
                runs: checks.into_iter().map(|(n, c)| CheckRun { name: n.to_string(), conclusion: c }).collect(),
            },
            merge_commit_sha: None,
        }
    }

    #[test]
    fn merged_upstream_fast_forwards() {
        let p = pr(PullRequestState::Merged, false, vec![], ReviewDecision::None);
        assert_eq!(decide_pr_review(&p, true, &[]), PrReviewDecision::AlreadyMerged);
    }

    #[test]
    fn closed_without_merge_blocks() {
        let p = pr(PullRequestState::Closed, false, vec![], ReviewDecision::None);
        assert_eq!(
            decide_pr_review(&p, true, &[]),
            PrReviewDecision::Blocked { reason: "pr_closed_without_merge".to_string() }
        );
    }

    #[test]
    fn pending_ci_stays_in_review() {
        let p = pr(PullRequestState::Open, false, vec![("build", CheckConclusion::Pending)], ReviewDecision::None);
        assert_eq!(decide_pr_review(&p, true, &[]), PrReviewDecision::StayInReview);
    }

    #[test]
    fn draft_with_live_worker_stays_in_review() {
        let p = pr(PullRequestState::Open, true, vec![], ReviewDecision::None);
        assert_eq!(decide_pr_review(&p, true, &[]), PrReviewDecision::StayInReview);
    }

    #[test]
    fn draft_with_dead_worker_is_promoted() {
        let p = pr(PullRequestState::Open, true, vec![], ReviewDecision::None);
        assert_eq!(decide_pr_review(&p, false, &[]), PrReviewDecision::PromoteDraft);
    }

    #[test]
    fn unstable_sonarcloud_overridable_when_mainline_quality_gate_passed() {
        let p = pr(
            PullRequestState::Open,
            false,
            vec![
                ("quality-gate", CheckConclusion::Success),
                ("sonarcloud", CheckConclusion::Failure),
            ],
            ReviewDecision::None,
        );
        assert_eq!(
            decide_pr_review(&p, true, &["sonarcloud".to_string()]),
            PrReviewDecision::UnstableButGreen
        );
    }

    #[test]
    fn unrelated_check_failure_blocks() {
        let p = pr(PullRequestState::Open, false, vec![("build", CheckConclusion::Failure)], ReviewDecision::None);
        assert_eq!(
            decide_pr_review(&p, true, &["sonarcloud".to_string()]),
            PrReviewDecision::Blocked { reason: "ci_failed".to_string() }
        );
    }

    #[test]
    fn green_ci_changes_requested_blocks() {
        let p = pr(PullRequestState::Open, false, vec![("build", CheckConclusion::Success)], ReviewDecision::ChangesRequested);
        assert_eq!(
            decide_pr_review(&p, true, &[]),
            PrReviewDecision::Blocked { reason: "changes_requested_by_human".to_string() }
        );
    }

    #[test]
    fn green_ci_no_reviews_ready_for_triage() {
        let p = pr(PullRequestState::Open, false, vec![("build", CheckConclusion::Success)], ReviewDecision::None);
        assert_eq!(decide_pr_review(&p, true, &[]), PrReviewDecision::ReadyForTriage);
    }

    fn thread(body: &str, state: ThreadState) -> ReviewThread {
        ReviewThread {
            id: format!("thread-{}", body.len()),
            author_login: "reviewer".to_string(),
            body: body.to_string(),
            state,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn no_unresolved_threads_merges() {
        assert_eq!(triage_threads(&[]), TriageAction::ReadyToMerge);
    }

    #[test]
    fn only_low_severity_merges() {
        let threads = vec![thread("formatting nit here", ThreadState::Unresolved)];
        assert_eq!(triage_threads(&threads), TriageAction::ReadyToMerge);
    }

    #[test]
    fn medium_severity_spawns_review_fix_worker() {
        let threads = vec![thread("nit: consider renaming this", ThreadState::Unresolved)];
        assert_eq!(
            triage_threads(&threads),
            TriageAction::SpawnReviewFixWorker { thread_ids: vec!["thread-24".to_string()] }
        );
    }

    #[test]
    fn critical_severity_blocks_even_with_other_medium_threads() {
        let threads = vec![
            thread("consider cleanup", ThreadState::Unresolved),
            thread("security vulnerability: sql injection here", ThreadState::Unresolved),
        ];
        assert_eq!(triage_threads(&threads), TriageAction::Blocked);
    }

    #[test]
    fn resolved_threads_are_excluded_from_triage() {
        let threads = vec![thread("security vulnerability", ThreadState::Resolved)];
        assert_eq!(triage_threads(&threads), TriageAction::ReadyToMerge);
    }

    #[test]
    fn self_deploying_repo_detected_by_marker_file() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(td.path().join(".foreman")).unwrap();
        std::fs::write(td.path().join(".foreman/self-deploying"), "").unwrap();
        assert!(is_self_deploying_repo(td.path(), ".foreman/self-deploying", "# foreman:self-deploying"));
    }

    #[test]
    fn self_deploying_repo_detected_by_setup_script_marker() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("setup.sh"), "#!/bin/bash\n# foreman:self-deploying\n").unwrap();
        assert!(is_self_deploying_repo(td.path(), ".foreman/self-deploying", "# foreman:self-deploying"));
    }

    #[test]
    fn non_self_deploying_repo_is_not_detected() {
        let td = tempfile::tempdir().unwrap();
        assert!(!is_self_deploying_repo(td.path(), ".foreman/self-deploying", "# foreman:self-deploying"));
    }

    #[test]
    fn deploy_not_stuck_when_recently_updated() {
        let t = Task::new("t1", PathBuf::from("/repo"), "desc");
        let mut t = t;
        t.status = TaskStatus::Deploying;
        assert!(!deploy_is_stuck(&t, std::time::Duration::from_secs(600)));
    }

    #[test]
    fn deploy_stuck_ignores_non_deploying_tasks() {
        let t = Task::new("t1", PathBuf::from("/repo"), "desc");
        assert!(!deploy_is_stuck(&t, std::time::Duration::from_secs(0)));
    }
}
