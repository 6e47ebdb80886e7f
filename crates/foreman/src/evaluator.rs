//! The four-tier outcome classifier (§4.7). `classify_outcome` is the pure,
//! side-effect-free core (tiers 0.5-2.5 in the distilled numbering, tier 0
//! is handled upstream by `log_summary::check_presence`); it is grounded
//! directly on the teacher's `classify_cargo_failure` idiom — a fixed-order
//! array of `(pattern-set, verdict)` pairs evaluated over a lower-cased
//! haystack with `patterns.iter().any(|p| hay.contains(p))`. Tier 3 (the AI
//! evaluator) is a separate trait so this module stays unit-testable
//! without a live model call.

use std::time::Duration;

use foreman_process::run_with_timeout;
use foreman_types::{Outcome, Task};

use crate::log_summary::LogSummary;

/// Git-state tie-breaks the evaluator needs for tier 2.5, sampled once per
/// evaluation from the worktree rather than re-shelling out per tier.
#[derive(Debug, Clone, Default)]
pub struct GitState {
    pub commits_ahead: u32,
    pub pr_url: Option<String>,
    pub has_uncommitted_changes: bool,
}

const BACKEND_INFRA_PATTERNS: &[&str] = &[
    "internal server error",
    "502 bad gateway",
    "503 service unavailable",
    "connection reset",
    "endpoint_failed",
];
const CREDITS_EXHAUSTED_PATTERNS: &[&str] =
    &["credits exhausted", "insufficient credits", "payment required", "invalid api key"];
const QUOTA_PATTERNS: &[&str] = &["quota exceeded", "resource_exhausted"];
const AUTH_PATTERNS: &[&str] = &["authentication failed", "401 unauthorized", "permission denied"];
const MERGE_CONFLICT_PATTERNS: &[&str] = &["merge conflict", "conflict markers", "automatic merge failed"];
const OOM_PATTERNS: &[&str] = &["out of memory", "oom killed", "cannot allocate memory"];
const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "429 too many requests", "rate_limit_exceeded"];
const TIMEOUT_PATTERNS: &[&str] = &["timed out", "deadline exceeded", "timeout"];
const TASK_OBSOLETE_PATTERNS: &[&str] = &["already done", "no changes needed", "nothing to fix"];

/// Known signal-derived exit codes: `128 + signal`. 130 = SIGINT, 137 =
/// SIGKILL, 143 = SIGTERM.
const SIGNAL_EXIT_CODES: &[(i32, &str)] = &[(130, "interrupted_sigint"), (137, "interrupted_sigkill"), (143, "interrupted_sigterm")];

/// The pure classifier core. `tail_window` is `EvaluatorConfig::tail_lines_for_heuristics`.
pub fn classify_outcome(task: &Task, summary: &LogSummary, git: &GitState, tail_window: usize) -> Outcome {
    // Tier 1 — deterministic completion signals.
    if summary.full_loop_complete {
        return Outcome::complete(summary.pr_url().unwrap_or_else(|| "no_pr".to_string()));
    }
    if summary.task_complete && summary.exit_code == Some(0) {
        return Outcome::complete(summary.pr_url().unwrap_or_else(|| "task_only".to_string()));
    }
    if summary.exit_code == Some(0) {
        if let Some(pr_url) = summary.pr_url() {
            return Outcome::complete(pr_url);
        }
    }

    // Tier 1.5 — exit 0 but the backend actually rejected the call.
    if summary.exit_code == Some(0) {
        if summary.tail_contains_any(tail_window, CREDITS_EXHAUSTED_PATTERNS) {
            return Outcome::blocked("billing_credits_exhausted");
        }
        if summary.tail_contains_any(tail_window, QUOTA_PATTERNS)
            || summary.tail_contains_any(tail_window, &["503"])
            || summary.tail_contains_any(tail_window, &["endpoint_failed"])
        {
            return Outcome::retry("backend_quota_error");
        }
    }

    // Tier 1.6 — the worker decided there was nothing to do.
    if summary.exit_code == Some(0) && summary.tail_contains_any(tail_window, TASK_OBSOLETE_PATTERNS) {
        return Outcome::complete("task_obsolete");
    }

    // Tier 1.7 — clean exit, no signal, no PR: likely exhausted context.
    if summary.exit_code == Some(0) {
        return Outcome::retry("clean_exit_no_signal");
    }

    // Tier 2 — heuristic error patterns, non-zero exit only. Clean exits
    // never reach here: tool output discussing errors as content would
    // otherwise produce false positives.
    if summary.tail_contains_any(tail_window, BACKEND_INFRA_PATTERNS) {
        return Outcome::retry("backend_infrastructure_error");
    }
    if summary.tail_contains_any(tail_window, AUTH_PATTERNS) {
        return Outcome::blocked("auth_error");
    }
    if summary.tail_contains_any(tail_window, MERGE_CONFLICT_PATTERNS) {
        return Outcome::blocked("merge_conflict");
    }
    if summary.tail_contains_any(tail_window, OOM_PATTERNS) {
        return Outcome::blocked("out_of_memory");
    }
    if summary.tail_contains_any(tail_window, RATE_LIMIT_PATTERNS) {
        return Outcome::retry("rate_limited");
    }
    if summary.tail_contains_any(tail_window, TIMEOUT_PATTERNS) {
        return Outcome::retry("timeout");
    }
    if let Some(exit_code) = summary.exit_code {
        if let Some((_, label)) = SIGNAL_EXIT_CODES.iter().find(|(code, _)| *code == exit_code) {
            return Outcome::retry(*label);
        }
    }

    // Tier 2.5 — git heuristic, only if retries remain.
    if task.retries < task.max_retries {
        if git.commits_ahead >= 1 {
            if let Some(pr_url) = &git.pr_url {
                return Outcome::complete(pr_url.clone());
            }
            return Outcome::complete("task_only");
        }
        if git.has_uncommitted_changes {
            return Outcome::retry("work_in_progress");
        }
    }

    // Tier 3 is dispatched by the caller via `AiEvaluator`; this function
    // only returns a placeholder the caller is expected to override.
    Outcome::retry("ambiguous_needs_ai_tier")
}

/// Tier 3: a short prompt to a cheap model, parsed strictly against
/// `VERDICT:<type>:<detail>`. Kept behind a trait so `classify_outcome`
/// itself never makes a network call.
pub trait AiEvaluator: Send + Sync {
    fn evaluate(&self, task: &Task, log_tail: &str) -> anyhow::Result<Outcome>;
}

/// Parse a `VERDICT:<type>:<detail>` line, the only format tier 3 accepts.
pub fn parse_ai_verdict(response: &str) -> Option<Outcome> {
    let line = response.lines().find(|l| l.trim_start().starts_with("VERDICT:"))?;
    let rest = line.trim_start().strip_prefix("VERDICT:")?;
    rest.parse().ok()
}

/// The concrete tier-3 fallback: shell out to the worker CLI's own
/// evaluate subcommand with the ambiguous log tail, parse its stdout with
/// [`parse_ai_verdict`]. Any failure to reach the model or parse its
/// answer degrades to `retry:ambiguous_ai_unavailable` rather than
/// propagating, since tier 3 is already the last resort.
pub struct CliAiEvaluator {
    pub model: String,
    pub timeout: Duration,
}

impl AiEvaluator for CliAiEvaluator {
    fn evaluate(&self, task: &Task, log_tail: &str) -> anyhow::Result<Outcome> {
        let cwd = task.worktree.clone().unwrap_or_else(|| task.repo_root.clone());
        let output = run_with_timeout(
            "worker",
            &["--evaluate", "--model", &self.model, log_tail],
            &cwd,
            Some(self.timeout),
        );
        let verdict = match output {
            Ok(out) if !out.timed_out => parse_ai_verdict(&out.stdout),
            _ => None,
        };
        Ok(verdict.unwrap_or_else(|| Outcome::retry("ambiguous_ai_unavailable")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn task() -> Task {
        let mut t = Task::new("t1", PathBuf::from("/repo"), "desc");
        t.max_retries = 3;
        t
    }

    fn summary_with_exit(code: i32, tail: &[&str]) -> LogSummary {
        LogSummary {
            worker_started: true,
            exit_code: Some(code),
            tail_lines: tail.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn full_loop_complete_wins_regardless_of_exit_code() {
        let mut summary = summary_with_exit(1, &[]);
        summary.full_loop_complete = true;
        let outcome = classify_outcome(&task(), &summary, &GitState::default(), 20);
        assert_eq!(outcome, Outcome::complete("no_pr"));
    }

    #[test]
    fn credits_exhausted_blocks_permanently() {
        let summary = summary_with_exit(0, &["error: insufficient credits on account"]);
        let outcome = classify_outcome(&task(), &summary, &GitState::default(), 20);
        assert_eq!(outcome, Outcome::blocked("billing_credits_exhausted"));
    }

    #[test]
    fn quota_exceeded_retries_not_blocks() {
        let summary = summary_with_exit(0, &["quota exceeded for this billing period"]);
        let outcome = classify_outcome(&task(), &summary, &GitState::default(), 20);
        assert_eq!(outcome, Outcome::retry("backend_quota_error"));
    }

    #[test]
    fn task_obsolete_short_circuits_before_clean_exit_retry() {
        let summary = summary_with_exit(0, &["nothing to fix here, already done"]);
        let outcome = classify_outcome(&task(), &summary, &GitState::default(), 20);
        assert_eq!(outcome, Outcome::complete("task_obsolete"));
    }

    #[test]
    fn clean_exit_no_signal_is_default_zero_exit_retry() {
        let summary = summary_with_exit(0, &["did some stuff"]);
        let outcome = classify_outcome(&task(), &summary, &GitState::default(), 20);
        assert_eq!(outcome, Outcome::retry("clean_exit_no_signal"));
    }

    #[test]
    fn nonzero_exit_with_error_content_never_falls_through_on_zero_exit() {
        // A clean exit that merely *discusses* errors in passing must not
        // trigger tier 2: tier 2 only fires on a non-zero exit code.
        let summary = summary_with_exit(0, &["the docs mention merge conflict resolution tips"]);
        let outcome = classify_outcome(&task(), &summary, &GitState::default(), 20);
        assert_eq!(outcome, Outcome::retry("clean_exit_no_signal"));
    }

    #[test]
    fn merge_conflict_on_nonzero_exit_blocks() {
        let summary = summary_with_exit(1, &["fatal: merge conflict in src/lib.rs"]);
        let outcome = classify_outcome(&task(), &summary, &GitState::default(), 20);
        assert_eq!(outcome, Outcome::blocked("merge_conflict"));
    }

    #[test]
    fn signal_exit_code_retries_as_interrupted() {
        let summary = summary_with_exit(137, &[]);
        let outcome = classify_outcome(&task(), &summary, &GitState::default(), 20);
        assert_eq!(outcome, Outcome::retry("interrupted_sigkill"));
    }

    #[test]
    fn git_heuristic_completes_when_commits_ahead_with_pr() {
        let summary = summary_with_exit(1, &["some unrecognized error"]);
        let git = GitState {
            commits_ahead: 2,
            pr_url: Some("https://forge.example/o/r/pull/9".to_string()),
            has_uncommitted_changes: false,
        };
        let outcome = classify_outcome(&task(), &summary, &git, 20);
        assert_eq!(outcome, Outcome::complete("https://forge.example/o/r/pull/9"));
    }

    #[test]
    fn git_heuristic_is_skipped_when_retries_exhausted() {
        let mut t = task();
        t.retries = 3;
        let summary = summary_with_exit(1, &["some unrecognized error"]);
        let git = GitState {
            commits_ahead: 2,
            pr_url: None,
            has_uncommitted_changes: false,
        };
        let outcome = classify_outcome(&t, &summary, &git, 20);
        assert_eq!(outcome, Outcome::retry("ambiguous_needs_ai_tier"));
    }

    #[test]
    fn parse_ai_verdict_requires_strict_prefix() {
        assert_eq!(
            parse_ai_verdict("some preamble\nVERDICT:retry:ambiguous_ai_unavailable\n"),
            Some(Outcome::retry("ambiguous_ai_unavailable"))
        );
        assert_eq!(parse_ai_verdict("no verdict here"), None);
    }
}
