//! The self-healer / quality gate (§4.10): two independent checks the pulse
//! runs around the edges of the happy path. The diagnostic-subtask synthesizer
//! reacts to a `blocked`/`failed` task by spawning a narrow investigation
//! child rather than leaving a human to read the log; the quality gate reacts
//! to a `complete` task by catching the "technically finished, actually did
//! nothing" case before it ever reaches PR review.
//!
//! Grounded on [`foreman_store::Store::escalate_and_requeue`] and
//! [`foreman_store::Store::active_diagnostic_of`] for the state side, and on
//! [`foreman_git::has_non_trivial_changes`] plus [`crate::log_summary::LogSummary`]
//! for the evidence side.

use std::path::Path;
use std::time::Duration;

use foreman_process::run_with_timeout;
use foreman_types::{ModelTier, Task};

use crate::supervisor::Supervisor;

/// Reasons a blocked/failed task is exempt from diagnostic synthesis: the
/// cause is already self-explanatory, so a diagnostic child would just
/// restate it.
const DIAGNOSTIC_EXCLUDED_REASONS: &[&str] =
    &["auth_error", "out_of_memory", "merge_conflict", "max_retries_exceeded"];

/// How many of the parent's tail log lines to fold into the diagnostic
/// child's description.
const DIAGNOSTIC_LOG_TAIL: usize = 100;

/// Whether `task` (just transitioned to `blocked` or `failed` for `reason`)
/// qualifies for a diagnostic child. A diagnostic task never spawns another
/// diagnostic task, and an already-excluded reason needs no investigation.
pub fn should_synthesize_diagnostic(task: &Task, reason: &str) -> bool {
    !task.is_diagnostic() && !DIAGNOSTIC_EXCLUDED_REASONS.contains(&reason)
}

/// Build (but do not insert) the diagnostic child task for `parent`. The
/// description embeds the parent's id, the failure reason, and its last
/// [`DIAGNOSTIC_LOG_TAIL`] log lines flattened to one line each so the
/// diagnostic worker gets the same evidence a human would scroll to first.
pub fn build_diagnostic_task(parent: &Task, reason: &str, tail_lines: &[String]) -> Task {
    let id = format!("{}-diag-1", parent.id);
    let start = tail_lines.len().saturating_sub(DIAGNOSTIC_LOG_TAIL);
    let flattened: Vec<String> = tail_lines[start..]
        .iter()
        .map(|l| l.replace(['\n', '\r'], " "))
        .collect();
    let description = format!(
        "Investigate why {} {reason}. Do not attempt the original change; find the root cause \
         and report it. Last log lines:\n{}",
        parent.id,
        flattened.join("\n"),
    );
    let mut diag = Task::new(id, parent.repo_root.clone(), description);
    diag.model = parent.model.clone();
    diag.diagnostic_of = Some(parent.id.clone());
    diag.max_retries = parent.max_retries;
    diag
}

/// Synthesize and persist a diagnostic child for `parent`, unless one is
/// already active or `parent` is exempt. Returns the inserted task, if any.
pub fn maybe_synthesize_diagnostic(
    sup: &Supervisor,
    parent: &Task,
    reason: &str,
    tail_lines: &[String],
) -> anyhow::Result<Option<Task>> {
    if !should_synthesize_diagnostic(parent, reason) {
        return Ok(None);
    }
    if sup.store.active_diagnostic_of(&parent.id)?.is_some() {
        return Ok(None);
    }

    let diag = build_diagnostic_task(parent, reason, tail_lines);
    sup.store.insert_task(&diag)?;
    sup.store.record_proof(
        &parent.id,
        foreman_types::ProofEvent::SelfHeal,
        "self_heal",
        "diagnostic_synthesized",
        &format!("spawned {}", diag.id),
        "self_heal",
        None,
        None,
    )?;
    Ok(Some(diag))
}

/// Once a diagnostic child reaches a terminal state, reset its still-blocked
/// parent to `queued` so the next pulse retries the original work armed with
/// whatever the diagnostic worker reported.
pub fn reconcile_diagnostic_completion(sup: &Supervisor, diagnostic: &Task) -> anyhow::Result<bool> {
    let Some(parent_id) = &diagnostic.diagnostic_of else {
        return Ok(false);
    };
    if !diagnostic.status.is_terminal() {
        return Ok(false);
    }
    let parent = sup.store.require_task(parent_id)?;
    if parent.status != foreman_types::TaskStatus::Blocked {
        return Ok(false);
    }
    sup.store.transition(
        &parent.id,
        foreman_types::TaskStatus::Queued,
        Some("diagnostic_complete"),
        Default::default(),
    )?;
    Ok(true)
}

/// Verdict of the quality gate run against a just-`complete` task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualityGateVerdict {
    Pass,
    Reject { reason: String },
}

const TRIVIAL_LOG_SIZE_BYTES: u64 = 2048;
const ERROR_DENSITY_PATTERNS: &[&str] = &["error", "exception", "panic", "traceback"];
const ERROR_DENSITY_THRESHOLD: f64 = 0.5;

/// Evaluate the non-shell checks: trivial log with no PR, an empty diff, and
/// a tail that's mostly error chatter despite a clean exit. Shell syntax is
/// checked separately in [`check_shell_syntax`] since it needs process I/O.
pub fn quality_gate_verdict(
    log_size_bytes: u64,
    has_pr_signal: bool,
    tail_lines: &[String],
    non_trivial_diff: bool,
) -> QualityGateVerdict {
    if log_size_bytes < TRIVIAL_LOG_SIZE_BYTES && !has_pr_signal {
        return QualityGateVerdict::Reject {
            reason: "trivial_log_no_pr_signal".to_string(),
        };
    }
    if !non_trivial_diff {
        return QualityGateVerdict::Reject {
            reason: "empty_diff_no_work".to_string(),
        };
    }
    let density = error_line_density(tail_lines);
    if density >= ERROR_DENSITY_THRESHOLD {
        return QualityGateVerdict::Reject {
            reason: "high_error_density_in_tail".to_string(),
        };
    }
    QualityGateVerdict::Pass
}

fn error_line_density(tail_lines: &[String]) -> f64 {
    if tail_lines.is_empty() {
        return 0.0;
    }
    let hits = tail_lines
        .iter()
        .filter(|l| {
            let lower = l.to_lowercase();
            ERROR_DENSITY_PATTERNS.iter().any(|p| lower.contains(p))
        })
        .count();
    hits as f64 / tail_lines.len() as f64
}

/// Run `bash -n` against every changed `.sh` file, returning the ones that
/// fail to parse. A syntax error here means the worker shipped a broken
/// script even though its process exited 0.
pub fn check_shell_syntax(repo_root: &Path, changed_files: &[String], timeout: Duration) -> Vec<String> {
    changed_files
        .iter()
        .filter(|f| f.ends_with(".sh"))
        .filter(|f| {
            !matches!(
                run_with_timeout("bash", &["-n", f], repo_root, Some(timeout)),
                Ok(out) if out.exit_code == 0 && !out.timed_out
            )
        })
        .cloned()
        .collect()
}

/// What the pulse should do once a `complete` task fails the quality gate:
/// escalate to the next model tier and requeue, or give up and block it
/// because the escalation ceiling is already reached.
pub enum QualityGateAction {
    Escalated { to_model: String },
    EscalationExhausted,
}

/// Apply a quality-gate rejection: escalate `task`'s model tier and requeue
/// via [`foreman_store::Store::escalate_and_requeue`], or report that the
/// escalation ceiling is reached so the caller can block the task instead.
pub fn apply_rejection(
    sup: &Supervisor,
    task: &Task,
    current_tier: ModelTier,
) -> anyhow::Result<QualityGateAction> {
    if task.escalation_depth >= task.max_escalation_depth {
        return Ok(QualityGateAction::EscalationExhausted);
    }
    let Some(next_tier) = current_tier.escalate() else {
        return Ok(QualityGateAction::EscalationExhausted);
    };
    let to_model = crate::model_resolver::tier_model(next_tier, &sup.config.model_resolver);
    sup.store.escalate_and_requeue(&task.id, &to_model)?;
    Ok(QualityGateAction::Escalated { to_model })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn task(id: &str) -> Task {
        Task::new(id, PathBuf::from("/repo"), "do the thing")
    }

    #[test]
    fn excludes_auth_and_oom_and_conflict_and_max_retries() {
        let t = task("t1");
        assert!(!should_synthesize_diagnostic(&t, "auth_error"));
        assert!(!should_synthesize_diagnostic(&t, "out_of_memory"));
        assert!(!should_synthesize_diagnostic(&t, "merge_conflict"));
        assert!(!should_synthesize_diagnostic(&t, "max_retries_exceeded"));
    }

    #[test]
    fn allows_other_reasons_on_non_diagnostic_task() {
        let t = task("t1");
        assert!(should_synthesize_diagnostic(&t, "unknown_tool_failure"));
    }

    #[test]
    fn diagnostic_task_never_spawns_another() {
        let mut t = task("t1-diag-1");
        t.diagnostic_of = Some("t1".to_string());
        assert!(!should_synthesize_diagnostic(&t, "unknown_tool_failure"));
    }

    #[test]
    fn build_diagnostic_task_embeds_parent_id_and_tail() {
        let parent = task("t42");
        let tail: Vec<String> = (0..150).map(|i| format!("line {i}")).collect();
        let diag = build_diagnostic_task(&parent, "unknown_tool_failure", &tail);
        assert_eq!(diag.id, "t42-diag-1");
        assert_eq!(diag.diagnostic_of, Some("t42".to_string()));
        assert!(diag.description.contains("t42"));
        assert!(diag.description.contains("line 149"));
        assert!(!diag.description.contains("line 49"));
    }

    #[test]
    fn build_diagnostic_task_strips_embedded_newlines_per_line() {
        let parent = task("t1");
        let tail = vec!["has\nembedded\nnewlines".to_string()];
        let diag = build_diagnostic_task(&parent, "unknown_tool_failure", &tail);
        assert!(diag.description.contains("has embedded newlines"));
    }

    #[test]
    fn quality_gate_rejects_trivial_log_without_pr() {
        let verdict = quality_gate_verdict(100, false, &[], true);
        assert_eq!(
            verdict,
            QualityGateVerdict::Reject { reason: "trivial_log_no_pr_signal".to_string() }
        );
    }

    #[test]
    fn quality_gate_allows_trivial_log_with_pr_signal() {
        let verdict = quality_gate_verdict(100, true, &[], true);
        assert_eq!(verdict, QualityGateVerdict::Pass);
    }

    #[test]
    fn quality_gate_rejects_empty_diff() {
        let verdict = quality_gate_verdict(10_000, true, &[], false);
        assert_eq!(
            verdict,
            QualityGateVerdict::Reject { reason: "empty_diff_no_work".to_string() }
        );
    }

    #[test]
    fn quality_gate_rejects_high_error_density() {
        let tail = vec![
            "error: could not compile".to_string(),
            "panic: out of bounds".to_string(),
            "ok line".to_string(),
        ];
        let verdict = quality_gate_verdict(10_000, true, &tail, true);
        assert_eq!(
            verdict,
            QualityGateVerdict::Reject { reason: "high_error_density_in_tail".to_string() }
        );
    }

    #[test]
    fn quality_gate_passes_clean_task() {
        let tail = vec!["compiling".to_string(), "tests passed".to_string()];
        let verdict = quality_gate_verdict(10_000, true, &tail, true);
        assert_eq!(verdict, QualityGateVerdict::Pass);
    }

    #[test]
    fn check_shell_syntax_ignores_non_shell_files() {
        let td = tempfile::tempdir().unwrap();
        let bad = check_shell_syntax(td.path(), &["src/lib.rs".to_string()], Duration::from_secs(5));
        assert!(bad.is_empty());
    }

    #[test]
    fn check_shell_syntax_flags_broken_script() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("broken.sh"), "if [ true\n").unwrap();
        let bad = check_shell_syntax(td.path(), &["broken.sh".to_string()], Duration::from_secs(5));
        assert_eq!(bad, vec!["broken.sh".to_string()]);
    }

    #[test]
    fn check_shell_syntax_passes_valid_script() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("ok.sh"), "#!/bin/bash\necho hi\n").unwrap();
        let bad = check_shell_syntax(td.path(), &["ok.sh".to_string()], Duration::from_secs(5));
        assert!(bad.is_empty());
    }
}
