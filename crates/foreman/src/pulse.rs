//! The pulse cycle (§5 "Scheduling model"): one stateless sweep through
//! twelve fixed-order phases under the exclusive [`foreman_lock::PulseLock`],
//! invoked periodically by cron rather than run as a long-lived daemon.
//! Each phase sees the side effects of the ones before it within the same
//! sweep. No phase's failure aborts the ones after it (§7's "no exception
//! ever propagates out of a phase"): [`run_pulse`] catches every phase's
//! `Err`, logs it, and records it on the returned [`PulseReport`] instead of
//! returning early.
//!
//! The twelve phases, in order:
//! 1. [`reconcile_hung_workers`] — two-phase `SIGTERM`/`SIGKILL` for workers
//!    past their hang budget.
//! 2. [`promote_dispatched_to_running`] — `dispatched -> running` once the
//!    worker's log shows it actually started.
//! 3. [`evaluate_running_tasks`] — detect process exit, classify the
//!    outcome, run the quality gate on a would-be `complete`, and apply the
//!    resulting transition (`complete`/`retrying`+`queued`/`blocked`/`failed`).
//! 4. [`synthesize_diagnostics`] — spawn a diagnostic child for an
//!    eligible `blocked`/`failed` task.
//! 5. [`reconcile_diagnostics`] — requeue a parent once its diagnostic
//!    child finishes.
//! 6. [`dispatch_queued_tasks`] — run the seven-gate dispatch sequence over
//!    `queued` tasks.
//! 7. [`advance_complete_tasks`] — `complete -> pr_review`/`deployed`.
//! 8. [`advance_pr_review_tasks`] — CI/review-state decision, with an
//!    immediate merge for the no-triage-needed paths.
//! 9. [`advance_review_triage_tasks`] — thread-severity triage, with an
//!    immediate merge once triage clears.
//! 10. [`advance_merged_tasks`] — post-merge fast-forward and deploy
//!     routing.
//! 11. [`advance_deploying_and_deployed_tasks`] — run the deploy
//!     entrypoint, then queue the verify directive.
//! 12. [`advance_verifying_tasks_and_housekeeping`] — run verify
//!     directives, retry a `verify_failed` task, prune orphaned worktree
//!     registry entries, and close out any now-complete batch.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use foreman_forge::ReviewThread;
use foreman_lock::PulseLock;
use foreman_process::{descendants, is_alive, kill, terminate};
use foreman_store::TransitionFields;
use foreman_types::{BatchStatus, ProofEvent, Task, TaskStatus};

use crate::dispatcher::{dispatch_one, GateOutcome, ModelHealthProbe};
use crate::evaluator::{classify_outcome, AiEvaluator, GitState};
use crate::lifecycle::{self, PrReviewDecision, TriageAction};
use crate::log_summary;
use crate::model_resolver::tier_of_model;
use crate::self_heal::{self, QualityGateAction, QualityGateVerdict};
use crate::supervisor::{PulseState, Supervisor};
use crate::todo_registry;

/// How long an orphaned worktree registry entry is allowed to sit before a
/// scan reclaims it. Throttles [`foreman_git::WorktreeRegistry::prune`] the
/// same way the health-probe cache throttles model probes, so a burst of
/// pulses within one process (tests, a `--loop` invocation) doesn't rescan
/// the filesystem every time.
const ORPHAN_SCAN_INTERVAL: Duration = Duration::from_secs(600);

/// Per-directive timeout for the verify queue, distinct from
/// `LifecycleConfig::deploy_timeout` since a verify directive (a
/// `shellcheck`/`rg`/`file-exists` check) runs in seconds, not minutes.
const VERIFY_DIRECTIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Tallies from one pulse, surfaced by the `foreman pulse` CLI subcommand.
#[derive(Debug, Default, Clone)]
pub struct PulseReport {
    pub hung_reconciled: u32,
    pub promoted_to_running: u32,
    pub evaluated: u32,
    pub diagnostics_spawned: u32,
    pub diagnostics_reconciled: u32,
    pub dispatched: u32,
    pub advanced_to_pr_review: u32,
    pub merged: u32,
    pub deployed: u32,
    pub verified: u32,
    pub errors: Vec<String>,
}

/// Run one full pulse: acquire the exclusive lock, sweep all twelve phases,
/// release the lock on return (via `PulseLock`'s `Drop`).
pub fn run_pulse(
    sup: &Supervisor,
    pulse: &mut PulseState,
    health: &dyn ModelHealthProbe,
    ai_evaluator: Option<&dyn AiEvaluator>,
) -> anyhow::Result<PulseReport> {
    let _lock = PulseLock::acquire(&sup.state_dir, sup.config.lock.stale_timeout)?;
    let mut report = PulseReport::default();

    report.hung_reconciled = run_and_record("reconcile_hung_workers", &mut report.errors, || {
        reconcile_hung_workers(sup)
    });
    report.promoted_to_running = run_and_record("promote_dispatched_to_running", &mut report.errors, || {
        promote_dispatched_to_running(sup)
    });
    report.evaluated = run_and_record("evaluate_running_tasks", &mut report.errors, || {
        evaluate_running_tasks(sup, ai_evaluator)
    });
    report.diagnostics_spawned = run_and_record("synthesize_diagnostics", &mut report.errors, || {
        synthesize_diagnostics(sup)
    });
    report.diagnostics_reconciled = run_and_record("reconcile_diagnostics", &mut report.errors, || {
        reconcile_diagnostics(sup)
    });
    report.dispatched = run_and_record("dispatch_queued_tasks", &mut report.errors, || {
        dispatch_queued_tasks(sup, pulse, health)
    });
    report.advanced_to_pr_review = run_and_record("advance_complete_tasks", &mut report.errors, || {
        advance_complete_tasks(sup)
    });
    let pr_review_merges = run_and_record("advance_pr_review_tasks", &mut report.errors, || {
        advance_pr_review_tasks(sup, pulse)
    });
    let triage_merges = run_and_record("advance_review_triage_tasks", &mut report.errors, || {
        advance_review_triage_tasks(sup, pulse)
    });
    report.merged = pr_review_merges + triage_merges;
    run_and_record("advance_merged_tasks", &mut report.errors, || advance_merged_tasks(sup));
    report.deployed = run_and_record("advance_deploying_and_deployed_tasks", &mut report.errors, || {
        advance_deploying_and_deployed_tasks(sup)
    });
    report.verified = run_and_record("advance_verifying_tasks_and_housekeeping", &mut report.errors, || {
        advance_verifying_tasks_and_housekeeping(sup, pulse)
    });

    Ok(report)
}

/// Run one phase, swallowing its error into `errors` rather than letting it
/// abort the rest of the pulse (§7).
fn run_and_record(name: &str, errors: &mut Vec<String>, f: impl FnOnce() -> anyhow::Result<u32>) -> u32 {
    let _span = tracing::info_span!("pulse_phase", name).entered();
    match f() {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(phase = name, error = %e, "phase failed, continuing");
            errors.push(format!("{name}: {e}"));
            0
        }
    }
}

fn repo_slug(repo_root: &Path) -> String {
    repo_root.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

/// Parse the trailing `/pull/<n>` segment of a forge PR URL.
fn pr_number_from_url(url: &str) -> Option<u64> {
    url.rsplit('/').next()?.parse().ok()
}

fn read_log_lines(path: Option<&Path>) -> Vec<String> {
    path.and_then(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Phase 1: two-phase hang handling (§5). `SIGTERM` at 50% of the hang
/// budget, `SIGKILL` at 100% — spread naturally across separate pulses
/// rather than blocking this one on a grace-period sleep, unlike
/// [`foreman_process::terminate_tree`]'s single-call variant.
fn reconcile_hung_workers(sup: &Supervisor) -> anyhow::Result<u32> {
    let mut count = 0;
    for task in sup.store.list_by_status(&[TaskStatus::Dispatched, TaskStatus::Running])? {
        let Some(session) = &task.session else { continue };
        let Ok(pid) = session.parse::<u32>() else { continue };
        if !is_alive(pid) {
            continue;
        }
        let started = task.started_at.unwrap_or(task.updated_at);
        let Ok(elapsed) = (chrono::Utc::now() - started).to_std() else { continue };

        if elapsed >= sup.config.hang.hang_budget {
            for victim in descendants(pid).into_iter().chain(std::iter::once(pid)) {
                kill(victim);
            }
            sup.store.record_proof(
                &task.id,
                ProofEvent::AutoRecover,
                "hang_detection",
                "sigkill",
                &format!("hang budget of {:?} exceeded", sup.config.hang.hang_budget),
                "pulse",
                None,
                None,
            )?;
            count += 1;
        } else if elapsed >= sup.config.hang.sigterm_threshold() {
            for victim in descendants(pid).into_iter().chain(std::iter::once(pid)) {
                terminate(victim);
            }
            count += 1;
        }
    }
    Ok(count)
}

/// Phase 2: `dispatched -> running` once the worker's own log proves it
/// started (§4.7 tier 0).
fn promote_dispatched_to_running(sup: &Supervisor) -> anyhow::Result<u32> {
    let mut count = 0;
    for task in sup.store.list_by_status(&[TaskStatus::Dispatched])? {
        if log_summary::check_presence(task.log_file.as_deref()).is_ok() {
            sup.store.transition(&task.id, TaskStatus::Running, Some("worker_started"), TransitionFields::default())?;
            count += 1;
        }
    }
    Ok(count)
}

/// Phase 3: the heart of the outcome classifier (§4.7) plus the quality
/// gate (§4.10) folded in at the one point it can still cheaply reject a
/// `complete` verdict — while the task is still `evaluating`, the only
/// status [`foreman_store::Store::escalate_and_requeue`] accepts.
fn evaluate_running_tasks(sup: &Supervisor, ai_evaluator: Option<&dyn AiEvaluator>) -> anyhow::Result<u32> {
    let mut count = 0;
    for task in sup.store.list_by_status(&[TaskStatus::Running])? {
        let Some(session) = &task.session else { continue };
        let Ok(pid) = session.parse::<u32>() else { continue };
        if is_alive(pid) {
            continue;
        }

        let task = sup.store.transition(&task.id, TaskStatus::Evaluating, Some("process_exited"), TransitionFields::default())?;
        count += 1;

        let tail_window = sup.config.evaluator.tail_lines_for_heuristics;
        let summary = match log_summary::parse(
            task.log_file.as_deref().unwrap_or(Path::new("")),
            tail_window,
        ) {
            Ok(s) => s,
            Err(e) => {
                fail_or_block_evaluation(sup, &task, &format!("log_unreadable:{e}"))?;
                continue;
            }
        };

        let git = GitState {
            commits_ahead: task.branch.as_deref().map(|b| foreman_git::commits_ahead(&sup.repo_root, b)).unwrap_or(0),
            pr_url: summary.pr_url(),
            has_uncommitted_changes: task.worktree.as_deref().map(foreman_git::has_uncommitted_changes).unwrap_or(false),
        };

        let mut outcome = classify_outcome(&task, &summary, &git, tail_window);
        if outcome.detail == "ambiguous_needs_ai_tier" {
            if let Some(ai) = ai_evaluator {
                let tail = summary.tail_lines.join("\n");
                outcome = ai.evaluate(&task, &tail).unwrap_or_else(|_| foreman_types::Outcome::retry("ambiguous_ai_unavailable"));
            }
        }

        apply_evaluation_outcome(sup, &task, outcome, &summary)?;
    }
    Ok(count)
}

fn apply_evaluation_outcome(
    sup: &Supervisor,
    task: &Task,
    outcome: foreman_types::Outcome,
    summary: &log_summary::LogSummary,
) -> anyhow::Result<()> {
    use foreman_types::OutcomeKind::*;

    match outcome.kind {
        Complete => {
            let non_trivial_diff = task
                .branch
                .as_deref()
                .map(|b| foreman_git::has_non_trivial_changes(&sup.repo_root, "main", b))
                .unwrap_or(false);
            let changed = task.branch.as_deref().map(|b| foreman_git::changed_files(&sup.repo_root, "main", b)).unwrap_or_default();
            let worktree = task.worktree.as_deref().unwrap_or(&sup.repo_root);
            let broken_shell = self_heal::check_shell_syntax(worktree, &changed, VERIFY_DIRECTIVE_TIMEOUT);

            let verdict = self_heal::quality_gate_verdict(
                summary.line_count as u64,
                summary.pr_url().is_some(),
                &summary.tail_lines,
                non_trivial_diff,
            );

            let shell_ok = broken_shell.is_empty();
            let rejection_reason = if !shell_ok {
                Some(format!("shell_syntax_errors:{}", broken_shell.join(",")))
            } else if let QualityGateVerdict::Reject { reason } = &verdict {
                Some(reason.clone())
            } else {
                None
            };

            match rejection_reason {
                None => {
                    let pr_url = outcome.pr_url().map(str::to_string);
                    sup.store.transition(
                        &task.id,
                        TaskStatus::Complete,
                        Some("quality_gate_passed"),
                        TransitionFields { pr_url: pr_url.clone(), ..Default::default() },
                    )?;
                    sup.store.record_proof(
                        &task.id,
                        ProofEvent::Complete,
                        "evaluating",
                        "complete",
                        &outcome.detail,
                        "evaluator",
                        pr_url.as_deref(),
                        None,
                    )?;
                }
                Some(reason) => {
                    reject_via_quality_gate(sup, task, &reason)?;
                }
            }
        }
        Retry => {
            if task.retries + 1 > task.max_retries {
                transition_terminal(sup, task, TaskStatus::Failed, "max_retries_exceeded")?;
            } else {
                sup.store.transition(
                    &task.id,
                    TaskStatus::Retrying,
                    Some(&outcome.detail),
                    TransitionFields::default(),
                )?;
                requeue(sup, task)?;
            }
        }
        Blocked => {
            transition_terminal(sup, task, TaskStatus::Blocked, &outcome.detail)?;
        }
        Failed => {
            transition_terminal(sup, task, TaskStatus::Failed, &outcome.detail)?;
        }
    }
    Ok(())
}

fn reject_via_quality_gate(sup: &Supervisor, task: &Task, reason: &str) -> anyhow::Result<()> {
    let current_tier = tier_of_model(task.model.as_deref().unwrap_or(""), &sup.config.model_resolver);
    match self_heal::apply_rejection(sup, task, current_tier)? {
        QualityGateAction::Escalated { to_model } => {
            tracing::info!(task = %task.id, to_model, reason, "quality gate rejected, escalated and requeued");
            requeue(sup, task)?;
        }
        QualityGateAction::EscalationExhausted => {
            transition_terminal(sup, task, TaskStatus::Failed, &format!("quality_gate_exhausted:{reason}"))?;
        }
    }
    Ok(())
}

fn fail_or_block_evaluation(sup: &Supervisor, task: &Task, reason: &str) -> anyhow::Result<()> {
    if task.retries + 1 > task.max_retries {
        transition_terminal(sup, task, TaskStatus::Failed, reason)
    } else {
        sup.store.transition(&task.id, TaskStatus::Retrying, Some(reason), TransitionFields::default())?;
        requeue(sup, task)
    }
}

/// Transition `task` to a `blocked`/`failed` resting state, notify, and
/// annotate `TODO.md` so a human scanning the board sees why.
fn transition_terminal(sup: &Supervisor, task: &Task, to: TaskStatus, reason: &str) -> anyhow::Result<()> {
    sup.store.transition(&task.id, to, Some(reason), TransitionFields { error: Some(reason.to_string()), ..Default::default() })?;
    sup.store.record_proof(
        &task.id,
        if to == TaskStatus::Blocked { ProofEvent::Blocked } else { ProofEvent::Failed },
        "evaluating",
        to.as_str(),
        reason,
        "evaluator",
        None,
        None,
    )?;

    let event = if to == TaskStatus::Blocked {
        foreman_notify::NotifyEvent::TaskBlocked { task_id: task.id.clone(), reason: reason.to_string() }
    } else {
        foreman_notify::NotifyEvent::TaskFailed { task_id: task.id.clone(), reason: reason.to_string() }
    };
    sup.notifier.notify(&event);

    let todo_path = sup.repo_root.join("TODO.md");
    if let Ok(content) = std::fs::read_to_string(&todo_path) {
        if let Some(updated) = todo_registry::annotate_blocked(&content, &task.id, reason) {
            let _ = std::fs::write(&todo_path, updated);
        }
    }
    Ok(())
}

/// Move a task back to `queued` and free its `TODO.md` claim so it can be
/// picked up fresh next pulse.
fn requeue(sup: &Supervisor, task: &Task) -> anyhow::Result<()> {
    sup.store.transition(&task.id, TaskStatus::Queued, Some("requeued"), TransitionFields::default())?;
    let todo_path = sup.repo_root.join("TODO.md");
    if let Ok(content) = std::fs::read_to_string(&todo_path) {
        if let Some(updated) = todo_registry::unclaim(&content, &task.id) {
            let _ = std::fs::write(&todo_path, &updated);
            todo_registry::commit_and_push(&sup.repo_root, &format!("requeue: {}", task.id));
        }
    }
    Ok(())
}

/// Phase 4: spawn a diagnostic child for an eligible `blocked`/`failed`
/// task (§4.10).
fn synthesize_diagnostics(sup: &Supervisor) -> anyhow::Result<u32> {
    let mut count = 0;
    for task in sup.store.list_by_status(&[TaskStatus::Blocked, TaskStatus::Failed])? {
        let reason = task.last_error.clone().unwrap_or_default();
        let tail = read_log_lines(task.log_file.as_deref());
        if self_heal::maybe_synthesize_diagnostic(sup, &task, &reason, &tail)?.is_some() {
            count += 1;
        }
    }
    Ok(count)
}

/// Phase 5: requeue a parent once its diagnostic child reaches a terminal
/// state.
fn reconcile_diagnostics(sup: &Supervisor) -> anyhow::Result<u32> {
    use TaskStatus::*;
    let mut count = 0;
    for task in sup.store.list_by_status(&[Deployed, Verified, Merged, Failed, Cancelled])? {
        if task.is_diagnostic() && self_heal::reconcile_diagnostic_completion(sup, &task)? {
            count += 1;
        }
    }
    Ok(count)
}

/// Phase 6: run the seven-gate dispatch sequence over every `queued` task,
/// admission-limited per batch by the concurrency governor.
fn dispatch_queued_tasks(sup: &Supervisor, pulse: &mut PulseState, health: &dyn ModelHealthProbe) -> anyhow::Result<u32> {
    let sample = foreman_environment::sample();
    let running_count = sup.store.list_by_status(&[TaskStatus::Dispatched, TaskStatus::Running])?.len() as u32;
    let active_batches = sup.store.list_active_batches()?;

    let mut count = 0;
    for task in sup.store.list_by_status(&[TaskStatus::Queued])? {
        let batch = active_batches.iter().find(|b| {
            sup.store.batch_task_ids(b.id).map(|ids| ids.contains(&task.id)).unwrap_or(false)
        });
        match dispatch_one(sup, pulse, &task, batch, &sample, running_count, health)? {
            GateOutcome::Dispatched { .. } => count += 1,
            _ => {}
        }
    }
    Ok(count)
}

/// Phase 7: `complete -> pr_review`/`deployed`.
fn advance_complete_tasks(sup: &Supervisor) -> anyhow::Result<u32> {
    let mut count = 0;
    for task in sup.store.list_by_status(&[TaskStatus::Complete])? {
        lifecycle::advance_complete(sup, &task)?;
        count += 1;
    }
    Ok(count)
}

/// Phase 8: decide each `pr_review` task's fate. `UnstableButGreen` and
/// `ReadyToMerge` merge immediately rather than waiting for a separate
/// phase, since [`lifecycle::advance_merging`] is agnostic to whether it's
/// called from `pr_review` or post-triage.
fn advance_pr_review_tasks(sup: &Supervisor, pulse: &mut PulseState) -> anyhow::Result<u32> {
    let mut merges = 0;
    let repo = repo_slug(&sup.repo_root);
    for task in sup.store.list_by_status(&[TaskStatus::PrReview])? {
        let Some(pr_url) = &task.pr_url else { continue };
        let Some(pr_number) = pr_number_from_url(pr_url) else { continue };
        let pr = sup.forge.view_pr(&repo, pr_number)?;
        let worker_alive = task.session.as_deref().and_then(|s| s.parse::<u32>().ok()).is_some_and(is_alive);

        let decision = lifecycle::decide_pr_review(&pr, worker_alive, &sup.config.lifecycle.admin_overridable_checks);
        match decision {
            PrReviewDecision::StayInReview | PrReviewDecision::PromoteDraft => {
                // No forge API exposes "mark draft ready"; until one is
                // added this is a no-op and the PR stays in review.
            }
            PrReviewDecision::AlreadyMerged => {
                finalize_already_merged(sup, pulse, &task, pr_number)?;
                merges += 1;
            }
            PrReviewDecision::Blocked { reason } => {
                transition_terminal(sup, &task, TaskStatus::Blocked, &reason)?;
            }
            PrReviewDecision::ReadyForTriage => {
                sup.store.transition(&task.id, TaskStatus::ReviewTriage, Some("ready_for_triage"), TransitionFields::default())?;
            }
            PrReviewDecision::ReadyToMerge => {
                if lifecycle::advance_merging(sup, pulse, &task, pr_number, false)? {
                    merges += 1;
                }
            }
            PrReviewDecision::UnstableButGreen => {
                if lifecycle::advance_merging(sup, pulse, &task, pr_number, true)? {
                    merges += 1;
                }
            }
            PrReviewDecision::RetryReviewFix => {
                respawn_worker(sup, &task, "Address the failing review-required fix before this PR can merge.", "review_fix_respawned")?;
            }
        }
    }
    Ok(merges)
}

/// Treat an upstream merge discovered outside our own `merging` step the
/// same way [`lifecycle::advance_merging`] treats one it performed itself:
/// record the proof, guard siblings against a same-pulse double-merge, and
/// rebase them onto the now-current `main`.
fn finalize_already_merged(sup: &Supervisor, pulse: &mut PulseState, task: &Task, pr_number: u64) -> anyhow::Result<()> {
    sup.store.transition(&task.id, TaskStatus::Merged, Some("already_merged_upstream"), TransitionFields::default())?;
    sup.store.record_proof(
        &task.id,
        ProofEvent::Merge,
        "merging",
        "already_merged_upstream",
        &format!("pr #{pr_number} was merged outside this pulse's own merging step"),
        "pulse",
        task.pr_url.as_deref(),
        None,
    )?;
    pulse.mark_merged(task.parent_prefix());
    for sibling in sup.store.siblings_of(task)? {
        if let Some(branch) = &sibling.branch {
            foreman_git::rebase_onto_main_and_push(&sup.repo_root, branch);
        }
    }
    Ok(())
}

/// Phase 9: thread-severity triage (§4.8 step 3); merges immediately once
/// triage clears, the same way phase 8 does.
fn advance_review_triage_tasks(sup: &Supervisor, pulse: &mut PulseState) -> anyhow::Result<u32> {
    let mut merges = 0;
    let repo = repo_slug(&sup.repo_root);
    for task in sup.store.list_by_status(&[TaskStatus::ReviewTriage])? {
        let Some(pr_url) = &task.pr_url else { continue };
        let Some(pr_number) = pr_number_from_url(pr_url) else { continue };
        let threads: Vec<ReviewThread> = sup.forge.review_threads(&repo, pr_number)?;

        match lifecycle::triage_threads(&threads) {
            TriageAction::ReadyToMerge => {
                sup.store.transition(&task.id, TaskStatus::Merging, Some("triage_clear"), TransitionFields::default())?;
                if lifecycle::advance_merging(sup, pulse, &task, pr_number, false)? {
                    merges += 1;
                }
            }
            TriageAction::SpawnReviewFixWorker { thread_ids } => {
                let bodies: Vec<&str> = threads
                    .iter()
                    .filter(|t| thread_ids.contains(&t.id))
                    .map(|t| t.body.as_str())
                    .collect();
                let description = format!("Address reviewer feedback:\n{}", bodies.join("\n---\n"));
                respawn_worker(sup, &task, &description, "review_fix_respawned")?;
            }
            TriageAction::Blocked => {
                transition_terminal(sup, &task, TaskStatus::Blocked, "critical_review_finding")?;
            }
        }
    }
    Ok(merges)
}

/// Respawn a worker in `task`'s existing worktree to address review
/// feedback, the same spawn shape [`crate::dispatcher::dispatch_one`] uses
/// for a fresh dispatch, reusing rather than re-provisioning the worktree.
fn respawn_worker(sup: &Supervisor, task: &Task, description: &str, reason: &str) -> anyhow::Result<()> {
    let Some(worktree) = &task.worktree else {
        anyhow::bail!("task {} has no worktree to respawn a review-fix worker in", task.id);
    };
    let log_path = task.log_file.clone().unwrap_or_else(|| sup.logs_dir().join(format!("{}.log", task.id)));
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new().create(true).append(true).open(&log_path)?;
    let log_file_err = log_file.try_clone()?;

    let pid = Command::new("worker")
        .arg(description)
        .current_dir(worktree)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .spawn()?
        .id();

    sup.store.transition(
        &task.id,
        TaskStatus::Dispatched,
        Some(reason),
        TransitionFields { session: Some(pid.to_string()), log_file: Some(log_path), ..Default::default() },
    )?;
    Ok(())
}

/// Phase 10: post-merge fast-forward and deploy routing.
fn advance_merged_tasks(sup: &Supervisor) -> anyhow::Result<u32> {
    let mut count = 0;
    for task in sup.store.list_by_status(&[TaskStatus::Merged])? {
        lifecycle::advance_merged(sup, &task)?;
        count += 1;
    }
    Ok(count)
}

/// Phase 11: run the deploy entrypoint for `deploying` tasks, then queue
/// the verify directive for `deployed` tasks.
fn advance_deploying_and_deployed_tasks(sup: &Supervisor) -> anyhow::Result<u32> {
    let mut deployed = 0;
    for task in sup.store.list_by_status(&[TaskStatus::Deploying])? {
        if lifecycle::advance_deploying(sup, &task)? {
            sup.notifier.notify(&foreman_notify::NotifyEvent::TaskDeployed { task_id: task.id.clone(), pr_url: task.pr_url.clone() });
            deployed += 1;
        }
    }
    for task in sup.store.list_by_status(&[TaskStatus::Deployed])? {
        lifecycle::advance_deployed(sup, &task)?;
        sup.notifier.notify(&foreman_notify::NotifyEvent::TaskDeployed { task_id: task.id.clone(), pr_url: task.pr_url.clone() });
        deployed += 1;
    }
    Ok(deployed)
}

/// Phase 12: run verify directives, retry a stale `verify_failed` task,
/// prune orphaned worktree registry entries, and close out any batch whose
/// every member has reached a terminal status.
fn advance_verifying_tasks_and_housekeeping(sup: &Supervisor, pulse: &mut PulseState) -> anyhow::Result<u32> {
    for task in sup.store.list_by_status(&[TaskStatus::VerifyFailed])? {
        sup.store.transition(&task.id, TaskStatus::Verifying, Some("retry_verification"), TransitionFields::default())?;
    }

    let mut verified = 0;
    for task in sup.store.list_by_status(&[TaskStatus::Verifying])? {
        if lifecycle::advance_verifying(sup, &task, VERIFY_DIRECTIVE_TIMEOUT)? {
            sup.notifier.notify(&foreman_notify::NotifyEvent::TaskVerified { task_id: task.id.clone() });
            verified += 1;
        }
    }

    let due = pulse.last_orphan_scan.map(|t| t.elapsed() > ORPHAN_SCAN_INTERVAL).unwrap_or(true);
    if due {
        foreman_git::WorktreeRegistry::new(sup.registry_dir()).prune();
        pulse.last_orphan_scan = Some(Instant::now());
    }

    for batch in sup.store.list_active_batches()? {
        if sup.store.batch_is_complete(batch.id)? {
            sup.store.set_batch_status(batch.id, BatchStatus::Complete)?;
            sup.notifier.notify(&foreman_notify::NotifyEvent::BatchComplete { batch_name: batch.name.clone() });
        }
    }

    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_number_from_url_parses_trailing_segment() {
        assert_eq!(pr_number_from_url("https://forge.example/o/r/pull/42"), Some(42));
    }

    #[test]
    fn pr_number_from_url_rejects_non_numeric_tail() {
        assert_eq!(pr_number_from_url("https://forge.example/o/r/pull/abc"), None);
    }

    #[test]
    fn repo_slug_uses_final_path_component() {
        assert_eq!(repo_slug(Path::new("/home/ci/checkouts/widgets")), "widgets");
    }

    #[test]
    fn read_log_lines_returns_empty_for_missing_file() {
        assert!(read_log_lines(Some(Path::new("/nonexistent/path/to.log"))).is_empty());
    }
}
