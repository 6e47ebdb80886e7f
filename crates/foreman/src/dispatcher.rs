//! The dispatch gate sequence (§4.6): seven checks run in a fixed order
//! before a queued task is allowed to spawn a worker. Any gate that fails
//! short-circuits the rest — the dispatcher never "catches up" a later gate
//! after an earlier one already decided the outcome, matching the
//! teacher's `should_dispatch`-then-`dispatch` split rather than one giant
//! conditional.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use foreman_environment::HostSample;
use foreman_forge::Forge;
use foreman_git::{already_done_in_history, decide_reuse, ReuseDecision, WorktreeRegistry};
use foreman_store::TransitionFields;
use foreman_types::{Batch, ProofEvent, Task, TaskStatus};

use crate::concurrency::has_admission_slot;
use crate::supervisor::{PulseState, Supervisor};

/// Why a task was not dispatched this pulse, or that it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Dispatched { pid: u32, worktree: PathBuf, branch: String },
    AlreadyDone,
    ClaimLost,
    NoAdmissionSlot,
    ModelUnhealthy,
    ForgeAuthFailed,
    StaleRecheckFailed,
}

/// Probe whether `model` is currently reachable. A real implementation
/// shells out to the worker CLI's own `--version`/health subcommand; tests
/// substitute a closure.
pub trait ModelHealthProbe {
    fn probe(&self, model: &str) -> bool;
}

/// Run every gate for `task` in order, dispatching a worker if all pass.
#[allow(clippy::too_many_arguments)]
pub fn dispatch_one(
    sup: &Supervisor,
    pulse: &mut PulseState,
    task: &Task,
    batch: Option<&Batch>,
    sample: &HostSample,
    running_count: u32,
    health: &dyn ModelHealthProbe,
) -> anyhow::Result<GateOutcome> {
    // Gate 1: terminal-state recheck. Another process may have already
    // moved this task since the caller listed it.
    let fresh = sup.store.require_task(&task.id)?;
    if fresh.status != TaskStatus::Queued {
        return Ok(GateOutcome::StaleRecheckFailed);
    }

    // Gate 2: already-done detection.
    if already_done_in_history(&sup.repo_root, &task.id) {
        sup.store.transition(
            &task.id,
            TaskStatus::Complete,
            Some("already_done_in_history"),
            TransitionFields::default(),
        )?;
        sup.store.record_proof(
            &task.id,
            ProofEvent::Dispatch,
            "dispatch",
            "already_done",
            "main history contains a word-boundary match for this task id",
            "dispatcher",
            None,
            None,
        )?;
        return Ok(GateOutcome::AlreadyDone);
    }

    // Gate 3: claim acquisition via TODO.md.
    let todo_path = sup.repo_root.join("TODO.md");
    let content = fs::read_to_string(&todo_path).unwrap_or_default();
    let Some(claimed) = crate::todo_registry::claim(&content, &task.id, &sup.identity) else {
        return Ok(GateOutcome::ClaimLost);
    };
    fs::write(&todo_path, &claimed)?;
    if !crate::todo_registry::commit_and_push(&sup.repo_root, &format!("claim: {}", task.id)) {
        return Ok(GateOutcome::ClaimLost);
    }

    // Gate 4: admission via the concurrency governor.
    if let Some(batch) = batch {
        if !has_admission_slot(batch, sample, &sup.config.concurrency, running_count) {
            return Ok(GateOutcome::NoAdmissionSlot);
        }
    }

    // Gate 5: model health probe, cached for this pulse.
    let model = task.model.as_deref().unwrap_or("default");
    let healthy = match pulse.cached_health(model, sup.config.dispatch.health_cache_ttl) {
        Some(cached) => cached,
        None => {
            let probed = health.probe(model);
            pulse.record_health(model, probed);
            probed
        }
    };
    if !healthy {
        return Ok(GateOutcome::ModelUnhealthy);
    }

    // Gate 6: forge-auth check.
    if sup.forge.authenticated_user().is_err() {
        return Ok(GateOutcome::ForgeAuthFailed);
    }

    // Gate 7: remote protocol rewrite, so a headless worker's push doesn't
    // stall on an interactive SSH key prompt.
    rewrite_remote_to_https(&sup.repo_root);

    // Worktree provisioning.
    let branch = task.branch.clone().unwrap_or_else(|| format!("feature/{}", task.id));
    let worktree_path = sup.worktrees_dir().join(&task.id);
    let worktree_exists = worktree_path.exists();
    let open_pr_exists = sup
        .forge
        .list_prs_for_branch(&repo_slug(&sup.repo_root), &branch)
        .map(|prs| !prs.is_empty())
        .unwrap_or(false);

    let decision = decide_reuse(
        &sup.repo_root,
        &worktree_path,
        &branch,
        worktree_exists,
        open_pr_exists,
        sup.config.dispatch.max_diverged_files_for_reuse,
    );
    provision_worktree(sup, &worktree_path, &branch, decision)?;

    let registry = WorktreeRegistry::new(sup.registry_dir());
    registry.claim(&worktree_path, &sup.identity, std::process::id())?;

    // Spawn the worker, detached: stdout/stderr redirected to the task log
    // so the evaluator's JSON-lines parse has something to read even after
    // this process (or the whole host) restarts mid-pulse.
    let log_path = sup.logs_dir().join(format!("{}.log", task.id));
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let log_file = fs::File::create(&log_path)?;
    let log_file_err = log_file.try_clone()?;

    let pid = spawn_worker(&worktree_path, &task.description, log_file, log_file_err)?;

    sup.store.transition(
        &task.id,
        TaskStatus::Dispatched,
        None,
        TransitionFields {
            session: Some(pid.to_string()),
            worktree: Some(worktree_path.clone()),
            branch: Some(branch.clone()),
            log_file: Some(log_path),
            ..Default::default()
        },
    )?;

    Ok(GateOutcome::Dispatched { pid, worktree: worktree_path, branch })
}

fn provision_worktree(
    sup: &Supervisor,
    worktree_path: &Path,
    branch: &str,
    decision: ReuseDecision,
) -> anyhow::Result<()> {
    match decision {
        ReuseDecision::Reuse => {}
        ReuseDecision::DeleteAndRecreate => {
            run_git(&sup.repo_root, &["worktree", "remove", "--force", &worktree_path.to_string_lossy()]);
            run_git(
                &sup.repo_root,
                &["worktree", "add", "-B", branch, &worktree_path.to_string_lossy(), "main"],
            );
        }
        ReuseDecision::KeepResetToOriginMain => {
            foreman_git::reset_branch_to_origin_main(&sup.repo_root, branch);
        }
        ReuseDecision::CreateOnExistingBranch => {
            run_git(
                &sup.repo_root,
                &["worktree", "add", &worktree_path.to_string_lossy(), branch],
            );
        }
        ReuseDecision::CreateFresh => {
            run_git(
                &sup.repo_root,
                &["worktree", "add", "-B", branch, &worktree_path.to_string_lossy(), "main"],
            );
        }
    }
    Ok(())
}

fn run_git(repo_root: &Path, args: &[&str]) {
    let _ = Command::new("git").args(args).current_dir(repo_root).status();
}

/// Rewrite an `ssh://`/`git@` origin remote to `https://`, so a worker
/// running with no interactive terminal can still push using a cached
/// credential helper rather than hanging on a key passphrase prompt.
fn rewrite_remote_to_https(repo_root: &Path) {
    let Ok(output) = Command::new("git").args(["remote", "get-url", "origin"]).current_dir(repo_root).output() else {
        return;
    };
    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if let Some(https) = ssh_to_https(&url) {
        let _ = Command::new("git")
            .args(["remote", "set-url", "origin", &https])
            .current_dir(repo_root)
            .status();
    }
}

fn ssh_to_https(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("git@") {
        let (host, path) = rest.split_once(':')?;
        return Some(format!("https://{host}/{path}"));
    }
    if let Some(rest) = url.strip_prefix("ssh://git@") {
        return Some(format!("https://{rest}"));
    }
    None
}

fn repo_slug(repo_root: &Path) -> String {
    repo_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn spawn_worker(
    worktree_path: &Path,
    description: &str,
    stdout: fs::File,
    stderr: fs::File,
) -> anyhow::Result<u32> {
    let child = Command::new("worker")
        .arg(description)
        .current_dir(worktree_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()?;
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_to_https_rewrites_scp_style_url() {
        assert_eq!(
            ssh_to_https("git@github.com:acme/widgets.git"),
            Some("https://github.com/acme/widgets.git".to_string())
        );
    }

    #[test]
    fn ssh_to_https_rewrites_ssh_scheme_url() {
        assert_eq!(
            ssh_to_https("ssh://git@github.com/acme/widgets.git"),
            Some("https://github.com/acme/widgets.git".to_string())
        );
    }

    #[test]
    fn ssh_to_https_leaves_already_https_url_alone() {
        assert_eq!(ssh_to_https("https://github.com/acme/widgets.git"), None);
    }

    #[test]
    fn repo_slug_uses_final_path_component() {
        assert_eq!(repo_slug(Path::new("/home/ci/checkouts/widgets")), "widgets");
    }

    struct AlwaysHealthy;
    impl ModelHealthProbe for AlwaysHealthy {
        fn probe(&self, _model: &str) -> bool {
            true
        }
    }

    struct AlwaysUnhealthy;
    impl ModelHealthProbe for AlwaysUnhealthy {
        fn probe(&self, _model: &str) -> bool {
            false
        }
    }

    #[test]
    fn probes_are_distinguishable() {
        assert!(AlwaysHealthy.probe("haiku"));
        assert!(!AlwaysUnhealthy.probe("haiku"));
    }
}
