use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use foreman::evaluator::CliAiEvaluator;
use foreman::model_resolver::CliModelHealthProbe;
use foreman::pulse;
use foreman::supervisor::{PulseState, Supervisor};
use foreman::{config, todo_registry};
use foreman_forge::NullForge;
use foreman_notify::{FanOutNotifier, NotifyConfig};
use foreman_store::Store;
use foreman_types::Task;

#[derive(Parser, Debug)]
#[command(name = "foreman", version)]
#[command(about = "Autonomous multi-task orchestrator for AI coding workers")]
struct Cli {
    /// Repository root the supervisor operates on (must contain TODO.md).
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Supervisor state directory (default: $FOREMAN_HOME or ~/.foreman).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a task from TODO.md into the store as `queued`.
    Add {
        /// Task id as it appears in TODO.md (e.g. t123 or t123.4).
        task_id: String,
        /// Explicit model override (priority 1 of the resolver chain).
        #[arg(long)]
        model: Option<String>,
    },
    /// Cancel a task: terminal `cancelled`, regardless of current status.
    Cancel {
        task_id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Run one pulse cycle: the single entrypoint a cron job calls.
    Pulse,
    /// Print a one-line summary of every non-terminal task.
    Status,
    /// Print environment, state-directory, and lock diagnostics.
    Doctor,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let repo_root = cli.repo.canonicalize().unwrap_or(cli.repo.clone());
    let state_dir = cli.state_dir.unwrap_or_else(config::foreman_home);

    let result = match cli.cmd {
        Commands::Add { task_id, model } => run_add(&repo_root, &state_dir, &task_id, model),
        Commands::Cancel { task_id, reason } => run_cancel(&repo_root, &state_dir, &task_id, &reason),
        Commands::Pulse => run_pulse_once(&repo_root, &state_dir),
        Commands::Status => run_status(&repo_root, &state_dir),
        Commands::Doctor => run_doctor(&repo_root, &state_dir),
    };

    if let Err(err) = &result {
        eprintln!("error: {err:#}");
    }
    result
}

fn open_store(state_dir: &std::path::Path) -> Result<Store> {
    let db_path = state_dir.join("supervisor.db");
    Store::open(db_path).context("opening supervisor store")
}

fn build_supervisor(repo_root: &std::path::Path, state_dir: &std::path::Path) -> Result<Supervisor> {
    let cfg = config::load(repo_root)?;
    let store = open_store(state_dir)?;
    let identity = config::resolve_identity(&cfg.dispatch.identity_env, None);
    let notifier = Box::new(FanOutNotifier::new(NotifyConfig::default()));
    let forge = Box::new(NullForge::new());
    Ok(Supervisor::new(
        store,
        forge,
        notifier,
        cfg,
        repo_root.to_path_buf(),
        state_dir.to_path_buf(),
        identity,
    ))
}

/// Find the TODO.md entry for `task_id` and return its description, if any.
fn find_todo_description(repo_root: &std::path::Path, task_id: &str) -> Result<Option<String>> {
    let todo_path = repo_root.join("TODO.md");
    if !todo_path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&todo_path).context("reading TODO.md")?;
    for line in content.lines() {
        if let Some(entry) = todo_registry::parse_line(line) {
            if entry.task_id == task_id {
                return Ok(Some(entry.description));
            }
        }
    }
    Ok(None)
}

fn run_add(repo_root: &std::path::Path, state_dir: &std::path::Path, task_id: &str, model: Option<String>) -> Result<()> {
    let store = open_store(state_dir)?;
    if store.get_task(task_id)?.is_some() {
        anyhow::bail!("task {task_id} already exists in the store");
    }
    let description = find_todo_description(repo_root, task_id)?
        .with_context(|| format!("task {task_id} not found in TODO.md"))?;

    let mut task = Task::new(task_id, repo_root.to_path_buf(), description);
    task.model = model;
    store.insert_task(&task)?;
    println!("{task_id}: queued ({})", task.description);
    Ok(())
}

fn run_cancel(repo_root: &std::path::Path, state_dir: &std::path::Path, task_id: &str, reason: &str) -> Result<()> {
    let _ = repo_root;
    let store = open_store(state_dir)?;
    store.require_task(task_id)?;
    store.transition(
        task_id,
        foreman_types::TaskStatus::Cancelled,
        Some(reason),
        foreman_store::TransitionFields::default(),
    )?;
    println!("{task_id}: cancelled ({reason})");
    Ok(())
}

fn run_pulse_once(repo_root: &std::path::Path, state_dir: &std::path::Path) -> Result<()> {
    let sup = build_supervisor(repo_root, state_dir)?;
    let mut pulse_state = PulseState::new();
    let health = CliModelHealthProbe {
        timeout: sup.config.dispatch.health_probe_timeout,
    };
    let ai_evaluator = CliAiEvaluator {
        model: sup.config.evaluator.ai_evaluator_model.clone(),
        timeout: sup.config.evaluator.ai_evaluator_timeout,
    };
    let report = pulse::run_pulse(&sup, &mut pulse_state, &health, Some(&ai_evaluator))?;

    println!(
        "dispatched={} evaluated={} merged={} deployed={} verified={} hung_reconciled={}",
        report.dispatched, report.evaluated, report.merged, report.deployed, report.verified, report.hung_reconciled
    );
    for err in &report.errors {
        eprintln!("phase error: {err}");
    }
    Ok(())
}

fn run_status(repo_root: &std::path::Path, state_dir: &std::path::Path) -> Result<()> {
    let _ = repo_root;
    let store = open_store(state_dir)?;
    let tasks = store.list_nonterminal()?;
    if tasks.is_empty() {
        println!("no non-terminal tasks");
        return Ok(());
    }
    for task in tasks {
        println!(
            "{:<16} {:<12} retries={}/{} model={}",
            task.id,
            task.status.as_str(),
            task.retries,
            task.max_retries,
            task.model.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn run_doctor(repo_root: &std::path::Path, state_dir: &std::path::Path) -> Result<()> {
    println!("repo_root: {}", repo_root.display());
    println!("state_dir: {}", state_dir.display());

    let cfg = config::load(repo_root)?;
    println!("identity: {}", config::resolve_identity(&cfg.dispatch.identity_env, None));
    println!("max_retries: {}", cfg.retry.max_retries);
    println!("hang_budget: {:?}", cfg.hang.hang_budget);

    match open_store(state_dir) {
        Ok(store) => println!("db_path: {}", store.db_path().display()),
        Err(err) => eprintln!("warn: could not open store: {err:#}"),
    }

    match foreman_lock::PulseLock::acquire(state_dir, cfg.lock.stale_timeout) {
        Ok(mut lock) => {
            println!("lock: currently free (acquired for this check)");
            let _ = lock.release();
        }
        Err(foreman_lock::LockError::Held { pid, hostname, acquired_at }) => {
            println!("lock: held by pid={pid} host={hostname} since {acquired_at}");
        }
        Err(err) => eprintln!("warn: lock check failed: {err:#}"),
    }

    print_cmd_version("git");
    print_cmd_version("worker");

    Ok(())
}

fn print_cmd_version(cmd: &str) {
    match Command::new(cmd).arg("--version").output() {
        Ok(out) if out.status.success() => {
            let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
            println!("{cmd}: {s}");
        }
        Ok(out) => {
            eprintln!(
                "warn: {cmd} --version failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Err(err) => eprintln!("warn: unable to run {cmd} --version: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_todo_description_reads_matching_task_id() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(
            td.path().join("TODO.md"),
            "- [ ] t001 Add retry logic\n- [ ] t002 Fix flaky test\n",
        )
        .unwrap();
        assert_eq!(
            find_todo_description(td.path(), "t001").unwrap(),
            Some("Add retry logic".to_string())
        );
        assert_eq!(find_todo_description(td.path(), "t999").unwrap(), None);
    }

    #[test]
    fn find_todo_description_returns_none_without_todo_file() {
        let td = tempfile::tempdir().unwrap();
        assert_eq!(find_todo_description(td.path(), "t001").unwrap(), None);
    }

    #[test]
    fn run_add_rejects_unknown_task_id() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("TODO.md"), "- [ ] t001 known task\n").unwrap();
        let state_dir = td.path().join("state");
        let err = run_add(td.path(), &state_dir, "t404", None).unwrap_err();
        assert!(err.to_string().contains("t404"));
    }

    #[test]
    fn run_add_inserts_queued_task_from_todo() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("TODO.md"), "- [ ] t001 Add retry logic\n").unwrap();
        let state_dir = td.path().join("state");
        run_add(td.path(), &state_dir, "t001", Some("opus".to_string())).unwrap();

        let store = open_store(&state_dir).unwrap();
        let task = store.require_task("t001").unwrap();
        assert_eq!(task.status, foreman_types::TaskStatus::Queued);
        assert_eq!(task.model.as_deref(), Some("opus"));
    }

    #[test]
    fn run_add_rejects_duplicate_task() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("TODO.md"), "- [ ] t001 Add retry logic\n").unwrap();
        let state_dir = td.path().join("state");
        run_add(td.path(), &state_dir, "t001", None).unwrap();
        let err = run_add(td.path(), &state_dir, "t001", None).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
