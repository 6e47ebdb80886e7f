//! The authoritative system of record: an embedded SQLite database behind a
//! small transactional API, matching the teacher's `borg-core::db::Db`
//! shape (a `Mutex<Connection>`, `params!`/`query_row`/`query_map` call
//! sites) generalized from a single coding-agent pipeline to the full task
//! state machine, batches, and the two append-only ledgers (`state_log`,
//! `proof_log`).
//!
//! Every connection runs with `PRAGMA journal_mode=WAL` and a 5-second
//! busy-timeout. Schema evolution beyond the bundled baseline goes through
//! [`migrate::safe_migrate`]: backup, migrate, verify row counts, roll back
//! on any shrinkage.

mod migrate;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use foreman_types::{
    Batch, BatchMembership, BatchStatus, ProofEvent, ProofLogEntry, ReleaseType, StateLogEntry,
    Task, TaskStatus, VALID_TRANSITIONS,
};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

pub use migrate::{backup, prune_backups, safe_migrate};

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("migration failed: {reason}")]
    Migration { reason: String },
    #[error("invalid transition for task {task}: {from:?} -> {to:?} is not in the whitelist")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("no row found for {id}")]
    NotFound { id: String },
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Side-band fields a transition may set alongside the status change
/// (§4.2). Fields left `None` are untouched; clearing `worktree`/`session`
/// on terminal transitions happens automatically inside [`Store::transition`].
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub session: Option<String>,
    pub worktree: Option<PathBuf>,
    pub branch: Option<String>,
    pub log_file: Option<PathBuf>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
}

pub struct Store {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Store {
    /// Open (creating if absent) the database at `db_path`, set its
    /// pragmas, and apply the bundled baseline schema.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run a schema migration under the backup/verify/rollback protocol.
    pub fn safe_migrate(
        &self,
        reason: &str,
        tables: &[&str],
        migration: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<()>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        migrate::safe_migrate(&mut conn, &self.db_path, reason, tables, migration)
    }

    // ---- tasks -------------------------------------------------------

    pub fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO tasks (id, repo_root, description, status, session, worktree, branch, \
             log_file, retries, max_retries, escalation_depth, max_escalation_depth, model, \
             last_error, pr_url, issue_url, diagnostic_of, metadata, created_at, started_at, \
             completed_at, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)",
            params![
                task.id,
                path_str(&task.repo_root),
                task.description,
                task.status.as_str(),
                task.session,
                task.worktree.as_deref().map(path_str),
                task.branch,
                task.log_file.as_deref().map(path_str),
                task.retries,
                task.max_retries,
                task.escalation_depth,
                task.max_escalation_depth,
                task.model,
                task.last_error,
                task.pr_url,
                task.issue_url,
                task.diagnostic_of,
                task.metadata.to_string(),
                to_rfc3339(task.created_at),
                task.started_at.map(to_rfc3339),
                task.completed_at.map(to_rfc3339),
                to_rfc3339(task.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        fetch_task(&conn, id)
    }

    pub fn require_task(&self, id: &str) -> Result<Task, StoreError> {
        self.get_task(id)?.ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    /// All tasks currently in one of `statuses`, ordered by `created_at`.
    pub fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status IN ({}) ORDER BY created_at ASC",
            statuses.iter().map(|_| "?").collect::<Vec<_>>().join(",")
        ))?;
        let params = rusqlite::params_from_iter(statuses.iter().map(|s| s.as_str()));
        let tasks = stmt
            .query_map(params, row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Every task not yet in a terminal status.
    pub fn list_nonterminal(&self) -> Result<Vec<Task>, StoreError> {
        use TaskStatus::*;
        self.list_by_status(&[
            Queued,
            Dispatched,
            Running,
            Evaluating,
            Retrying,
            Blocked,
            Complete,
            PrReview,
            ReviewTriage,
            Merging,
            Deploying,
            Deployed,
            Verifying,
            VerifyFailed,
        ])
    }

    /// The sibling tasks sharing `t.parent_prefix()`, excluding `t` itself.
    pub fn siblings_of(&self, task: &Task) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id != ?1 ORDER BY id ASC"
        ))?;
        let prefix = task.parent_prefix().to_string();
        let tasks = stmt
            .query_map(params![task.id], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|t: &Task| t.parent_prefix() == prefix)
            .collect();
        Ok(tasks)
    }

    /// The diagnostic child of `parent_id`, if one is currently active
    /// (not terminal).
    pub fn active_diagnostic_of(&self, parent_id: &str) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE diagnostic_of = ?1 ORDER BY created_at DESC"
        ))?;
        let tasks = stmt
            .query_map(params![parent_id], row_to_task)?
            .collect::<rusqlite::Result<Vec<Task>>>()?;
        Ok(tasks.into_iter().find(|t| !t.status.is_terminal()))
    }

    /// Validate and apply `(from, to)` for `task_id`, updating side-band
    /// fields, writing a `state_log` row, and — for significant transitions
    /// — a `proof_log` row. Clears `worktree`/`session` automatically when
    /// landing on `deployed`/`verified`/`failed`/`cancelled` (§3).
    pub fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        reason: Option<&str>,
        fields: TransitionFields,
    ) -> Result<Task, StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;

        let mut task = fetch_task(&tx, task_id)?
            .ok_or_else(|| StoreError::NotFound { id: task_id.to_string() })?;
        let from = task.status;

        if !VALID_TRANSITIONS.contains(&(from, to)) {
            return Err(StoreError::InvalidTransition {
                task: task_id.to_string(),
                from,
                to,
            });
        }

        if let Some(session) = fields.session {
            task.session = Some(session);
        }
        if let Some(worktree) = fields.worktree {
            task.worktree = Some(worktree);
        }
        if let Some(branch) = fields.branch {
            task.branch = Some(branch);
        }
        if let Some(log_file) = fields.log_file {
            task.log_file = Some(log_file);
        }
        if let Some(pr_url) = fields.pr_url {
            task.pr_url = Some(pr_url);
        }
        if let Some(error) = fields.error {
            task.last_error = Some(error);
        }

        let now = Utc::now();
        task.status = to;
        task.updated_at = now;
        if to == TaskStatus::Dispatched && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if to == TaskStatus::Retrying {
            task.retries += 1;
        }
        if to.is_terminal() {
            task.completed_at = Some(now);
        }
        if matches!(
            to,
            TaskStatus::Deployed | TaskStatus::Verified | TaskStatus::Failed | TaskStatus::Cancelled
        ) {
            task.worktree = None;
            task.session = None;
        }

        persist_task(&tx, &task)?;
        insert_state_log_row(&tx, task_id, Some(from), to, reason, now)?;
        if TaskStatus::is_significant_transition(from, to) {
            insert_proof_log_row(
                &tx,
                task_id,
                ProofEvent::Transition,
                to.as_str(),
                &format!("{}->{}", from.as_str(), to.as_str()),
                reason.unwrap_or(""),
                "cmd_transition",
                task.pr_url.as_deref(),
                None,
                now,
            )?;
        }

        tx.commit()?;
        Ok(task)
    }

    /// Escalate `task_id` to `model` via the `Retrying` state, bumping
    /// `escalation_depth` the same way a normal retry bumps `retries`. Used
    /// by the self-healer's quality-gate escalation path: the gate runs
    /// while a task is `Evaluating`, so the only legal way off of a
    /// rejected `complete` verdict is the ordinary retry edge, just with
    /// the model tier raised before the task is requeued.
    pub fn escalate_and_requeue(&self, task_id: &str, model: &str) -> Result<Task, StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;

        let mut task = fetch_task(&tx, task_id)?
            .ok_or_else(|| StoreError::NotFound { id: task_id.to_string() })?;
        let from = task.status;
        let to = TaskStatus::Retrying;
        if !VALID_TRANSITIONS.contains(&(from, to)) {
            return Err(StoreError::InvalidTransition { task: task_id.to_string(), from, to });
        }

        let now = Utc::now();
        task.model = Some(model.to_string());
        task.escalation_depth += 1;
        task.retries += 1;
        task.status = to;
        task.updated_at = now;

        persist_task(&tx, &task)?;
        insert_state_log_row(&tx, task_id, Some(from), to, Some("quality_gate_escalation"), now)?;
        insert_proof_log_row(
            &tx,
            task_id,
            ProofEvent::Escalate,
            "quality_gate",
            &format!("escalated_to_{model}"),
            "quality_gate_escalation",
            "self_heal",
            None,
            None,
            now,
        )?;

        tx.commit()?;
        Ok(task)
    }

    // ---- batches -------------------------------------------------------

    pub fn insert_batch(&self, batch: &Batch) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO batches (name, base_concurrency, max_concurrency, max_load_factor, \
             status, release_on_complete, release_type, skip_quality_gate, created_at, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                batch.name,
                batch.base_concurrency,
                batch.max_concurrency,
                batch.max_load_factor,
                batch_status_str(batch.status),
                batch.release_on_complete,
                release_type_str(batch.release_type),
                batch.skip_quality_gate,
                to_rfc3339(batch.created_at),
                to_rfc3339(batch.updated_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_batch(&self, id: i64) -> Result<Option<Batch>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1"),
            params![id],
            row_to_batch,
        )
        .optional()
        .map_err(StoreError::Sql)
    }

    pub fn get_batch_by_name(&self, name: &str) -> Result<Option<Batch>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE name = ?1"),
            params![name],
            row_to_batch,
        )
        .optional()
        .map_err(StoreError::Sql)
    }

    pub fn list_active_batches(&self) -> Result<Vec<Batch>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE status = 'active' ORDER BY id ASC"
        ))?;
        let batches = stmt
            .query_map([], row_to_batch)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(batches)
    }

    pub fn set_batch_status(&self, batch_id: i64, status: BatchStatus) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE batches SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![batch_status_str(status), to_rfc3339(Utc::now()), batch_id],
        )?;
        Ok(())
    }

    pub fn add_membership(&self, membership: &BatchMembership) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR REPLACE INTO batch_memberships (batch_id, task_id, position) \
             VALUES (?1, ?2, ?3)",
            params![membership.batch_id, membership.task_id, membership.position],
        )?;
        Ok(())
    }

    /// Member task ids of `batch_id` in dispatch-priority order.
    pub fn batch_task_ids(&self, batch_id: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT task_id FROM batch_memberships WHERE batch_id = ?1 ORDER BY position ASC",
        )?;
        let ids = stmt
            .query_map(params![batch_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Whether every member of `batch_id` has reached a terminal status.
    pub fn batch_is_complete(&self, batch_id: i64) -> Result<bool, StoreError> {
        let ids = self.batch_task_ids(batch_id)?;
        if ids.is_empty() {
            return Ok(false);
        }
        for id in ids {
            let Some(task) = self.get_task(&id)? else {
                continue;
            };
            if !matches!(
                task.status,
                TaskStatus::Deployed
                    | TaskStatus::Verified
                    | TaskStatus::Merged
                    | TaskStatus::Failed
                    | TaskStatus::Cancelled
            ) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ---- state log -----------------------------------------------------

    pub fn state_log_for(&self, task_id: &str) -> Result<Vec<StateLogEntry>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, task_id, from_status, to_status, reason, created_at \
             FROM state_log WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![task_id], row_to_state_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- proof log -------------------------------------------------------

    /// Insert a proof-log row directly (used by the evaluator, lifecycle
    /// controller, self-healer, and quality gate for decisions that don't
    /// ride along with a `transition` call). Callers in `foreman` treat
    /// this as best-effort: a failure here must never abort the pulse.
    #[allow(clippy::too_many_arguments)]
    pub fn record_proof(
        &self,
        task_id: &str,
        event: ProofEvent,
        stage: &str,
        decision: &str,
        evidence: &str,
        decision_maker: &str,
        pr_url: Option<&str>,
        duration_secs: Option<f64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        insert_proof_log_row(
            &conn,
            task_id,
            event,
            stage,
            decision,
            evidence,
            decision_maker,
            pr_url,
            duration_secs,
            Utc::now(),
        )
    }

    pub fn proof_log_for(&self, task_id: &str) -> Result<Vec<ProofLogEntry>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROOF_COLUMNS} FROM proof_log WHERE task_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map(params![task_id], row_to_proof)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Stage-duration inference (§4.3): the gap between a new entry for
    /// `(task_id, stage)` and the previous one, or `None` if this is the
    /// first entry for that stage.
    pub fn stage_duration(&self, task_id: &str, stage: &str) -> Result<Option<f64>, StoreError> {
        let entries = self.proof_log_for(task_id)?;
        let mut matching: Vec<&ProofLogEntry> =
            entries.iter().filter(|e| e.stage == stage).collect();
        matching.sort_by_key(|e| e.created_at);
        if matching.len() < 2 {
            return Ok(None);
        }
        let last_two = &matching[matching.len() - 2..];
        let delta = last_two[1].created_at - last_two[0].created_at;
        Ok(Some(delta.num_milliseconds() as f64 / 1000.0))
    }
}

const TASK_COLUMNS: &str = "id, repo_root, description, status, session, worktree, branch, \
    log_file, retries, max_retries, escalation_depth, max_escalation_depth, model, last_error, \
    pr_url, issue_url, diagnostic_of, metadata, created_at, started_at, completed_at, updated_at";

const BATCH_COLUMNS: &str = "id, name, base_concurrency, max_concurrency, max_load_factor, \
    status, release_on_complete, release_type, skip_quality_gate, created_at, updated_at";

const PROOF_COLUMNS: &str = "id, task_id, event, stage, decision, evidence, decision_maker, \
    pr_url, duration_secs, metadata, created_at";

fn fetch_task(conn: &Connection, id: &str) -> Result<Option<Task>, StoreError> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        row_to_task,
    )
    .optional()
    .map_err(StoreError::Sql)
}

fn persist_task(conn: &Connection, task: &Task) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE tasks SET repo_root=?2, description=?3, status=?4, session=?5, worktree=?6, \
         branch=?7, log_file=?8, retries=?9, max_retries=?10, escalation_depth=?11, \
         max_escalation_depth=?12, model=?13, last_error=?14, pr_url=?15, issue_url=?16, \
         diagnostic_of=?17, metadata=?18, created_at=?19, started_at=?20, completed_at=?21, \
         updated_at=?22 WHERE id=?1",
        params![
            task.id,
            path_str(&task.repo_root),
            task.description,
            task.status.as_str(),
            task.session,
            task.worktree.as_deref().map(path_str),
            task.branch,
            task.log_file.as_deref().map(path_str),
            task.retries,
            task.max_retries,
            task.escalation_depth,
            task.max_escalation_depth,
            task.model,
            task.last_error,
            task.pr_url,
            task.issue_url,
            task.diagnostic_of,
            task.metadata.to_string(),
            to_rfc3339(task.created_at),
            task.started_at.map(to_rfc3339),
            task.completed_at.map(to_rfc3339),
            to_rfc3339(task.updated_at),
        ],
    )?;
    Ok(())
}

fn insert_state_log_row(
    conn: &Connection,
    task_id: &str,
    from: Option<TaskStatus>,
    to: TaskStatus,
    reason: Option<&str>,
    when: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO state_log (task_id, from_status, to_status, reason, created_at) \
         VALUES (?1,?2,?3,?4,?5)",
        params![
            task_id,
            from.map(TaskStatus::as_str),
            to.as_str(),
            reason,
            to_rfc3339(when),
        ],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn insert_proof_log_row(
    conn: &Connection,
    task_id: &str,
    event: ProofEvent,
    stage: &str,
    decision: &str,
    evidence: &str,
    decision_maker: &str,
    pr_url: Option<&str>,
    duration_secs: Option<f64>,
    when: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO proof_log (task_id, event, stage, decision, evidence, decision_maker, \
         pr_url, duration_secs, metadata, created_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,NULL,?9)",
        params![
            task_id,
            event_str(event),
            stage,
            decision,
            evidence,
            decision_maker,
            pr_url,
            duration_secs,
            to_rfc3339(when),
        ],
    )?;
    Ok(())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(3)?;
    let metadata_str: String = row.get(17)?;
    Ok(Task {
        id: row.get(0)?,
        repo_root: PathBuf::from(row.get::<_, String>(1)?),
        description: row.get(2)?,
        status: TaskStatus::from_str_opt(&status_str).unwrap_or(TaskStatus::Queued),
        session: row.get(4)?,
        worktree: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
        branch: row.get(6)?,
        log_file: row.get::<_, Option<String>>(7)?.map(PathBuf::from),
        retries: row.get(8)?,
        max_retries: row.get(9)?,
        escalation_depth: row.get(10)?,
        max_escalation_depth: row.get(11)?,
        model: row.get(12)?,
        last_error: row.get(13)?,
        pr_url: row.get(14)?,
        issue_url: row.get(15)?,
        diagnostic_of: row.get(16)?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
        created_at: parse_rfc3339(row.get::<_, String>(18)?),
        started_at: row.get::<_, Option<String>>(19)?.map(parse_rfc3339),
        completed_at: row.get::<_, Option<String>>(20)?.map(parse_rfc3339),
        updated_at: parse_rfc3339(row.get::<_, String>(21)?),
    })
}

fn row_to_batch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Batch> {
    let status_str: String = row.get(5)?;
    let release_type_str: String = row.get(7)?;
    Ok(Batch {
        id: row.get(0)?,
        name: row.get(1)?,
        base_concurrency: row.get(2)?,
        max_concurrency: row.get(3)?,
        max_load_factor: row.get(4)?,
        status: batch_status_from_str(&status_str),
        release_on_complete: row.get(6)?,
        release_type: release_type_from_str(&release_type_str),
        skip_quality_gate: row.get(8)?,
        created_at: parse_rfc3339(row.get::<_, String>(9)?),
        updated_at: parse_rfc3339(row.get::<_, String>(10)?),
    })
}

fn row_to_state_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateLogEntry> {
    Ok(StateLogEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        from_status: row
            .get::<_, Option<String>>(2)?
            .and_then(|s| TaskStatus::from_str_opt(&s)),
        to_status: TaskStatus::from_str_opt(&row.get::<_, String>(3)?).unwrap_or(TaskStatus::Queued),
        reason: row.get(4)?,
        created_at: parse_rfc3339(row.get::<_, String>(5)?),
    })
}

fn row_to_proof(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProofLogEntry> {
    let event_str: String = row.get(2)?;
    Ok(ProofLogEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        event: event_from_str(&event_str),
        stage: row.get(3)?,
        decision: row.get(4)?,
        evidence: row.get(5)?,
        decision_maker: row.get(6)?,
        pr_url: row.get(7)?,
        duration_secs: row.get(8)?,
        metadata: row
            .get::<_, Option<String>>(9)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_rfc3339(row.get::<_, String>(10)?),
    })
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().to_string()
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_rfc3339(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn batch_status_str(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Active => "active",
        BatchStatus::Paused => "paused",
        BatchStatus::Complete => "complete",
        BatchStatus::Cancelled => "cancelled",
    }
}

fn batch_status_from_str(s: &str) -> BatchStatus {
    match s {
        "paused" => BatchStatus::Paused,
        "complete" => BatchStatus::Complete,
        "cancelled" => BatchStatus::Cancelled,
        _ => BatchStatus::Active,
    }
}

fn release_type_str(t: ReleaseType) -> &'static str {
    match t {
        ReleaseType::Major => "major",
        ReleaseType::Minor => "minor",
        ReleaseType::Patch => "patch",
    }
}

fn release_type_from_str(s: &str) -> ReleaseType {
    match s {
        "major" => ReleaseType::Major,
        "minor" => ReleaseType::Minor,
        _ => ReleaseType::Patch,
    }
}

fn event_str(event: ProofEvent) -> &'static str {
    match event {
        ProofEvent::Dispatch => "dispatch",
        ProofEvent::Evaluate => "evaluate",
        ProofEvent::Complete => "complete",
        ProofEvent::Retry => "retry",
        ProofEvent::Blocked => "blocked",
        ProofEvent::Failed => "failed",
        ProofEvent::VerifyPass => "verify_pass",
        ProofEvent::VerifyFail => "verify_fail",
        ProofEvent::PrReview => "pr_review",
        ProofEvent::Merge => "merge",
        ProofEvent::Deploy => "deploy",
        ProofEvent::QualityGate => "quality_gate",
        ProofEvent::Escalate => "escalate",
        ProofEvent::SelfHeal => "self_heal",
        ProofEvent::DeliverableVerified => "deliverable_verified",
        ProofEvent::AutoRecover => "auto_recover",
        ProofEvent::Transition => "transition",
    }
}

fn event_from_str(s: &str) -> ProofEvent {
    match s {
        "dispatch" => ProofEvent::Dispatch,
        "evaluate" => ProofEvent::Evaluate,
        "complete" => ProofEvent::Complete,
        "retry" => ProofEvent::Retry,
        "blocked" => ProofEvent::Blocked,
        "failed" => ProofEvent::Failed,
        "verify_pass" => ProofEvent::VerifyPass,
        "verify_fail" => ProofEvent::VerifyFail,
        "pr_review" => ProofEvent::PrReview,
        "merge" => ProofEvent::Merge,
        "deploy" => ProofEvent::Deploy,
        "quality_gate" => ProofEvent::QualityGate,
        "escalate" => ProofEvent::Escalate,
        "self_heal" => ProofEvent::SelfHeal,
        "deliverable_verified" => ProofEvent::DeliverableVerified,
        "auto_recover" => ProofEvent::AutoRecover,
        _ => ProofEvent::Transition,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, Store) {
        let td = tempdir().unwrap();
        let store = Store::open(td.path().join("supervisor.db")).unwrap();
        (td, store)
    }

    fn sample_task(id: &str) -> Task {
        Task::new(id, PathBuf::from("/repo"), "do the thing")
    }

    #[test]
    fn insert_and_get_task_round_trips() {
        let (_td, store) = open_store();
        store.insert_task(&sample_task("t1")).unwrap();
        let fetched = store.require_task("t1").unwrap();
        assert_eq!(fetched.status, TaskStatus::Queued);
        assert_eq!(fetched.description, "do the thing");
    }

    #[test]
    fn get_missing_task_returns_none() {
        let (_td, store) = open_store();
        assert!(store.get_task("nope").unwrap().is_none());
    }

    #[test]
    fn transition_rejects_illegal_edge() {
        let (_td, store) = open_store();
        store.insert_task(&sample_task("t1")).unwrap();
        let result = store.transition("t1", TaskStatus::Merged, None, TransitionFields::default());
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[test]
    fn transition_sets_started_at_exactly_once_and_writes_state_log() {
        let (_td, store) = open_store();
        store.insert_task(&sample_task("t1")).unwrap();
        let t1 = store
            .transition("t1", TaskStatus::Dispatched, None, TransitionFields::default())
            .unwrap();
        assert!(t1.started_at.is_some());
        let first_started = t1.started_at.unwrap();

        store
            .transition("t1", TaskStatus::Running, None, TransitionFields::default())
            .unwrap();
        store
            .transition(
                "t1",
                TaskStatus::Evaluating,
                None,
                TransitionFields::default(),
            )
            .unwrap();
        store
            .transition(
                "t1",
                TaskStatus::Retrying,
                Some("clean_exit_no_signal"),
                TransitionFields::default(),
            )
            .unwrap();
        let requeued = store
            .transition("t1", TaskStatus::Queued, None, TransitionFields::default())
            .unwrap();
        assert_eq!(requeued.retries, 1);

        let redispatched = store
            .transition("t1", TaskStatus::Dispatched, None, TransitionFields::default())
            .unwrap();
        assert_eq!(redispatched.started_at, Some(first_started));

        let log = store.state_log_for("t1").unwrap();
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn terminal_transition_clears_worktree_and_session() {
        let (_td, store) = open_store();
        store.insert_task(&sample_task("t1")).unwrap();
        store
            .transition(
                "t1",
                TaskStatus::Dispatched,
                None,
                TransitionFields {
                    session: Some("pid:123".to_string()),
                    worktree: Some(PathBuf::from("/wt/t1")),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .transition("t1", TaskStatus::Failed, Some("boom"), TransitionFields::default())
            .unwrap();
        let t1 = store.require_task("t1").unwrap();
        assert!(t1.worktree.is_none());
        assert!(t1.session.is_none());
        assert!(t1.completed_at.is_some());
    }

    #[test]
    fn significant_transition_writes_proof_log() {
        let (_td, store) = open_store();
        store.insert_task(&sample_task("t1")).unwrap();
        store
            .transition("t1", TaskStatus::Dispatched, None, TransitionFields::default())
            .unwrap();
        let proof = store.proof_log_for("t1").unwrap();
        assert_eq!(proof.len(), 1);
        assert_eq!(proof[0].decision, "queued->dispatched");
    }

    #[test]
    fn micro_transition_does_not_write_proof_log() {
        let (_td, store) = open_store();
        store.insert_task(&sample_task("t1")).unwrap();
        store
            .transition("t1", TaskStatus::Dispatched, None, TransitionFields::default())
            .unwrap();
        store
            .transition("t1", TaskStatus::Running, None, TransitionFields::default())
            .unwrap();
        let proof = store.proof_log_for("t1").unwrap();
        // Only the dispatched transition is significant; running is not.
        assert_eq!(proof.len(), 1);
    }

    #[test]
    fn batch_membership_orders_by_position() {
        let (_td, store) = open_store();
        for id in ["t300.1", "t300.2", "t300.3"] {
            store.insert_task(&sample_task(id)).unwrap();
        }
        let batch_id = store.insert_batch(&Batch::new("release-42", 2)).unwrap();
        for (i, id) in ["t300.3", "t300.1", "t300.2"].iter().enumerate() {
            store
                .add_membership(&BatchMembership {
                    batch_id,
                    task_id: id.to_string(),
                    position: i as i64,
                })
                .unwrap();
        }
        let ids = store.batch_task_ids(batch_id).unwrap();
        assert_eq!(ids, vec!["t300.3", "t300.1", "t300.2"]);
    }

    #[test]
    fn batch_is_complete_only_when_every_member_terminal() {
        let (_td, store) = open_store();
        store.insert_task(&sample_task("t1")).unwrap();
        store.insert_task(&sample_task("t2")).unwrap();
        let batch_id = store.insert_batch(&Batch::new("b", 1)).unwrap();
        for (i, id) in ["t1", "t2"].iter().enumerate() {
            store
                .add_membership(&BatchMembership {
                    batch_id,
                    task_id: id.to_string(),
                    position: i as i64,
                })
                .unwrap();
        }
        assert!(!store.batch_is_complete(batch_id).unwrap());

        store
            .transition("t1", TaskStatus::Cancelled, None, TransitionFields::default())
            .unwrap();
        assert!(!store.batch_is_complete(batch_id).unwrap());

        store
            .transition("t2", TaskStatus::Cancelled, None, TransitionFields::default())
            .unwrap();
        assert!(store.batch_is_complete(batch_id).unwrap());
    }

    #[test]
    fn siblings_of_filters_by_dotted_prefix() {
        let (_td, store) = open_store();
        for id in ["t300.1", "t300.2", "t301.1"] {
            store.insert_task(&sample_task(id)).unwrap();
        }
        let t = store.require_task("t300.1").unwrap();
        let siblings = store.siblings_of(&t).unwrap();
        assert_eq!(siblings.len(), 1);
        assert_eq!(siblings[0].id, "t300.2");
    }

    proptest::proptest! {
        #[test]
        fn retries_never_drop_on_requeue(cycles in 1usize..4) {
            let td = tempdir().unwrap();
            let store = Store::open(td.path().join("s.db")).unwrap();
            store.insert_task(&sample_task("t1")).unwrap();
            let mut last_retries = 0;
            for _ in 0..cycles {
                store.transition("t1", TaskStatus::Dispatched, None, TransitionFields::default()).unwrap();
                store.transition("t1", TaskStatus::Running, None, TransitionFields::default()).unwrap();
                store.transition("t1", TaskStatus::Evaluating, None, TransitionFields::default()).unwrap();
                let t = store.transition("t1", TaskStatus::Retrying, None, TransitionFields::default()).unwrap();
                prop_assert!(t.retries >= last_retries);
                last_retries = t.retries;
                store.transition("t1", TaskStatus::Queued, None, TransitionFields::default()).unwrap();
            }
        }
    }
}
