//! The safe-migrate primitive (§4.1): back up the whole database file, run
//! the migration and the row-count verify *inside the same transaction*,
//! and only commit once the verify passes. A verify failure rolls the
//! transaction back instead of committing, so the live `Connection` never
//! observes the shrunk state and there is nothing to restore underneath
//! it — restoring a backup file on top of a `Connection` that already
//! committed the bad migration would leave its in-memory page cache and
//! any open statements pointing at data that no longer matches the file on
//! disk. The on-disk backup is kept purely as an external recovery
//! artifact (for a crash mid-migration, or a human wanting to diff
//! before/after), not as the rollback mechanism itself. Row-count
//! verification is the defence against the historical bug where a
//! `SELECT *`-based copy silently dropped rows whenever the column count
//! changed underneath it.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::Connection;

use crate::StoreError;

/// Back up to `supervisor-backup-<reason>-<ts>.db`, checkpointing the WAL
/// first so the backup is a complete, self-contained copy.
pub fn backup(conn: &Connection, db_path: &Path, reason: &str) -> Result<PathBuf, StoreError> {
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .map_err(StoreError::Sql)?;
    let ts = Utc::now().format("%Y%m%dT%H%M%SZ");
    let backup_path = db_path.with_file_name(format!(
        "{}-backup-{reason}-{ts}.db",
        db_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("supervisor")
    ));
    fs::copy(db_path, &backup_path).map_err(|source| StoreError::Io {
        path: db_path.to_path_buf(),
        source,
    })?;
    Ok(backup_path)
}

/// Discard all but the `keep` most recently created backups matching the
/// `<stem>-backup-*.db` naming convention next to `db_path`.
pub fn prune_backups(db_path: &Path, keep: usize) -> Result<(), StoreError> {
    let dir = db_path.parent().unwrap_or(Path::new("."));
    let stem = db_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("supervisor")
        .to_string();
    let prefix = format!("{stem}-backup-");

    let mut backups: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".db"))
        })
        .collect();
    // Filenames embed a sortable timestamp, so lexical order is chronological.
    backups.sort();

    if backups.len() > keep {
        for stale in &backups[..backups.len() - keep] {
            let _ = fs::remove_file(stale);
        }
    }
    Ok(())
}

fn row_count(conn: &Connection, table: &str) -> Result<i64, StoreError> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .map_err(StoreError::Sql)
}

/// Run `migration` under the backup -> migrate -> verify-then-commit
/// protocol. `tables` lists every table the migration could plausibly
/// shrink; their row counts are compared before (outside the transaction)
/// and after (inside it, pre-commit). A shrinkage rolls the transaction
/// back by simply never calling `commit()` — `Transaction::drop` performs
/// the rollback — so the backup file taken up front is never copied back
/// over a live connection.
pub fn safe_migrate(
    conn: &mut Connection,
    db_path: &Path,
    reason: &str,
    tables: &[&str],
    migration: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<()>,
) -> Result<(), StoreError> {
    let _backup_path = backup(conn, db_path, reason)?;

    let before: Vec<(&str, i64)> = tables
        .iter()
        .map(|&t| row_count(conn, t).map(|c| (t, c)))
        .collect::<Result<_, _>>()?;

    let result = (|| -> Result<(), StoreError> {
        let tx = conn.transaction().map_err(StoreError::Sql)?;
        migration(&tx).map_err(StoreError::Sql)?;

        for (table, before_count) in &before {
            let after_count = row_count(&tx, table)?;
            if after_count < *before_count {
                return Err(StoreError::Migration {
                    reason: format!(
                        "table {table} shrank from {before_count} to {after_count} rows during migration {reason:?}"
                    ),
                });
            }
        }

        // Only reached once every table's row count held or grew; `tx`
        // rolls back on drop for every earlier `?`/early-return path above.
        tx.commit().map_err(StoreError::Sql)?;
        Ok(())
    })();

    if let Err(e) = &result {
        tracing::error!(error = %e, reason, "migration failed, transaction rolled back");
    } else {
        prune_backups(db_path, 5)?;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh_db(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);")
            .unwrap();
        conn.execute("INSERT INTO t (v) VALUES ('a')", []).unwrap();
        conn.execute("INSERT INTO t (v) VALUES ('b')", []).unwrap();
        conn
    }

    #[test]
    fn safe_migrate_commits_growing_migration() {
        let td = tempdir().unwrap();
        let path = td.path().join("db.sqlite");
        let mut conn = fresh_db(&path);

        safe_migrate(&mut conn, &path, "add_column", &["t"], |tx| {
            tx.execute_batch("ALTER TABLE t ADD COLUMN extra TEXT DEFAULT 'x';")
        })
        .unwrap();

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn safe_migrate_rolls_back_on_row_loss() {
        let td = tempdir().unwrap();
        let path = td.path().join("db.sqlite");
        let mut conn = fresh_db(&path);

        let result = safe_migrate(&mut conn, &path, "bad_migration", &["t"], |tx| {
            tx.execute("DELETE FROM t WHERE v = 'a'", [])?;
            Ok(())
        });
        assert!(result.is_err());

        // The transaction never committed: both rows must still be there,
        // both on the already-open `conn` and on a freshly reopened one.
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);

        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn prune_backups_keeps_only_most_recent() {
        let td = tempdir().unwrap();
        let path = td.path().join("db.sqlite");
        let _conn = fresh_db(&path);

        for i in 0..8 {
            let backup_path = path.with_file_name(format!("db-backup-r-ts{i:03}.db"));
            fs::write(&backup_path, b"fake").unwrap();
        }
        prune_backups(&path, 5).unwrap();

        let remaining: Vec<_> = fs::read_dir(td.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .collect();
        assert_eq!(remaining.len(), 5);
    }
}
