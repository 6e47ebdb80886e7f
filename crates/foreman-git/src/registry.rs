//! Per-worktree ownership tokens with liveness checks (§4.4). Ownership is
//! file-based: a small JSON sidecar next to the worktree records which
//! session created it. `cleanup_worktree` refuses to remove a worktree
//! whose token names a still-alive session that isn't the caller.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worktree at {path} is owned by session {owner}, refusing cleanup")]
    ForeignOwner { path: PathBuf, owner: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OwnershipToken {
    session: String,
    pid: u32,
}

/// Tracks worktree ownership under `registry_dir`, one JSON sidecar per
/// worktree path (filename is a hash-free, path-safe encoding of the
/// worktree path so tokens survive process restarts).
pub struct WorktreeRegistry {
    registry_dir: PathBuf,
}

impl WorktreeRegistry {
    pub fn new(registry_dir: PathBuf) -> Self {
        Self { registry_dir }
    }

    fn token_path(&self, worktree_path: &Path) -> PathBuf {
        let encoded = worktree_path
            .to_string_lossy()
            .replace(['/', '\\'], "__");
        self.registry_dir.join(format!("{encoded}.json"))
    }

    /// Record that `session` (pid `pid`) owns `worktree_path`.
    pub fn claim(
        &self,
        worktree_path: &Path,
        session: &str,
        pid: u32,
    ) -> Result<(), RegistryError> {
        fs::create_dir_all(&self.registry_dir).map_err(|source| RegistryError::Io {
            path: self.registry_dir.clone(),
            source,
        })?;
        let token = OwnershipToken {
            session: session.to_string(),
            pid,
        };
        let path = self.token_path(worktree_path);
        let json = serde_json::to_string(&token).expect("OwnershipToken serializes");
        fs::write(&path, json).map_err(|source| RegistryError::Io { path, source })
    }

    /// Remove the ownership record for `worktree_path` without touching the
    /// worktree itself. Used after a caller-authorized cleanup.
    pub fn forget(&self, worktree_path: &Path) {
        let _ = fs::remove_file(self.token_path(worktree_path));
    }

    /// Check whether `caller_session` may clean up `worktree_path`. A
    /// missing registry row means no recorded owner — safe to remove. A
    /// foreign, still-alive owner refuses cleanup.
    pub fn authorize_cleanup(
        &self,
        worktree_path: &Path,
        caller_session: &str,
    ) -> Result<(), RegistryError> {
        let path = self.token_path(worktree_path);
        let Ok(content) = fs::read_to_string(&path) else {
            return Ok(());
        };
        let Ok(token) = serde_json::from_str::<OwnershipToken>(&content) else {
            return Ok(());
        };
        if token.session == caller_session {
            return Ok(());
        }
        if !foreman_process::is_alive(token.pid) {
            return Ok(());
        }
        Err(RegistryError::ForeignOwner {
            path: worktree_path.to_path_buf(),
            owner: token.session,
        })
    }

    /// Discard registry entries whose worktree path no longer exists on
    /// disk.
    pub fn prune(&self) {
        let Ok(entries) = fs::read_dir(&self.registry_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            if serde_json::from_str::<OwnershipToken>(&content).is_err() {
                continue;
            }
            // The encoded filename recovers the original worktree path so
            // we can check its liveness without a separate index.
            let original = path
                .file_stem()
                .map(|s| s.to_string_lossy().replace("__", "/"));
            if let Some(original) = original {
                if !Path::new(&original).exists() {
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_token_allows_cleanup() {
        let td = tempdir().unwrap();
        let registry = WorktreeRegistry::new(td.path().join("registry"));
        let worktree = td.path().join("wt1");
        assert!(registry.authorize_cleanup(&worktree, "session-a").is_ok());
    }

    #[test]
    fn own_session_may_cleanup() {
        let td = tempdir().unwrap();
        let registry = WorktreeRegistry::new(td.path().join("registry"));
        let worktree = td.path().join("wt1");
        registry
            .claim(&worktree, "session-a", std::process::id())
            .unwrap();
        assert!(registry.authorize_cleanup(&worktree, "session-a").is_ok());
    }

    #[test]
    fn foreign_alive_session_refuses_cleanup() {
        let td = tempdir().unwrap();
        let registry = WorktreeRegistry::new(td.path().join("registry"));
        let worktree = td.path().join("wt1");
        registry
            .claim(&worktree, "session-a", std::process::id())
            .unwrap();
        let result = registry.authorize_cleanup(&worktree, "session-b");
        assert!(matches!(result, Err(RegistryError::ForeignOwner { .. })));
    }

    #[test]
    fn foreign_dead_session_allows_cleanup() {
        let td = tempdir().unwrap();
        let registry = WorktreeRegistry::new(td.path().join("registry"));
        let worktree = td.path().join("wt1");
        registry.claim(&worktree, "session-a", u32::MAX - 1).unwrap();
        assert!(registry.authorize_cleanup(&worktree, "session-b").is_ok());
    }
}
