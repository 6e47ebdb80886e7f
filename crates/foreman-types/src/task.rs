use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::TaskStatus;

/// The primary entity: one unit of work driven through the pipeline.
///
/// Identity is an opaque string (`t123`, `t123.4`, `t123-diag-1`):
/// dot-separated segments encode parent/subtask hierarchy, and a
/// `-diag-N` suffix marks a synthesised diagnostic child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub repo_root: PathBuf,
    pub description: String,
    pub status: TaskStatus,
    pub session: Option<String>,
    pub worktree: Option<PathBuf>,
    pub branch: Option<String>,
    pub log_file: Option<PathBuf>,
    pub retries: u32,
    pub max_retries: u32,
    pub escalation_depth: u32,
    pub max_escalation_depth: u32,
    pub model: Option<String>,
    pub last_error: Option<String>,
    pub pr_url: Option<String>,
    pub issue_url: Option<String>,
    pub diagnostic_of: Option<String>,
    /// Dynamic extension fields: `pre_merge_commit`, `no_pr_retries`,
    /// `triage_result`, and anything a future phase wants to stash without a
    /// migration.
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, repo_root: PathBuf, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            repo_root,
            description: description.into(),
            status: TaskStatus::Queued,
            session: None,
            worktree: None,
            branch: None,
            log_file: None,
            retries: 0,
            max_retries: 3,
            escalation_depth: 0,
            max_escalation_depth: 2,
            model: None,
            last_error: None,
            pr_url: None,
            issue_url: None,
            diagnostic_of: None,
            metadata: Value::Object(Default::default()),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// The dotted prefix identifying this task's sibling group, e.g.
    /// `t300.2` -> `t300`. Tasks with no dot are their own group.
    pub fn parent_prefix(&self) -> &str {
        self.id.split('.').next().unwrap_or(&self.id)
    }

    /// Whether this id was synthesised by the self-healer.
    pub fn is_diagnostic(&self) -> bool {
        self.id.contains("-diag-") || self.diagnostic_of.is_some()
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<Value>) {
        if let Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_prefix_splits_on_dot() {
        let t = Task::new("t300.2", PathBuf::from("/repo"), "desc");
        assert_eq!(t.parent_prefix(), "t300");
    }

    #[test]
    fn parent_prefix_is_whole_id_without_dot() {
        let t = Task::new("t005", PathBuf::from("/repo"), "desc");
        assert_eq!(t.parent_prefix(), "t005");
    }

    #[test]
    fn is_diagnostic_detects_suffix() {
        let t = Task::new("t005-diag-1", PathBuf::from("/repo"), "desc");
        assert!(t.is_diagnostic());
        let t2 = Task::new("t005", PathBuf::from("/repo"), "desc");
        assert!(!t2.is_diagnostic());
    }

    #[test]
    fn metadata_roundtrips_through_json() {
        let mut t = Task::new("t1", PathBuf::from("/repo"), "desc");
        t.set_metadata("pre_merge_commit", "abc123");
        assert_eq!(t.metadata_str("pre_merge_commit"), Some("abc123"));
    }
}
