use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Active,
    Paused,
    Complete,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    Major,
    Minor,
    Patch,
}

/// A named, concurrency-bounded cohort of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub name: String,
    pub base_concurrency: u32,
    /// 0 means auto-cap at the logical CPU count.
    pub max_concurrency: u32,
    pub max_load_factor: f64,
    pub status: BatchStatus,
    pub release_on_complete: bool,
    pub release_type: ReleaseType,
    pub skip_quality_gate: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(name: impl Into<String>, base_concurrency: u32) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            base_concurrency,
            max_concurrency: 0,
            max_load_factor: 0.85,
            status: BatchStatus::Active,
            release_on_complete: false,
            release_type: ReleaseType::Patch,
            skip_quality_gate: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The concurrency cap used by the governor: an explicit `max_concurrency`
    /// if set, otherwise the logical CPU count.
    pub fn effective_cap(&self, logical_cpus: u32) -> u32 {
        if self.max_concurrency == 0 {
            logical_cpus.max(1)
        } else {
            self.max_concurrency
        }
    }
}

/// Ordered many-to-many link between a batch and its member tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMembership {
    pub batch_id: i64,
    pub task_id: String,
    pub position: i64,
}
