//! The `Supervisor` context (§9 "Global mutable state in the source"): the
//! teacher's original script kept its store handle, forge client, and a
//! scatter of pulse-wide flags as module-level globals. Here they're a
//! struct threaded through every phase function instead, with the
//! pulse-scoped caches (health probe results, orphan-scan throttling)
//! nested under [`PulseState`] so they reset cleanly between pulses rather
//! than leaking state across runs the way a `static` would.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

use foreman_forge::Forge;
use foreman_notify::Notifier;
use foreman_store::Store;
use foreman_types::ForemanConfig;

/// Long-lived handles and configuration, constructed once per `foreman`
/// invocation and shared (by reference) across every pulse.
pub struct Supervisor {
    pub store: Store,
    pub forge: Box<dyn Forge>,
    pub notifier: Box<dyn Notifier>,
    pub config: ForemanConfig,
    pub repo_root: PathBuf,
    pub state_dir: PathBuf,
    pub identity: String,
}

impl Supervisor {
    pub fn new(
        store: Store,
        forge: Box<dyn Forge>,
        notifier: Box<dyn Notifier>,
        config: ForemanConfig,
        repo_root: PathBuf,
        state_dir: PathBuf,
        identity: String,
    ) -> Self {
        Self {
            store,
            forge,
            notifier,
            config,
            repo_root,
            state_dir,
            identity,
        }
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.state_dir.join("worktrees")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.state_dir.join("worktree-registry")
    }
}

/// Per-pulse scratch state: reset at the start of [`crate::pulse::run_pulse`]
/// so nothing from a previous cycle's health probe cache or merge guard
/// bleeds into the next one.
#[derive(Default)]
pub struct PulseState {
    /// Model health probe results, cached for `DispatchConfig::health_cache_ttl`
    /// so a dozen queued tasks against the same model don't re-probe a dozen
    /// times in one pulse.
    health_cache: HashMap<String, (bool, Instant)>,
    /// Task ids whose PR was merged earlier in *this* pulse — the serial-merge
    /// guard (§4.8) consults this before merging a sibling subtask's PR so two
    /// siblings never merge in the same pulse and race each other's rebase.
    pub merged_this_pulse: HashSet<String>,
    /// Timestamp of the last full orphan worktree scan, throttled to once per
    /// `orphan_scan_interval` rather than every pulse.
    pub last_orphan_scan: Option<Instant>,
}

impl PulseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_health(&self, model: &str, ttl: std::time::Duration) -> Option<bool> {
        let (healthy, at) = self.health_cache.get(model)?;
        if at.elapsed() < ttl {
            Some(*healthy)
        } else {
            None
        }
    }

    pub fn record_health(&mut self, model: &str, healthy: bool) {
        self.health_cache.insert(model.to_string(), (healthy, Instant::now()));
    }

    pub fn mark_merged(&mut self, task_id: &str) {
        self.merged_this_pulse.insert(task_id.to_string());
    }

    pub fn already_merged_this_pulse(&self, task_id: &str) -> bool {
        self.merged_this_pulse.contains(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn health_cache_expires_after_ttl() {
        let mut state = PulseState::new();
        state.record_health("haiku", true);
        assert_eq!(state.cached_health("haiku", Duration::from_secs(300)), Some(true));
        assert_eq!(state.cached_health("haiku", Duration::from_nanos(0)), None);
    }

    #[test]
    fn merged_this_pulse_tracks_distinct_tasks() {
        let mut state = PulseState::new();
        assert!(!state.already_merged_this_pulse("t1"));
        state.mark_merged("t1");
        assert!(state.already_merged_this_pulse("t1"));
        assert!(!state.already_merged_this_pulse("t2"));
    }
}
