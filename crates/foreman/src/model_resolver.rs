//! The model resolver (§2): a four-priority chain — explicit task override,
//! subagent frontmatter, a complexity classifier, tier default — followed by
//! an availability probe with distinct, cached outcomes. Grounded on the
//! dispatcher's own `ModelHealthProbe` shape (`crate::dispatcher`): this
//! module supplies the concrete probe implementation the dispatcher's gate 5
//! consumes, plus the resolution step that decides *which* model the probe
//! is even asked about.

use std::path::Path;
use std::time::Duration;

use foreman_process::run_with_timeout;
use foreman_types::{ModelResolverConfig, ModelTier};

use crate::dispatcher::ModelHealthProbe;

/// Priority 1-4 resolution (§2 ModelResolver). Each `Option` argument is one
/// rung of the chain; the first `Some` wins.
///
/// - `explicit`: an operator- or task-level override (`foreman add --model`,
///   or a `model` field already set on the task row).
/// - `subagent_frontmatter_model`: the `model:` field from a subagent
///   definition file's YAML frontmatter, if this task was dispatched against
///   one (see [`parse_subagent_frontmatter`]).
/// - `description` feeds the complexity classifier when both of the above
///   are absent.
pub fn resolve_model(
    explicit: Option<&str>,
    subagent_frontmatter_model: Option<&str>,
    description: &str,
    cfg: &ModelResolverConfig,
) -> String {
    if let Some(m) = explicit {
        return m.to_string();
    }
    if let Some(m) = subagent_frontmatter_model {
        return m.to_string();
    }
    tier_model(classify_complexity(description, cfg), cfg)
}

/// Priority 2: read a subagent definition file's frontmatter `model:` field.
/// Frontmatter is YAML-ish but we only need one scalar key, so this is a
/// targeted line scan between the `---` fences rather than a full YAML
/// parse — the same preference for a narrow parser over a heavyweight
/// dependency that [`crate::todo_registry`] and [`crate::verify_queue`]
/// follow for their own line-oriented formats.
pub fn parse_subagent_frontmatter(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut lines = content.lines();
    if lines.next()?.trim() != "---" {
        return None;
    }
    for line in lines {
        if line.trim() == "---" {
            break;
        }
        if let Some(value) = line.strip_prefix("model:") {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Priority 3: a word-count-and-keyword heuristic, matching the teacher's
/// preference for a cheap deterministic classifier over a model call just to
/// pick a model. Keyword hits force `Premium` regardless of length.
pub fn classify_complexity(description: &str, cfg: &ModelResolverConfig) -> ModelTier {
    let lower = description.to_lowercase();
    if cfg.premium_keywords.iter().any(|kw| lower.contains(kw.as_str())) {
        return ModelTier::Premium;
    }
    let words = description.split_whitespace().count();
    if words <= cfg.simple_word_ceiling {
        ModelTier::Cheap
    } else if words <= cfg.standard_word_ceiling {
        ModelTier::Standard
    } else {
        ModelTier::Premium
    }
}

/// Priority 4: the tier's configured default model identifier.
pub fn tier_model(tier: ModelTier, cfg: &ModelResolverConfig) -> String {
    match tier {
        ModelTier::Cheap => cfg.cheap_model.clone(),
        ModelTier::Standard => cfg.standard_model.clone(),
        ModelTier::Premium => cfg.premium_model.clone(),
    }
}

/// Inverse of [`tier_model`]: which tier a task's already-resolved model
/// identifier belongs to, needed by the quality gate's escalation path
/// ([`crate::self_heal::apply_rejection`]) to find "the next tier up" from
/// a plain model string. Unrecognised models are treated as `Cheap`, the
/// safest (most escalatable) assumption.
pub fn tier_of_model(model: &str, cfg: &ModelResolverConfig) -> ModelTier {
    if model == cfg.premium_model {
        ModelTier::Premium
    } else if model == cfg.standard_model {
        ModelTier::Standard
    } else {
        ModelTier::Cheap
    }
}

/// Distinct availability outcomes for a model probe, preserved rather than
/// collapsed to a bool so callers (and their logs) can tell "never
/// configured" apart from "provider is rate-limiting us right now" — the
/// dispatcher only needs the coarse healthy/unhealthy signal, but this is
/// what feeds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    RateLimited,
    TransientBackendFailure,
    NotConfigured,
}

impl ProbeOutcome {
    pub fn is_healthy(self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }

    /// Map the worker CLI's own probe-subcommand exit code onto a distinct
    /// outcome (§5's exit-code vocabulary: 0 success, 3 provider
    /// unavailable/rate-limited, 75 = `EX_TEMPFAIL` transient failure).
    fn from_exit_code(code: i32) -> Self {
        match code {
            0 => ProbeOutcome::Healthy,
            3 => ProbeOutcome::RateLimited,
            75 => ProbeOutcome::TransientBackendFailure,
            _ => ProbeOutcome::NotConfigured,
        }
    }
}

/// Probe a model's availability by shelling out to the worker CLI's own
/// health subcommand, matching the dispatcher's `ModelHealthProbe`
/// trait. Per-pulse caching lives in `PulseState::cached_health`, consulted
/// by the dispatcher before this is ever invoked — this struct is only the
/// uncached probe itself.
pub struct CliModelHealthProbe {
    pub timeout: Duration,
}

impl ModelHealthProbe for CliModelHealthProbe {
    fn probe(&self, model: &str) -> bool {
        probe_model(model, self.timeout).is_healthy()
    }
}

fn probe_model(model: &str, timeout: Duration) -> ProbeOutcome {
    let cwd = std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
    match run_with_timeout("worker", &["--probe-model", model], &cwd, Some(timeout)) {
        Ok(out) if !out.timed_out => ProbeOutcome::from_exit_code(out.exit_code),
        _ => ProbeOutcome::TransientBackendFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ModelResolverConfig {
        ModelResolverConfig::default()
    }

    #[test]
    fn explicit_wins_over_everything() {
        let resolved = resolve_model(Some("opus"), Some("haiku"), "a tiny task", &cfg());
        assert_eq!(resolved, "opus");
    }

    #[test]
    fn frontmatter_wins_when_no_explicit_override() {
        let resolved = resolve_model(None, Some("sonnet"), "a tiny task", &cfg());
        assert_eq!(resolved, "sonnet");
    }

    #[test]
    fn short_description_classifies_cheap() {
        let resolved = resolve_model(None, None, "fix typo in readme", &cfg());
        assert_eq!(resolved, cfg().cheap_model);
    }

    #[test]
    fn long_description_classifies_premium() {
        let long = "word ".repeat(60);
        let resolved = resolve_model(None, None, &long, &cfg());
        assert_eq!(resolved, cfg().premium_model);
    }

    #[test]
    fn keyword_forces_premium_even_when_short() {
        let resolved = resolve_model(None, None, "plan the database migration", &cfg());
        assert_eq!(resolved, cfg().premium_model);
    }

    #[test]
    fn parse_subagent_frontmatter_extracts_model_field() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("reviewer.md");
        std::fs::write(&path, "---\nname: reviewer\nmodel: opus\n---\nbody text\n").unwrap();
        assert_eq!(parse_subagent_frontmatter(&path), Some("opus".to_string()));
    }

    #[test]
    fn parse_subagent_frontmatter_returns_none_without_fence() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("reviewer.md");
        std::fs::write(&path, "no frontmatter here\n").unwrap();
        assert_eq!(parse_subagent_frontmatter(&path), None);
    }

    #[test]
    fn tier_of_model_recognises_each_configured_default() {
        let cfg = cfg();
        assert_eq!(tier_of_model(&cfg.cheap_model, &cfg), ModelTier::Cheap);
        assert_eq!(tier_of_model(&cfg.standard_model, &cfg), ModelTier::Standard);
        assert_eq!(tier_of_model(&cfg.premium_model, &cfg), ModelTier::Premium);
    }

    #[test]
    fn tier_of_model_defaults_unrecognised_to_cheap() {
        let cfg = cfg();
        assert_eq!(tier_of_model("some-exotic-model", &cfg), ModelTier::Cheap);
    }

    #[test]
    fn probe_outcome_maps_distinct_exit_codes() {
        assert_eq!(ProbeOutcome::from_exit_code(0), ProbeOutcome::Healthy);
        assert_eq!(ProbeOutcome::from_exit_code(3), ProbeOutcome::RateLimited);
        assert_eq!(ProbeOutcome::from_exit_code(75), ProbeOutcome::TransientBackendFailure);
        assert_eq!(ProbeOutcome::from_exit_code(9), ProbeOutcome::NotConfigured);
    }
}
