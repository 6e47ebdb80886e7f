use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{deserialize_duration, serialize_duration};

/// Layered configuration root. Defaults here are overridden by
/// `foreman.toml` in the target repo, then by `FOREMAN_*` environment
/// variables, then by CLI flags — in that order, matching the teacher's
/// `.shipper.toml` layering generalized to a nested-struct shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    pub concurrency: ConcurrencyConfig,
    pub dispatch: DispatchConfig,
    pub evaluator: EvaluatorConfig,
    pub lifecycle: LifecycleConfig,
    pub lock: LockConfig,
    pub retry: RetryConfig,
    pub hang: HangConfig,
    pub model_resolver: ModelResolverConfig,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig::default(),
            dispatch: DispatchConfig::default(),
            evaluator: EvaluatorConfig::default(),
            lifecycle: LifecycleConfig::default(),
            lock: LockConfig::default(),
            retry: RetryConfig::default(),
            hang: HangConfig::default(),
            model_resolver: ModelResolverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub cpu_high_pct: f64,
    pub cpu_medium_pct: f64,
    pub cpu_low_pct: f64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            cpu_high_pct: 85.0,
            cpu_medium_pct: 70.0,
            cpu_low_pct: 40.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub identity_env: String,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub health_probe_timeout: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub health_cache_ttl: Duration,
    pub max_diverged_files_for_reuse: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            identity_env: "FOREMAN_IDENTITY".to_string(),
            health_probe_timeout: Duration::from_secs(15),
            health_cache_ttl: Duration::from_secs(300),
            max_diverged_files_for_reuse: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub ai_evaluator_timeout: Duration,
    pub ai_evaluator_model: String,
    pub tail_lines_for_heuristics: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            ai_evaluator_timeout: Duration::from_secs(60),
            ai_evaluator_model: "haiku".to_string(),
            tail_lines_for_heuristics: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Check names that may fail without blocking a merge, matched
    /// case-insensitively, provided the mainline quality-gate action itself
    /// passed and nothing else failed. Decided open question: default
    /// `["sonarcloud"]`.
    pub admin_overridable_checks: Vec<String>,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub deploy_timeout: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub stuck_deploying_recovery: Duration,
    pub self_deploying_marker_file: String,
    pub self_deploying_marker_string: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            admin_overridable_checks: vec!["sonarcloud".to_string()],
            deploy_timeout: Duration::from_secs(300),
            stuck_deploying_recovery: Duration::from_secs(600),
            self_deploying_marker_file: ".foreman/self-deploying".to_string(),
            self_deploying_marker_string: "# foreman:self-deploying".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub stale_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub base_delay: Duration,
    pub forge_retry_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            forge_retry_attempts: 3,
        }
    }
}

/// Two-phase hang handling for a dispatched worker (§5): at 50% of
/// `hang_budget` with no sign of progress the worker's process tree gets a
/// `SIGTERM`; if it's still alive `grace_period` later it gets a `SIGKILL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HangConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub hang_budget: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub grace_period: Duration,
}

impl Default for HangConfig {
    fn default() -> Self {
        Self {
            hang_budget: Duration::from_secs(30 * 60),
            grace_period: Duration::from_secs(60),
        }
    }
}

impl HangConfig {
    /// The point at which a still-running worker gets its first `SIGTERM`.
    pub fn sigterm_threshold(&self) -> Duration {
        self.hang_budget / 2
    }
}

/// Tier-default model identifiers and complexity-classifier thresholds for
/// [`crate::ModelTier`] resolution (§2 ModelResolver, priority 3-4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelResolverConfig {
    pub cheap_model: String,
    pub standard_model: String,
    pub premium_model: String,
    /// Descriptions at or under this many words classify as `Cheap`.
    pub simple_word_ceiling: usize,
    /// Descriptions at or under this many words classify as `Standard`;
    /// longer ones classify as `Premium`.
    pub standard_word_ceiling: usize,
    /// Keywords that force a `Premium` classification regardless of length
    /// (architectural/cross-cutting work a cheap model tends to botch).
    pub premium_keywords: Vec<String>,
}

impl Default for ModelResolverConfig {
    fn default() -> Self {
        Self {
            cheap_model: "haiku".to_string(),
            standard_model: "sonnet".to_string(),
            premium_model: "opus".to_string(),
            simple_word_ceiling: 12,
            standard_word_ceiling: 40,
            premium_keywords: vec![
                "migration".to_string(),
                "architecture".to_string(),
                "security".to_string(),
                "refactor the".to_string(),
            ],
        }
    }
}

/// A model capability tier, generalizing the worker CLI's `haiku -> sonnet ->
/// opus` / `flash -> pro` escalation ladders into one ordered vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Cheap,
    Standard,
    Premium,
}

impl ModelTier {
    /// The next tier up, or `None` if already at the ceiling.
    pub fn escalate(self) -> Option<Self> {
        match self {
            ModelTier::Cheap => Some(ModelTier::Standard),
            ModelTier::Standard => Some(ModelTier::Premium),
            ModelTier::Premium => None,
        }
    }
}
