//! Retry/backoff strategies, generalized from cargo-publish retry into
//! forge-API retry (§5: 3 attempts, 1 -> 2 -> 4 s) and worker-reprompt
//! backoff (§7: bounded by `max_retries`).

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    Immediate,
    #[default]
    Exponential,
    Linear,
    Constant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor, 0.0 (none) to 1.0 (full jitter).
    pub jitter: f64,
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl RetryStrategyConfig {
    /// The forge API retry shape from §5: 3 attempts, 1 -> 2 -> 4s, no jitter.
    pub fn forge_api() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            jitter: 0.0,
        }
    }

    /// `TODO.md` commit+push retry: 3 attempts, 1-2-3s (linear), from §9.
    pub fn todo_push() -> Self {
        Self {
            strategy: RetryStrategyType::Linear,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            jitter: 0.0,
        }
    }
}

/// Calculate the delay before attempt `attempt` (1-indexed).
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt.max(1)),
        RetryStrategyType::Constant => config.base_delay,
    };
    let capped = delay.min(config.max_delay);
    apply_jitter(capped, config.jitter)
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let jitter = jitter.clamp(0.0, 1.0);
    let mut rng = rand::rng();
    let factor = 1.0 - jitter + rng.random::<f64>() * jitter;
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Whether `attempt` (1-indexed, about to be made) is still within budget.
pub fn attempts_remaining(config: &RetryStrategyConfig, attempt: u32) -> bool {
    attempt <= config.max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_each_attempt() {
        let cfg = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(100),
            jitter: 0.0,
        };
        assert_eq!(calculate_delay(&cfg, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&cfg, 2), Duration::from_secs(2));
        assert_eq!(calculate_delay(&cfg, 3), Duration::from_secs(4));
    }

    #[test]
    fn forge_api_preset_matches_spec_backoff() {
        let cfg = RetryStrategyConfig::forge_api();
        assert_eq!(calculate_delay(&cfg, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&cfg, 2), Duration::from_secs(2));
        // Third attempt would be 4s exactly, capped at max_delay of 4s.
        assert_eq!(calculate_delay(&cfg, 3), Duration::from_secs(4));
    }

    #[test]
    fn delay_never_exceeds_max_delay() {
        let cfg = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 20,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        };
        for attempt in 1..20 {
            assert!(calculate_delay(&cfg, attempt) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn attempts_remaining_respects_ceiling() {
        let cfg = RetryStrategyConfig {
            max_attempts: 3,
            ..RetryStrategyConfig::default()
        };
        assert!(attempts_remaining(&cfg, 3));
        assert!(!attempts_remaining(&cfg, 4));
    }

    proptest::proptest! {
        #[test]
        fn linear_delay_is_monotonic_nondecreasing(base_ms in 1u64..1000, attempt in 1u32..50) {
            let cfg = RetryStrategyConfig {
                strategy: RetryStrategyType::Linear,
                max_attempts: 100,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_secs(3600),
                jitter: 0.0,
            };
            let d1 = calculate_delay(&cfg, attempt);
            let d2 = calculate_delay(&cfg, attempt + 1);
            prop_assert!(d2 >= d1);
        }
    }
}
