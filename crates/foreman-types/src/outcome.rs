use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The broad taxonomy an error falls into, used to decide retry/block/fail
/// policy (§7 of the spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientInfra,
    ContentError,
    UserIntervention,
    ResourceExhaustion,
    Protocol,
    Dispatch,
}

/// The outcome classifier's four possible verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Complete,
    Retry,
    Blocked,
    Failed,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Complete => "complete",
            OutcomeKind::Retry => "retry",
            OutcomeKind::Blocked => "blocked",
            OutcomeKind::Failed => "failed",
        }
    }
}

/// A single line `<type>:<detail>` decision emitted by the evaluator, e.g.
/// `retry:backend_quota_error` or `complete:https://forge.example/o/r/pull/42`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub detail: String,
}

impl Outcome {
    pub fn new(kind: OutcomeKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn complete(detail: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Complete, detail)
    }

    pub fn retry(detail: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Retry, detail)
    }

    pub fn blocked(detail: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Blocked, detail)
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Failed, detail)
    }

    /// The PR URL carried in the detail, if this outcome's detail looks like
    /// one — used by callers that need to thread a URL through without
    /// re-parsing the canonical string everywhere.
    pub fn pr_url(&self) -> Option<&str> {
        if self.detail.starts_with("http://") || self.detail.starts_with("https://") {
            Some(&self.detail)
        } else {
            None
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.detail)
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind_str, detail) = s
            .split_once(':')
            .ok_or_else(|| format!("outcome {s:?} is missing a ':' separator"))?;
        let kind = match kind_str {
            "complete" => OutcomeKind::Complete,
            "retry" => OutcomeKind::Retry,
            "blocked" => OutcomeKind::Blocked,
            "failed" => OutcomeKind::Failed,
            other => return Err(format!("unknown outcome type {other:?}")),
        };
        Ok(Outcome::new(kind, detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_round_trips_through_display_and_parse() {
        let o = Outcome::retry("backend_quota_error");
        let s = o.to_string();
        assert_eq!(s, "retry:backend_quota_error");
        let parsed: Outcome = s.parse().unwrap();
        assert_eq!(parsed, o);
    }

    #[test]
    fn outcome_detail_may_itself_contain_colons() {
        let o = Outcome::complete("https://forge.example/o/r/pull/42");
        let s = o.to_string();
        let parsed: Outcome = s.parse().unwrap();
        assert_eq!(parsed.detail, "https://forge.example/o/r/pull/42");
        assert_eq!(parsed.pr_url(), Some("https://forge.example/o/r/pull/42"));
    }

    #[test]
    fn outcome_parse_rejects_missing_separator() {
        assert!("garbage".parse::<Outcome>().is_err());
    }
}
