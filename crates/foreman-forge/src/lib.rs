//! The abstract git-forge interface. The spec (§1) places the forge's own
//! HTTP/GraphQL APIs and CLI out of scope; what's in scope is the *shape*
//! this system needs from a forge, plus retry and token-resolution plumbing
//! that doesn't depend on which concrete forge backs it.

mod null_forge;
mod retry;
mod token;
mod types;

pub use null_forge::NullForge;
pub use retry::with_forge_retry;
pub use token::{resolve_token, TokenError, TokenSource};
pub use types::{
    CheckConclusion, CheckRollup, CheckRun, PullRequest, PullRequestState, ReviewDecision,
    ReviewThread, ThreadState, User,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("forge request failed: {0}")]
    Request(String),
    #[error("forge returned no result for {0}")]
    NotFound(String),
    #[error("authentication failed: {0}")]
    Auth(String),
}

/// Everything the orchestrator needs from a git forge. A concrete
/// implementation (REST + GraphQL client) lives outside this crate's scope;
/// `NullForge` here is a deterministic test double, and every real call site
/// in `foreman` takes `&dyn Forge` so tests never touch the network.
pub trait Forge: Send + Sync {
    fn list_prs_for_branch(&self, repo: &str, branch: &str) -> Result<Vec<PullRequest>, ForgeError>;

    fn view_pr(&self, repo: &str, number: u64) -> Result<PullRequest, ForgeError>;

    /// Squash-merge `number`. `admin` passes the admin-override flag used
    /// for the unstable-but-green-CI path (§4.8).
    fn merge_pr(&self, repo: &str, number: u64, admin: bool) -> Result<(), ForgeError>;

    /// Unresolved, non-outdated review threads via the graph API — REST's
    /// `reviewDecision` alone loses bot `COMMENTED` reviews (§4.8 step 3).
    fn review_threads(&self, repo: &str, number: u64) -> Result<Vec<ReviewThread>, ForgeError>;

    /// Dismiss reviews authored by logins matching known bot patterns.
    /// Returns the count dismissed.
    fn dismiss_bot_reviews(&self, repo: &str, number: u64) -> Result<u32, ForgeError>;

    fn create_issue(&self, repo: &str, title: &str, body: &str) -> Result<String, ForgeError>;

    fn close_issue(&self, repo: &str, url: &str) -> Result<(), ForgeError>;

    fn authenticated_user(&self) -> Result<User, ForgeError>;
}
