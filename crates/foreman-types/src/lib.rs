//! Shared domain vocabulary for the foreman orchestrator.
//!
//! This crate carries no I/O: it defines the `Task`/`Batch`/`StateLog`/`ProofLog`
//! shapes, the status alphabet and its transition whitelist, the outcome
//! classifier's vocabulary, and the layered configuration structs. Every other
//! crate in the workspace builds on these types rather than redefining them.

mod batch;
mod config;
mod duration;
mod outcome;
mod proof;
mod status;
mod task;

pub use batch::{Batch, BatchMembership, BatchStatus, ReleaseType};
pub use config::{
    ConcurrencyConfig, DispatchConfig, EvaluatorConfig, ForemanConfig, HangConfig,
    LifecycleConfig, LockConfig, ModelResolverConfig, ModelTier, RetryConfig,
};
pub use duration::{deserialize_duration, serialize_duration};
pub use outcome::{ErrorClass, Outcome, OutcomeKind};
pub use proof::{ProofEvent, ProofLogEntry};
pub use status::{StateLogEntry, TaskStatus, VALID_TRANSITIONS};
pub use task::Task;
