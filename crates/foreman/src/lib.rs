//! The pulse engine: state machine transitions, the dispatcher's gate
//! sequence, the outcome evaluator, the post-PR lifecycle controller, the
//! self-healer/quality-gate, and the model resolver — wired together by
//! [`pulse::run_pulse`], the one entrypoint `foreman-cli` calls every cycle.

pub mod concurrency;
pub mod config;
pub mod dispatcher;
pub mod evaluator;
pub mod lifecycle;
pub mod log_summary;
pub mod model_resolver;
pub mod pr_link;
pub mod pulse;
pub mod self_heal;
pub mod supervisor;
pub mod todo_registry;
pub mod verify_queue;

pub use supervisor::{PulseState, Supervisor};
