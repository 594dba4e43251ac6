//! Whittle: test-case minimization by first-choice hill climbing
//!
//! Repeatedly transforms a failure-inducing instance and keeps the first
//! transformed instance for which an external evaluator still reports the
//! failure. Evaluations run either locally, one process at a time, or as
//! Slurm array jobs on a cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Search driver                 │
//! │  current → successors → batches         │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │           Environment                   │
//! │  local: one evaluator at a time         │
//! │  slurm: one array job per batch         │
//! └────────────────────┬────────────────────┘
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │    Evaluator (external program)         │
//! │  exit 0 → failure still reproduced      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The driver always selects the earliest-enumerated improving successor of
//! a batch, no matter in which order the evaluations finished.

pub mod config;
pub mod environment;
pub mod evaluation;
pub mod evaluator;
pub mod generators;
pub mod search;
pub mod signals;
pub mod successor;
pub mod workspace;

// Re-exports for convenience
pub use config::Config;
pub use environment::{
    create_environment, Cancellation, Environment, LocalEnvironment, OrderingPolicy,
    SlurmEnvironment,
};
pub use evaluation::{BatchResult, EvaluationTask, TaskError, TaskStatus};
pub use evaluator::{Evaluator, Outcome, ResourceLimits};
pub use search::{search, SearchOptions, SearchReport, SearchResult, Termination};
pub use successor::{ChainGenerators, Instance, Successor, SuccessorGenerator, SuccessorIter};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Submission of {batch} failed: {message}")]
    Submission { batch: String, message: String },

    #[error("Polling job {job_id} failed: {message}")]
    Polling { job_id: String, message: String },

    #[error("{} did not become visible after {attempts} attempts", path.display())]
    Visibility {
        path: std::path::PathBuf,
        attempts: u32,
    },

    #[error("Evaluator error: {0}")]
    Evaluator(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Invalid task transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
