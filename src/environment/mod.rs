//! Execution environments for batches of successors
//!
//! Supports:
//! - Local (one evaluator process at a time)
//! - Slurm (one array job per batch)
//!
//! An environment evaluates a batch and reports every task through the
//! `on_task_completed` callback as soon as it settles. The callback answers
//! with a [`Cancellation`] that tells the environment which of the remaining
//! tasks nobody needs anymore.

mod local;
pub mod slurm;

pub use local::LocalEnvironment;
pub use slurm::{Job, Scheduler, SlurmCli, SlurmEnvironment, TaskState};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Config, EnvironmentKind};
use crate::evaluation::{BatchResult, EvaluationTask, TaskStatus};
use crate::evaluator::Evaluator;
use crate::successor::{Instance, Successor};
use crate::Result;

/// How the search reacts to tasks without a definite answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Always select the earliest improving successor. An inconclusive task
    /// hides everything enumerated after it.
    #[default]
    Strict,
    /// Any improving successor will do; inconclusive tasks are skipped.
    Lenient,
}

impl OrderingPolicy {
    /// Policy for the `allow_nondeterministic_successor_choice` flag
    pub fn from_allow_nondeterministic(allow: bool) -> Self {
        if allow {
            OrderingPolicy::Lenient
        } else {
            OrderingPolicy::Strict
        }
    }

    /// Decide what a just-settled task makes redundant.
    ///
    /// Strict: anything but "not improving" at `index` decides the batch for
    /// all later indices, while earlier ones must still be awaited.
    /// Lenient: only a confirmed improvement ends the batch.
    pub fn on_task_completed(self, index: usize, status: TaskStatus) -> Cancellation {
        match (self, status) {
            (_, TaskStatus::DoneAndNotImproving) => Cancellation::Continue,
            (OrderingPolicy::Strict, s) if s.is_terminal() => Cancellation::After(index),
            (OrderingPolicy::Lenient, TaskStatus::DoneAndImproving) => Cancellation::Remaining,
            _ => Cancellation::Continue,
        }
    }
}

/// Which busy tasks of a batch to abandon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// Keep waiting for everything
    Continue,
    /// Abandon every task with a larger index
    After(usize),
    /// Abandon every task still busy
    Remaining,
}

impl Cancellation {
    /// Whether the task at `index` is abandoned
    pub fn applies_to(self, index: usize) -> bool {
        match self {
            Cancellation::Continue => false,
            Cancellation::After(settled) => index > settled,
            Cancellation::Remaining => true,
        }
    }
}

/// Callback invoked with the job id and each task as soon as it settles
pub type TaskCallback<'a, S> = dyn FnMut(&str, &EvaluationTask<S>) -> Cancellation + Send + 'a;

/// Core environment trait
#[async_trait]
pub trait Environment<S: Instance>: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Number of successors handed over per batch
    fn batch_size(&self) -> usize;

    /// Ordering policy of the search
    fn ordering(&self) -> OrderingPolicy;

    /// Evaluate a batch.
    ///
    /// Returns once the outcome of the batch is fully determined, which is
    /// not necessarily when every task has physically finished. Tasks come
    /// back in the order of `batch`.
    async fn run(
        &mut self,
        evaluator: &Evaluator,
        batch: Vec<Successor<S>>,
        on_task_completed: &mut TaskCallback<'_, S>,
    ) -> Result<BatchResult<S>>;
}

/// Mark every busy task covered by `cancellation` as cancelled.
///
/// Returns the number of newly cancelled tasks.
pub(crate) fn apply_cancellation<S>(
    tasks: &mut [EvaluationTask<S>],
    cancellation: Cancellation,
) -> usize {
    let mut cancelled = 0;
    for task in tasks.iter_mut() {
        if task.status().is_busy()
            && cancellation.applies_to(task.index)
            && task.transition(TaskStatus::Cancelled).is_ok()
        {
            cancelled += 1;
        }
    }
    cancelled
}

/// Create an environment based on configuration
pub fn create_environment<S: Instance>(config: &Config) -> Result<Box<dyn Environment<S>>> {
    match config.environment.kind {
        EnvironmentKind::Local => Ok(Box::new(LocalEnvironment::from_config(config)?)),
        EnvironmentKind::Slurm => Ok(Box::new(SlurmEnvironment::from_config(config)?)),
    }
}
