//! Local environment
//!
//! Runs the evaluator on the current machine, one task after the other, in
//! enumeration order. Tasks are reported to the callback as they finish, so
//! the search can stop a batch early.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{apply_cancellation, Environment, OrderingPolicy, TaskCallback};
use crate::config::Config;
use crate::evaluation::{BatchResult, EvaluationTask};
use crate::evaluator::Evaluator;
use crate::successor::{Instance, Successor};
use crate::workspace::{self, Workspace};
use crate::Result;

/// Sequential evaluation on this machine
pub struct LocalEnvironment {
    workspace: Workspace,
    batch_size: usize,
    ordering: OrderingPolicy,
    batches: usize,
}

impl LocalEnvironment {
    /// Create a local environment writing below `workspace`
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            batch_size: crate::config::DEFAULT_LOCAL_BATCH_SIZE,
            ordering: OrderingPolicy::Strict,
            batches: 0,
        }
    }

    /// Create a local environment from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let workspace = Workspace::create(&config.workspace_dir(), config.workspace.keep)?;
        Ok(Self::new(workspace)
            .with_batch_size(config.batch_size())
            .with_ordering(OrderingPolicy::from_allow_nondeterministic(
                config.environment.allow_nondeterministic_successor_choice,
            )))
    }

    /// Set the batch size (at least 1)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the ordering policy
    pub fn with_ordering(mut self, ordering: OrderingPolicy) -> Self {
        self.ordering = ordering;
        self
    }

    /// Workspace the batches are written to
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }
}

#[async_trait]
impl<S: Instance> Environment<S> for LocalEnvironment {
    fn name(&self) -> &str {
        "local"
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn ordering(&self) -> OrderingPolicy {
        self.ordering
    }

    async fn run(
        &mut self,
        evaluator: &Evaluator,
        batch: Vec<Successor<S>>,
        on_task_completed: &mut TaskCallback<'_, S>,
    ) -> Result<BatchResult<S>> {
        let job_id = format!("local-{}", self.batches);
        self.batches += 1;

        let batch_dir = self.workspace.next_batch_dir()?;
        let mut tasks: Vec<EvaluationTask<S>> = batch
            .into_iter()
            .enumerate()
            .map(|(index, successor)| {
                EvaluationTask::new(index, successor, workspace::task_dir(&batch_dir, index))
            })
            .collect();
        info!("Evaluating {} successors locally ({})", tasks.len(), job_id);

        for index in 0..tasks.len() {
            if !tasks[index].status().is_busy() {
                continue;
            }

            tasks[index].mark_running();
            let outcome = {
                let task = &tasks[index];
                evaluator.evaluate(&task.successor.state, &task.dir).await?
            };
            tasks[index].transition(outcome.into())?;
            debug!(
                "Task {} ({}) settled as {}",
                index,
                tasks[index].successor.change,
                tasks[index].status()
            );

            let cancellation = on_task_completed(&job_id, &tasks[index]);
            let cancelled = apply_cancellation(&mut tasks, cancellation);
            if cancelled > 0 {
                debug!("Skipping {} remaining tasks of {}", cancelled, job_id);
            }
        }

        self.workspace.discard(&batch_dir);
        Ok(BatchResult {
            job_id,
            tasks,
            task_error: None,
        })
    }
}
