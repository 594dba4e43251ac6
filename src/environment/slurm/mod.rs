//! Slurm environment
//!
//! A batch is materialized on the shared filesystem, submitted as one array
//! job and polled until its outcome is decided:
//!
//! 1. write `task-NNNN/state.json` for every successor and wait until the
//!    files are visible
//! 2. render `job.sh` and submit it with `sbatch`
//! 3. poll `sacct`; finished tasks are reconciled with their `exit_code`
//!    artifact and reported to the callback in ascending index order
//! 4. stop as soon as no task the callback still cares about is busy

mod scheduler;
mod script;

pub use scheduler::{parse_job_id, parse_sacct, Scheduler, SlurmCli, TaskState};
pub use script::JobScript;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{apply_cancellation, Environment, OrderingPolicy, TaskCallback};
use crate::config::{Config, SlurmConfig};
use crate::evaluation::{BatchResult, EvaluationTask, TaskError, TaskStatus};
use crate::evaluator::Evaluator;
use crate::successor::{Instance, Successor};
use crate::workspace::{self, Workspace, EXIT_CODE_FILE, JOB_SCRIPT, STATE_FILE};
use crate::Result;

/// A submitted array job and its tasks
#[derive(Debug)]
pub struct Job<S> {
    /// Scheduler job id
    pub id: String,
    /// Batch directory
    pub batch_dir: PathBuf,
    /// One task per array index
    pub tasks: Vec<EvaluationTask<S>>,
    critical: Vec<usize>,
}

impl<S> Job<S> {
    fn new(id: String, batch_dir: PathBuf, tasks: Vec<EvaluationTask<S>>) -> Self {
        Self {
            id,
            batch_dir,
            tasks,
            critical: Vec::new(),
        }
    }

    /// Whether any task still has to be waited for
    pub fn is_busy(&self) -> bool {
        self.tasks.iter().any(|t| t.status().is_busy())
    }

    fn task_error(&self) -> Option<TaskError> {
        if self.critical.is_empty() {
            return None;
        }
        let mut indices = self.critical.clone();
        indices.sort_unstable();
        Some(TaskError {
            job_id: self.id.clone(),
            indices,
        })
    }
}

/// Evaluation as Slurm array jobs
pub struct SlurmEnvironment {
    config: SlurmConfig,
    workspace: Workspace,
    scheduler: Box<dyn Scheduler>,
    wrapper: PathBuf,
    batch_size: usize,
    ordering: OrderingPolicy,
}

impl SlurmEnvironment {
    /// Create a Slurm environment using `scheduler`
    pub fn new(config: SlurmConfig, workspace: Workspace, scheduler: Box<dyn Scheduler>) -> Self {
        let wrapper = config
            .wrapper
            .clone()
            .unwrap_or_else(|| PathBuf::from("whittle"));
        Self {
            config,
            workspace,
            scheduler,
            wrapper,
            batch_size: crate::config::DEFAULT_SLURM_BATCH_SIZE,
            ordering: OrderingPolicy::Strict,
        }
    }

    /// Create a Slurm environment talking to the real Slurm binaries
    pub fn from_config(config: &Config) -> Result<Self> {
        let workspace = Workspace::create(&config.workspace_dir(), config.workspace.keep)?;
        let wrapper = match &config.slurm.wrapper {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        let scheduler = Box::new(SlurmCli::new(&config.slurm));

        Ok(Self::new(config.slurm.clone(), workspace, scheduler)
            .with_wrapper(wrapper)
            .with_batch_size(config.batch_size())
            .with_ordering(OrderingPolicy::from_allow_nondeterministic(
                config.environment.allow_nondeterministic_successor_choice,
            )))
    }

    /// Set the whittle binary the array tasks run
    pub fn with_wrapper(mut self, wrapper: impl Into<PathBuf>) -> Self {
        self.wrapper = wrapper.into();
        self
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

    /// Write the state files and wait until the shared filesystem shows them
    async fn materialize<S: Instance>(
        &self,
        batch_dir: &Path,
        batch: Vec<Successor<S>>,
    ) -> Result<Vec<EvaluationTask<S>>> {
        let mut tasks = Vec::with_capacity(batch.len());
        for (index, successor) in batch.into_iter().enumerate() {
            let dir = workspace::task_dir(batch_dir, index);
            workspace::write_state(&dir, &successor.state)?;
            tasks.push(EvaluationTask::new(index, successor, dir));
        }
        for task in &tasks {
            workspace::wait_until_visible(
                &task.dir.join(STATE_FILE),
                self.config.visibility_retries,
                self.config.visibility_interval,
            )
            .await?;
        }
        Ok(tasks)
    }

    /// Statuses of the tasks in `dirs`, all reported completed by the
    /// scheduler.
    ///
    /// The artifacts share one visibility budget, so a few vanished results
    /// do not hold up the rest of the batch.
    async fn reconcile(&self, dirs: &[&Path]) -> Vec<TaskStatus> {
        let artifacts: Vec<PathBuf> = dirs.iter().map(|d| d.join(EXIT_CODE_FILE)).collect();
        let visible = workspace::wait_until_all_visible(
            &artifacts,
            self.config.visibility_retries,
            self.config.visibility_interval,
        )
        .await;

        dirs.iter()
            .zip(visible)
            .map(|(dir, visible)| {
                if !visible {
                    warn!("Task in {} finished without a result", dir.display());
                    return TaskStatus::Critical;
                }
                match workspace::read_exit_record(dir) {
                    Some(record) => record.outcome().into(),
                    None => TaskStatus::Critical,
                }
            })
            .collect()
    }

    /// Poll until nothing the callback cares about is busy
    async fn wait<S: Instance>(
        &self,
        job: &mut Job<S>,
        on_task_completed: &mut TaskCallback<'_, S>,
    ) -> Result<()> {
        while job.is_busy() {
            tokio::time::sleep(self.config.poll_interval).await;
            let states = self.scheduler.query(&job.id).await?;

            let mut settled: Vec<(usize, TaskStatus)> = Vec::new();
            let mut done = Vec::new();
            let mut failed = Vec::new();
            for (index, task) in job.tasks.iter_mut().enumerate() {
                if !task.status().is_busy() {
                    continue;
                }
                match states.get(&index) {
                    None | Some(TaskState::Pending) => {}
                    Some(TaskState::Running) => task.mark_running(),
                    Some(TaskState::Done) => done.push(index),
                    Some(TaskState::Critical(state)) => {
                        warn!("Task {} of job {} ended as {}", index, job.id, state);
                        failed.push(index);
                        settled.push((index, TaskStatus::Critical));
                    }
                }
            }

            if !done.is_empty() {
                let dirs: Vec<&Path> = done.iter().map(|&i| job.tasks[i].dir.as_path()).collect();
                let statuses = self.reconcile(&dirs).await;
                settled.extend(done.into_iter().zip(statuses));
            }
            settled.sort_unstable_by_key(|(index, _)| *index);

            for (index, status) in settled {
                // An earlier task of this poll may have cancelled it
                if !job.tasks[index].status().is_busy() {
                    continue;
                }
                job.tasks[index].transition(status)?;
                debug!("Task {} of job {} settled as {}", index, job.id, status);
                if failed.contains(&index) {
                    job.critical.push(index);
                }

                let cancellation = on_task_completed(&job.id, &job.tasks[index]);
                let cancelled = apply_cancellation(&mut job.tasks, cancellation);
                if cancelled > 0 {
                    debug!("Abandoned {} tasks of job {}", cancelled, job.id);
                }
            }
        }
        Ok(())
    }

    /// Best-effort `scancel` when configured
    async fn cancel_job(&self, job_id: &str) {
        if !self.config.cancel_abandoned_tasks {
            return;
        }
        if let Err(e) = self.scheduler.cancel(job_id).await {
            warn!("Failed to cancel job {}: {}", job_id, e);
        }
    }
}

#[async_trait]
impl<S: Instance> Environment<S> for SlurmEnvironment {
    fn name(&self) -> &str {
        "slurm"
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
        let batch_dir = self.workspace.next_batch_dir()?;
        let size = batch.len();
        let tasks = self.materialize(&batch_dir, batch).await?;

        let script = JobScript {
            config: &self.config,
            batch_dir: &batch_dir,
            tasks: size,
            wrapper: &self.wrapper,
            evaluator,
        }
        .render();
        let script_path = batch_dir.join(JOB_SCRIPT);
        std::fs::write(&script_path, script)?;

        let job_id = self.scheduler.submit(&script_path).await?;
        info!(
            "Submitted {} as job {} ({} tasks)",
            batch_dir.display(),
            job_id,
            size
        );

        let mut job = Job::new(job_id, batch_dir, tasks);
        if let Err(e) = self.wait(&mut job, on_task_completed).await {
            warn!("Giving up on job {}: {}", job.id, e);
            self.cancel_job(&job.id).await;
            self.workspace.discard(&job.batch_dir);
            return Err(e);
        }

        let abandoned = job
            .tasks
            .iter()
            .filter(|t| t.status() == TaskStatus::Cancelled)
            .count();
        if abandoned > 0 {
            self.cancel_job(&job.id).await;
        }

        let task_error = job.task_error();
        if let Some(error) = &task_error {
            warn!("{}", error);
        }

        self.workspace.discard(&job.batch_dir);
        Ok(BatchResult {
            job_id: job.id,
            tasks: job.tasks,
            task_error,
        })
    }
}
