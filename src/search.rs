//! First-choice hill climbing
//!
//! The driver enumerates the successors of the current instance, hands
//! them to the environment batch by batch and moves to the first successor
//! the evaluator accepts. It stops when a whole enumeration yields nothing
//! (a local optimum), when a batch is inconclusive under the strict
//! ordering policy, on interrupt, or at the step limit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::environment::{Environment, OrderingPolicy};
use crate::evaluation::{BatchResult, EvaluationTask, TaskError, TaskStatus};
use crate::evaluator::Evaluator;
use crate::successor::{Instance, Successor, SuccessorGenerator, SuccessorIter};
use crate::Result;

/// Knobs of a search run
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Stop after this many accepted steps
    pub max_steps: Option<usize>,
    /// Checked before every batch; once set, the search returns the best
    /// instance found so far
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl SearchOptions {
    /// Limit the number of accepted steps
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Watch `flag` for interruption
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// Why the search stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// No successor of the final instance reproduces the failure
    LocalOptimum,
    /// No improving successor found, some evaluations were inconclusive
    Inconclusive {
        /// Step (1-based) in which the batch was evaluated
        step: usize,
        /// Job that evaluated the batch
        job_id: String,
        /// Batch indices without a definite answer
        indices: Vec<usize>,
    },
    /// Interrupted by the user
    Interrupted,
    /// The configured number of steps was accepted
    StepLimit,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::LocalOptimum => {
                write!(f, "local optimum reached, no successor reproduces the failure")
            }
            Termination::Inconclusive {
                step,
                job_id,
                indices,
            } => write!(
                f,
                "no improving successor found in step {}, some evaluations were \
                 inconclusive (job {}, tasks {:?})",
                step, job_id, indices
            ),
            Termination::Interrupted => write!(f, "interrupted"),
            Termination::StepLimit => write!(f, "step limit reached"),
        }
    }
}

/// One accepted improvement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Description of the accepted change
    pub change: String,
    /// Batches evaluated to find it
    pub batches: usize,
    /// Evaluations spent to find it
    pub evaluations: usize,
}

/// Statistics of a search run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
    pub batches: usize,
    pub evaluations: usize,
    pub critical_tasks: usize,
    pub cancelled_tasks: usize,
    pub task_errors: Vec<TaskError>,
    /// Successors whose evaluation ran out of resources
    pub out_of_resources: Vec<String>,
    pub termination: Option<Termination>,
}

impl SearchReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
            batches: 0,
            evaluations: 0,
            critical_tasks: 0,
            cancelled_tasks: 0,
            task_errors: Vec::new(),
            out_of_resources: Vec::new(),
            termination: None,
        }
    }

    fn record_batch<S>(&mut self, step: usize, result: &BatchResult<S>) {
        let cancelled = result.count(TaskStatus::Cancelled);
        self.batches += 1;
        self.evaluations += result.tasks.len() - cancelled;
        self.cancelled_tasks += cancelled;
        self.critical_tasks += result.count(TaskStatus::Critical);

        for task in &result.tasks {
            if task.status() == TaskStatus::OutOfResources {
                debug!("Out of resources: {}", task.successor.change);
                self.out_of_resources
                    .push(format!("step {}: {}", step, task.successor.change));
            }
        }
        if let Some(error) = &result.task_error {
            self.task_errors.push(error.clone());
        }
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "{} steps accepted, {} evaluations in {} batches",
            self.steps.len(),
            self.evaluations,
            self.batches
        )];
        if let Some(termination) = &self.termination {
            lines.push(format!("Stopped: {}", termination));
        }
        if let Some(finished) = self.finished_at {
            let elapsed = (finished - self.started_at).to_std().unwrap_or_default();
            lines.push(format!(
                "Elapsed: {}",
                humantime::format_duration(std::time::Duration::from_secs(elapsed.as_secs()))
            ));
        }
        if self.critical_tasks > 0 {
            lines.push(format!(
                "{} evaluations failed in the scheduler",
                self.critical_tasks
            ));
        }
        if !self.out_of_resources.is_empty() {
            lines.push(format!(
                "{} evaluations ran out of resources, the result may not be minimal:",
                self.out_of_resources.len()
            ));
            for change in &self.out_of_resources {
                lines.push(format!("  {}", change));
            }
        }
        lines.join("\n")
    }
}

/// Final instance plus how the search got there
#[derive(Debug)]
pub struct SearchResult<S> {
    /// Best instance found
    pub state: S,
    /// Why the search stopped
    pub termination: Termination,
    /// Statistics
    pub report: SearchReport,
}

/// Which successor of an evaluated batch the search may take
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Batch position of the selected successor
    Improving(usize),
    /// Nothing usable, and the batch may hide an improving successor
    Inconclusive(Vec<usize>),
    /// Every usable task answered "not improving"
    NoneImproving,
}

/// Inspect evaluated tasks in enumeration order.
///
/// Strict: the first task that is not "not improving" decides the batch. It
/// is selected if it improves, otherwise the batch is inconclusive, even if
/// a later task improved.
/// Lenient: the first improving task wins, inconclusive tasks are skipped.
pub fn select<S>(tasks: &[EvaluationTask<S>], ordering: OrderingPolicy) -> Selection {
    for (position, task) in tasks.iter().enumerate() {
        match task.status() {
            TaskStatus::DoneAndImproving => return Selection::Improving(position),
            TaskStatus::DoneAndNotImproving => {}
            _ if ordering == OrderingPolicy::Strict => {
                let indices = tasks
                    .iter()
                    .filter(|t| {
                        matches!(
                            t.status(),
                            TaskStatus::OutOfResources | TaskStatus::Critical
                        )
                    })
                    .map(|t| t.index)
                    .collect();
                return Selection::Inconclusive(indices);
            }
            _ => {}
        }
    }
    Selection::NoneImproving
}

/// Result of one step of the search
enum StepOutcome<S> {
    Improved(Successor<S>),
    Exhausted,
    Inconclusive { job_id: String, indices: Vec<usize> },
    Interrupted,
}

/// Evaluate `successors` batch by batch until one improves
async fn find_first_improving<S, E>(
    mut successors: SuccessorIter<'_, S>,
    evaluator: &Evaluator,
    environment: &mut E,
    options: &SearchOptions,
    step: usize,
    report: &mut SearchReport,
) -> Result<StepOutcome<S>>
where
    S: Instance,
    E: Environment<S> + ?Sized,
{
    let batch_size = environment.batch_size().max(1);
    let ordering = environment.ordering();

    loop {
        if options.interrupted() {
            return Ok(StepOutcome::Interrupted);
        }

        let batch: Vec<Successor<S>> = successors.by_ref().take(batch_size).collect();
        if batch.is_empty() {
            return Ok(StepOutcome::Exhausted);
        }
        debug!("Step {}: evaluating batch of {}", step, batch.len());

        let mut on_task_completed = |_: &str, task: &EvaluationTask<S>| {
            ordering.on_task_completed(task.index, task.status())
        };
        let mut result = match environment
            .run(evaluator, batch, &mut on_task_completed)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("Step {}: batch {} failed: {}", step, report.batches, e);
                return Err(e);
            }
        };
        report.record_batch(step, &result);

        match select(&result.tasks, ordering) {
            Selection::Improving(position) => {
                let task = result.tasks.swap_remove(position);
                return Ok(StepOutcome::Improved(task.into_successor()));
            }
            Selection::Inconclusive(indices) => {
                return Ok(StepOutcome::Inconclusive {
                    job_id: result.job_id,
                    indices,
                });
            }
            Selection::NoneImproving => {}
        }
    }
}

/// Minimize `initial` by first-choice hill climbing.
///
/// Returns the best instance found. Infrastructure failures (submission,
/// polling, filesystem, evaluator launch) abort the search with an error.
pub async fn search<S, G, E>(
    initial: S,
    generator: &G,
    evaluator: &Evaluator,
    environment: &mut E,
    options: &SearchOptions,
) -> Result<SearchResult<S>>
where
    S: Instance,
    G: SuccessorGenerator<S> + ?Sized,
    E: Environment<S> + ?Sized,
{
    info!(
        "Searching with {} ({} environment, batch size {}, {:?} ordering)",
        generator.name(),
        environment.name(),
        environment.batch_size(),
        environment.ordering()
    );

    let mut report = SearchReport::new();
    let mut current = initial;

    let termination = loop {
        if options
            .max_steps
            .is_some_and(|max| report.steps.len() >= max)
        {
            break Termination::StepLimit;
        }

        let step = report.steps.len() + 1;
        let batches_before = report.batches;
        let evaluations_before = report.evaluations;

        let outcome = {
            let successors = generator.successors(&current);
            find_first_improving(successors, evaluator, environment, options, step, &mut report)
                .await?
        };

        match outcome {
            StepOutcome::Improved(successor) => {
                info!("Step {}: {}", step, successor.change);
                report.steps.push(StepRecord {
                    change: successor.change.clone(),
                    batches: report.batches - batches_before,
                    evaluations: report.evaluations - evaluations_before,
                });
                current = successor.into_state();
            }
            StepOutcome::Exhausted => break Termination::LocalOptimum,
            StepOutcome::Inconclusive { job_id, indices } => {
                break Termination::Inconclusive {
                    step,
                    job_id,
                    indices,
                }
            }
            StepOutcome::Interrupted => break Termination::Interrupted,
        }
    };

    match &termination {
        Termination::Inconclusive { .. } => warn!("{}", termination),
        other => info!("Search finished: {}", other),
    }
    if !report.out_of_resources.is_empty() {
        warn!(
            "{} evaluations ran out of resources, the result may not be minimal under these limits",
            report.out_of_resources.len()
        );
    }

    report.finished_at = Some(Utc::now());
    report.termination = Some(termination.clone());

    Ok(SearchResult {
        state: current,
        termination,
        report,
    })
}
