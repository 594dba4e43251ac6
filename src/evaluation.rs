//! Evaluation tasks and their status machine
//!
//! One task is created per successor when a batch is handed to an
//! environment. Tasks start out `Pending`, may be observed `Running`, and
//! end in exactly one terminal status:
//!
//! ```text
//! Pending ──► Running ──► DoneAndImproving
//!    │                    DoneAndNotImproving
//!    └───────────────────►OutOfResources
//!                         Critical
//!                         Cancelled
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::evaluator::Outcome;
use crate::successor::Successor;
use crate::{Error, Result};

/// Status of an evaluation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet seen running
    Pending,
    /// Evaluator is running
    Running,
    /// Evaluator reproduced the failure
    DoneAndImproving,
    /// Evaluator did not reproduce the failure
    DoneAndNotImproving,
    /// Evaluator was killed by the time or memory limit
    OutOfResources,
    /// Infrastructure failure, no trustworthy result
    Critical,
    /// Abandoned after another task decided the batch
    Cancelled,
}

impl TaskStatus {
    /// Whether the status can never change again
    pub fn is_terminal(self) -> bool {
        !self.is_busy()
    }

    /// Whether the task still has to be waited for
    pub fn is_busy(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    /// Whether the task settled with a definite answer from the evaluator
    pub fn is_conclusive(self) -> bool {
        matches!(
            self,
            TaskStatus::DoneAndImproving | TaskStatus::DoneAndNotImproving
        )
    }

    /// Check whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => next != TaskStatus::Pending,
            TaskStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::DoneAndImproving => "done_and_improving",
            TaskStatus::DoneAndNotImproving => "done_and_not_improving",
            TaskStatus::OutOfResources => "out_of_resources",
            TaskStatus::Critical => "critical",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

impl From<Outcome> for TaskStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Improving => TaskStatus::DoneAndImproving,
            Outcome::NotImproving => TaskStatus::DoneAndNotImproving,
            Outcome::OutOfResources => TaskStatus::OutOfResources,
        }
    }
}

/// Evaluation of one successor
#[derive(Debug, Clone)]
pub struct EvaluationTask<S> {
    /// Position of the successor in its batch
    pub index: usize,
    /// The successor being evaluated
    pub successor: Successor<S>,
    /// Directory holding the task's state file and result artifact
    pub dir: PathBuf,
    status: TaskStatus,
}

impl<S> EvaluationTask<S> {
    /// Create a pending task
    pub fn new(index: usize, successor: Successor<S>, dir: impl Into<PathBuf>) -> Self {
        Self {
            index,
            successor,
            dir: dir.into(),
            status: TaskStatus::Pending,
        }
    }

    /// Current status
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Task directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move to `next`, rejecting transitions out of a terminal status
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark the task as running if it is still pending
    pub fn mark_running(&mut self) {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Running;
        }
    }

    /// Consume the task, keeping only its successor
    pub fn into_successor(self) -> Successor<S> {
        self.successor
    }
}

/// Tasks of a job that entered an unexpected scheduler state.
///
/// This is a recoverable condition: the affected tasks are marked
/// `Critical` and the ordering policy decides what remains usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("tasks {indices:?} of job {job_id} entered an unexpected scheduler state")]
pub struct TaskError {
    /// Scheduler job id
    pub job_id: String,
    /// Batch indices of the critical tasks, ascending
    pub indices: Vec<usize>,
}

/// Everything an environment knows about a finished batch
#[derive(Debug)]
pub struct BatchResult<S> {
    /// Identifier of the job (or local run) that evaluated the batch
    pub job_id: String,
    /// One task per successor, in enumeration order
    pub tasks: Vec<EvaluationTask<S>>,
    /// Critical tasks reported by the scheduler, if any
    pub task_error: Option<TaskError>,
}

impl<S> BatchResult<S> {
    /// Number of tasks with the given status
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status() == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> EvaluationTask<u32> {
        EvaluationTask::new(0, Successor::new(1, "one"), "/tmp/task-0000")
    }

    #[test]
    fn test_new_task_is_pending() {
        let task = task();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.status().is_busy());
    }

    #[test]
    fn test_pending_to_running_to_done() {
        let mut task = task();
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::DoneAndImproving).unwrap();
        assert_eq!(task.status(), TaskStatus::DoneAndImproving);
        assert!(task.status().is_terminal());
    }

    #[test]
    fn test_pending_may_settle_directly() {
        let mut task = task();
        task.transition(TaskStatus::Critical).unwrap();
        assert_eq!(task.status(), TaskStatus::Critical);
    }

    #[test]
    fn test_terminal_status_never_changes() {
        for terminal in [
            TaskStatus::DoneAndImproving,
            TaskStatus::DoneAndNotImproving,
            TaskStatus::OutOfResources,
            TaskStatus::Critical,
            TaskStatus::Cancelled,
        ] {
            let mut task = task();
            task.transition(terminal).unwrap();
            let err = task.transition(TaskStatus::Running).unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }));
            assert!(task.transition(TaskStatus::DoneAndImproving).is_err());
            assert_eq!(task.status(), terminal);
        }
    }

    #[test]
    fn test_running_cannot_go_back_to_pending() {
        let mut task = task();
        task.mark_running();
        assert!(task.transition(TaskStatus::Pending).is_err());
        assert_eq!(task.status(), TaskStatus::Running);
    }

    #[test]
    fn test_mark_running_ignores_terminal_tasks() {
        let mut task = task();
        task.transition(TaskStatus::Cancelled).unwrap();
        task.mark_running();
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_outcome_conversion() {
        assert_eq!(
            TaskStatus::from(Outcome::Improving),
            TaskStatus::DoneAndImproving
        );
        assert_eq!(
            TaskStatus::from(Outcome::OutOfResources),
            TaskStatus::OutOfResources
        );
        assert!(!TaskStatus::OutOfResources.is_conclusive());
    }

    #[test]
    fn test_task_error_message() {
        let err = TaskError {
            job_id: "4242".to_string(),
            indices: vec![1, 3],
        };
        assert_eq!(
            err.to_string(),
            "tasks [1, 3] of job 4242 entered an unexpected scheduler state"
        );
    }
}
