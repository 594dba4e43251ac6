//! The toy problem solved end to end through both environments.
//!
//! States are `{level, id}`. Every state below level 2 has the five
//! successors `{level + 1, id: 0..5}`, and a state reproduces the "failure"
//! iff `level + id == 3`. Starting from `{0, 0}` the search must take
//! `{1, 2}` and end at `{2, 1}`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use whittle::config::SlurmConfig;
use whittle::environment::{Scheduler, TaskState};
use whittle::evaluator::ExitRecord;
use whittle::workspace::{self, Workspace};
use whittle::{
    search, Evaluator, LocalEnvironment, OrderingPolicy, Result, SearchOptions, SlurmEnvironment,
    Successor, SuccessorGenerator, SuccessorIter, Termination,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Toy {
    level: u32,
    id: u32,
}

impl Toy {
    fn reproduces(&self) -> bool {
        self.level + self.id == 3
    }
}

struct ToyGenerator;

impl SuccessorGenerator<Toy> for ToyGenerator {
    fn name(&self) -> &str {
        "toy"
    }

    fn successors<'a>(&'a self, state: &'a Toy) -> SuccessorIter<'a, Toy> {
        if state.level >= 2 {
            return Box::new(std::iter::empty());
        }
        let level = state.level + 1;
        Box::new((0..5).map(move |id| Successor::new(Toy { level, id }, format!("{}/{}", level, id))))
    }
}

const START: Toy = Toy { level: 0, id: 0 };

fn assert_solved(result: &whittle::SearchResult<Toy>) {
    assert_eq!(result.state, Toy { level: 2, id: 1 });
    assert_eq!(result.termination, Termination::LocalOptimum);
    let changes: Vec<_> = result.report.steps.iter().map(|s| s.change.as_str()).collect();
    assert_eq!(changes, vec!["1/2", "2/1"]);
}

#[cfg(unix)]
fn toy_evaluator(dir: &Path) -> Evaluator {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("toy-eval.sh");
    std::fs::write(
        &path,
        r#"#!/bin/sh
level=$(sed -n 's/.*"level":\([0-9]*\).*/\1/p' "$1")
id=$(sed -n 's/.*"id":\([0-9]*\).*/\1/p' "$1")
[ $((level + id)) -eq 3 ]
"#,
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    Evaluator::new(path)
}

#[cfg(unix)]
#[tokio::test]
async fn test_toy_problem_locally() {
    let tmp = TempDir::new().unwrap();
    let evaluator = toy_evaluator(tmp.path());

    for batch_size in [1, 3] {
        let workspace = Workspace::create(&tmp.path().join("runs"), false).unwrap();
        let mut env = LocalEnvironment::new(workspace).with_batch_size(batch_size);

        let result = search(START, &ToyGenerator, &evaluator, &mut env, &SearchOptions::default())
            .await
            .unwrap();
        assert_solved(&result);
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_toy_problem_locally_lenient() {
    let tmp = TempDir::new().unwrap();
    let evaluator = toy_evaluator(tmp.path());
    let workspace = Workspace::create(&tmp.path().join("runs"), false).unwrap();
    let mut env = LocalEnvironment::new(workspace)
        .with_batch_size(5)
        .with_ordering(OrderingPolicy::Lenient);

    let result = search(START, &ToyGenerator, &evaluator, &mut env, &SearchOptions::default())
        .await
        .unwrap();
    assert_solved(&result);
}

/// Runs the toy evaluation in-process instead of on a cluster
#[derive(Default)]
struct ToyScheduler {
    jobs: Mutex<HashMap<String, usize>>,
}

#[async_trait]
impl Scheduler for ToyScheduler {
    async fn submit(&self, script: &Path) -> Result<String> {
        let batch_dir = script.parent().unwrap();
        let mut tasks = 0;
        while workspace::task_dir(batch_dir, tasks).exists() {
            let dir = workspace::task_dir(batch_dir, tasks);
            let state: Toy = workspace::read_state(&dir)?;
            let exit = if state.reproduces() { 0 } else { 1 };
            workspace::write_exit_record(&dir, ExitRecord::Code(exit))?;
            tasks += 1;
        }

        let mut jobs = self.jobs.lock();
        let id = format!("{}", 1000 + jobs.len());
        jobs.insert(id.clone(), tasks);
        Ok(id)
    }

    async fn query(&self, job_id: &str) -> Result<HashMap<usize, TaskState>> {
        let tasks = self.jobs.lock().get(job_id).copied().unwrap_or(0);
        Ok((0..tasks).map(|index| (index, TaskState::Done)).collect())
    }

    async fn cancel(&self, _job_id: &str) -> Result<()> {
        Ok(())
    }
}

fn fast_slurm_config() -> SlurmConfig {
    SlurmConfig {
        poll_interval: Duration::from_millis(1),
        visibility_retries: 3,
        visibility_interval: Duration::from_millis(1),
        ..SlurmConfig::default()
    }
}

#[tokio::test]
async fn test_toy_problem_through_slurm() {
    let tmp = TempDir::new().unwrap();
    let workspace = Workspace::create(&tmp.path().join("runs"), false).unwrap();
    let mut env = SlurmEnvironment::new(
        fast_slurm_config(),
        workspace,
        Box::new(ToyScheduler::default()),
    )
    .with_batch_size(3);
    let evaluator = Evaluator::new("/opt/toy-eval");

    let result = search(START, &ToyGenerator, &evaluator, &mut env, &SearchOptions::default())
        .await
        .unwrap();
    assert_solved(&result);
    assert!(result.report.task_errors.is_empty());
}

#[tokio::test]
async fn test_toy_problem_through_slurm_single_batch() {
    let tmp = TempDir::new().unwrap();
    let workspace = Workspace::create(&tmp.path().join("runs"), true).unwrap();
    let mut env = SlurmEnvironment::new(
        fast_slurm_config(),
        workspace,
        Box::new(ToyScheduler::default()),
    )
    .with_batch_size(5);
    let evaluator = Evaluator::new("/opt/toy-eval");

    let result = search(START, &ToyGenerator, &evaluator, &mut env, &SearchOptions::default())
        .await
        .unwrap();
    assert_solved(&result);
    assert_eq!(result.report.batches, 2);
}
