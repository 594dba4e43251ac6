//! Running the external evaluator
//!
//! The evaluator is a separate executable. It is called as
//! `program <state-file>` from inside the task directory and decides by its
//! exit code whether the failure is still reproduced: 0 means yes, anything
//! else means no. A run that hit a resource limit is neither and is
//! classified as out of resources:
//!
//! - killed by the CPU limit (`SIGXCPU`, or `SIGKILL` at the hard limit)
//! - exited with [`OUT_OF_RESOURCES_EXIT_CODE`]
//! - under a memory limit, crashed with `SIGABRT`/`SIGSEGV`/`SIGBUS` or
//!   failed with an allocation error on stderr
//!
//! Memory failures are rewritten to [`OUT_OF_RESOURCES_EXIT_CODE`] by the
//! runner, so the `exit_code` artifact alone decides the outcome.
//!
//! The same code path runs the evaluator on the local machine and on a
//! cluster node (through `whittle run-task`).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::workspace::{self, STATE_FILE, STDERR_FILE, STDOUT_FILE};
use crate::{Error, Result};

/// Exit code meaning "ran out of resources, no verdict".
///
/// Evaluators may exit with it themselves; the runner also records
/// detected memory-limit failures with it.
pub const OUT_OF_RESOURCES_EXIT_CODE: i32 = 125;

/// How much of the end of `evaluator.err` is searched for allocation errors
const STDERR_TAIL_BYTES: u64 = 16 * 1024;

/// What the evaluator said about one successor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Failure still reproduced
    Improving,
    /// Failure not reproduced
    NotImproving,
    /// Killed by the time or memory limit, says nothing about the failure
    OutOfResources,
}

/// Limits applied to every evaluator process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Soft CPU time limit
    pub cpu_time: Option<Duration>,
    /// Address space limit in MiB
    pub memory_mb: Option<u64>,
    /// Distance between soft and hard CPU limit
    pub grace: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time: None,
            memory_mb: None,
            grace: Duration::from_secs(5),
        }
    }
}

impl ResourceLimits {
    /// Soft and hard CPU limit in whole seconds
    pub fn cpu_seconds(&self) -> Option<(u64, u64)> {
        self.cpu_time.map(|t| {
            let soft = t.as_secs().max(1);
            (soft, soft + self.grace.as_secs())
        })
    }

    /// Address space limit in bytes
    pub fn memory_bytes(&self) -> Option<u64> {
        self.memory_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }

    /// Whether no limit is set at all
    pub fn is_unlimited(&self) -> bool {
        self.cpu_time.is_none() && self.memory_mb.is_none()
    }
}

/// How an evaluator process ended.
///
/// Written to the `exit_code` artifact as a single integer: the exit code,
/// or the negated signal number if the process was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRecord {
    /// Regular exit with a code
    Code(i32),
    /// Killed by a signal
    Signal(i32),
}

impl ExitRecord {
    /// Record for a finished process
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitRecord::Signal(signal);
            }
        }
        ExitRecord::Code(status.code().unwrap_or(1))
    }

    /// Parse the content of an `exit_code` artifact
    pub fn parse(content: &str) -> Option<Self> {
        let value: i32 = content.trim().parse().ok()?;
        if value < 0 {
            Some(ExitRecord::Signal(-value))
        } else {
            Some(ExitRecord::Code(value))
        }
    }

    /// Artifact representation
    pub fn as_artifact(&self) -> String {
        match self {
            ExitRecord::Code(code) => code.to_string(),
            ExitRecord::Signal(signal) => (-signal).to_string(),
        }
    }

    /// Classify the exit
    pub fn outcome(&self) -> Outcome {
        match self {
            ExitRecord::Code(0) => Outcome::Improving,
            ExitRecord::Code(OUT_OF_RESOURCES_EXIT_CODE) => Outcome::OutOfResources,
            ExitRecord::Signal(signal) if is_resource_signal(*signal) => Outcome::OutOfResources,
            _ => Outcome::NotImproving,
        }
    }
}

impl fmt::Display for ExitRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitRecord::Code(code) => write!(f, "exit code {}", code),
            ExitRecord::Signal(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// Signals sent when the CPU limit is hit (soft: SIGXCPU, hard: SIGKILL)
#[cfg(unix)]
fn is_resource_signal(signal: i32) -> bool {
    use nix::sys::signal::Signal;
    signal == Signal::SIGXCPU as i32 || signal == Signal::SIGKILL as i32
}

#[cfg(not(unix))]
fn is_resource_signal(_signal: i32) -> bool {
    false
}

/// Signals a process typically dies of when an allocation fails
#[cfg(unix)]
fn is_allocation_signal(signal: i32) -> bool {
    use nix::sys::signal::Signal;
    [Signal::SIGABRT, Signal::SIGSEGV, Signal::SIGBUS]
        .iter()
        .any(|s| *s as i32 == signal)
}

#[cfg(not(unix))]
fn is_allocation_signal(_signal: i32) -> bool {
    false
}

/// Allocation failures as reported by common runtimes
fn allocation_error() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)MemoryError|out of memory|cannot allocate memory|std::bad_alloc|memory allocation of \d+ bytes failed|OutOfMemoryError",
        )
        .expect("valid allocation error regex")
    })
}

/// Last bytes of a file, empty if it cannot be read
fn read_tail(path: &Path, bytes: u64) -> String {
    let mut content = Vec::new();
    let read = std::fs::File::open(path).and_then(|mut file| {
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(bytes)))?;
        file.read_to_end(&mut content)
    });
    match read {
        Ok(_) => String::from_utf8_lossy(&content).into_owned(),
        Err(e) => {
            debug!("Cannot read {}: {}", path.display(), e);
            String::new()
        }
    }
}

/// Record an evaluator that failed because of the memory limit as out of
/// resources. `stderr` is the file its error output went to.
fn attribute_memory_failure(
    record: ExitRecord,
    limits: &ResourceLimits,
    stderr: &Path,
) -> ExitRecord {
    if limits.memory_mb.is_none() {
        return record;
    }
    let hit_limit = match record {
        ExitRecord::Code(0) | ExitRecord::Code(OUT_OF_RESOURCES_EXIT_CODE) => false,
        ExitRecord::Signal(signal) if is_resource_signal(signal) => false,
        ExitRecord::Signal(signal) if is_allocation_signal(signal) => true,
        _ => allocation_error().is_match(&read_tail(stderr, STDERR_TAIL_BYTES)),
    };
    if hit_limit {
        debug!("Evaluator ended with {} under the memory limit", record);
        ExitRecord::Code(OUT_OF_RESOURCES_EXIT_CODE)
    } else {
        record
    }
}

/// External evaluator program plus the limits to run it under
#[derive(Debug, Clone)]
pub struct Evaluator {
    program: PathBuf,
    limits: ResourceLimits,
}

impl Evaluator {
    /// Create an evaluator for `program` without limits
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            limits: ResourceLimits::default(),
        }
    }

    /// Create an evaluator from a user-supplied path.
    ///
    /// Expands `~` and makes the path absolute, because the evaluator is
    /// started from inside the task directory.
    pub fn resolve(program: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(program);
        let path = std::fs::canonicalize(expanded.as_ref()).map_err(|e| {
            Error::Evaluator(format!("Cannot find evaluator {}: {}", program, e))
        })?;
        Ok(Self::new(path))
    }

    /// Set the resource limits
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Path of the evaluator program
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Resource limits
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Write `state` into `dir` and evaluate it
    pub async fn evaluate<S: Serialize>(&self, state: &S, dir: &Path) -> Result<Outcome> {
        workspace::write_state(dir, state)?;
        Ok(self.run_in(dir).await?.outcome())
    }

    /// Run the evaluator on the state file already present in `dir`.
    ///
    /// Output goes to `evaluator.out` / `evaluator.err` in the same
    /// directory.
    pub async fn run_in(&self, dir: &Path) -> Result<ExitRecord> {
        // The evaluator runs inside `dir`, so it must get an absolute path
        let dir = std::fs::canonicalize(dir)?;
        let state = dir.join(STATE_FILE);
        let stdout = std::fs::File::create(dir.join(STDOUT_FILE))?;
        let stderr = std::fs::File::create(dir.join(STDERR_FILE))?;

        let mut cmd = Command::new(&self.program);
        cmd.arg(&state)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        apply_limits(&mut cmd, &self.limits);

        let status = cmd.status().await.map_err(|e| {
            Error::Evaluator(format!(
                "Failed to run {}: {}",
                self.program.display(),
                e
            ))
        })?;

        let record = attribute_memory_failure(
            ExitRecord::from_status(status),
            &self.limits,
            &dir.join(STDERR_FILE),
        );
        debug!("Evaluator in {} ended with {}", dir.display(), record);
        Ok(record)
    }
}

#[cfg(unix)]
fn apply_limits(cmd: &mut Command, limits: &ResourceLimits) {
    use nix::sys::resource::{setrlimit, Resource};

    if limits.is_unlimited() {
        return;
    }
    let cpu = limits.cpu_seconds();
    let memory = limits.memory_bytes();

    // SAFETY: the closure runs between fork and exec and only calls
    // setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            if let Some((soft, hard)) = cpu {
                setrlimit(Resource::RLIMIT_CPU, soft, hard)?;
            }
            if let Some(bytes) = memory {
                setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_limits(_cmd: &mut Command, limits: &ResourceLimits) {
    if !limits.is_unlimited() {
        tracing::warn!("Resource limits are only enforced on Unix");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_record_classification() {
        assert_eq!(ExitRecord::Code(0).outcome(), Outcome::Improving);
        assert_eq!(ExitRecord::Code(1).outcome(), Outcome::NotImproving);
        assert_eq!(ExitRecord::Code(137).outcome(), Outcome::NotImproving);
        assert_eq!(ExitRecord::Signal(11).outcome(), Outcome::NotImproving);
    }

    #[cfg(unix)]
    #[test]
    fn test_cpu_limit_signals_are_out_of_resources() {
        use nix::sys::signal::Signal;
        assert_eq!(
            ExitRecord::Signal(Signal::SIGXCPU as i32).outcome(),
            Outcome::OutOfResources
        );
        assert_eq!(
            ExitRecord::Signal(Signal::SIGKILL as i32).outcome(),
            Outcome::OutOfResources
        );
    }

    #[test]
    fn test_reserved_exit_code_is_out_of_resources() {
        assert_eq!(
            ExitRecord::Code(OUT_OF_RESOURCES_EXIT_CODE).outcome(),
            Outcome::OutOfResources
        );
        assert_eq!(
            ExitRecord::parse("125").map(|r| r.outcome()),
            Some(Outcome::OutOfResources)
        );
    }

    #[test]
    fn test_allocation_errors_are_recognized() {
        for line in [
            "MemoryError",
            "fatal: Out of memory, malloc failed",
            "terminate called after throwing an instance of 'std::bad_alloc'",
            "memory allocation of 524288000 bytes failed",
            "bash: fork: Cannot allocate memory",
            "Exception in thread \"main\" java.lang.OutOfMemoryError: Java heap space",
        ] {
            assert!(allocation_error().is_match(line), "{}", line);
        }
        assert!(!allocation_error().is_match("assertion failed: x < 3"));
    }

    #[test]
    fn test_exit_record_artifact_format() {
        assert_eq!(ExitRecord::Code(3).as_artifact(), "3");
        assert_eq!(ExitRecord::Signal(24).as_artifact(), "-24");
        assert_eq!(ExitRecord::parse("-24\n"), Some(ExitRecord::Signal(24)));
        assert_eq!(ExitRecord::parse(" 0 "), Some(ExitRecord::Code(0)));
        assert_eq!(ExitRecord::parse(""), None);
        assert_eq!(ExitRecord::parse("done"), None);
    }

    #[test]
    fn test_cpu_seconds_include_grace() {
        let limits = ResourceLimits {
            cpu_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        assert_eq!(limits.cpu_seconds(), Some((60, 65)));
        assert_eq!(limits.memory_bytes(), None);
        assert!(!limits.is_unlimited());
        assert!(ResourceLimits::default().is_unlimited());
    }

    #[test]
    fn test_sub_second_cpu_limit_rounds_up() {
        let limits = ResourceLimits {
            cpu_time: Some(Duration::from_millis(200)),
            grace: Duration::from_secs(1),
            memory_mb: Some(2),
        };
        assert_eq!(limits.cpu_seconds(), Some((1, 2)));
        assert_eq!(limits.memory_bytes(), Some(2 * 1024 * 1024));
    }

    #[test]
    fn test_resolve_missing_program() {
        let err = Evaluator::resolve("/definitely/not/here/eval.sh").unwrap_err();
        assert!(matches!(err, Error::Evaluator(_)));
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn script(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("eval.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn task_dir(dir: &TempDir) -> PathBuf {
            let task = dir.path().join("task-0000");
            std::fs::create_dir_all(&task).unwrap();
            task
        }

        #[tokio::test]
        async fn test_exit_zero_is_improving() {
            let dir = TempDir::new().unwrap();
            let evaluator = Evaluator::new(script(&dir, "exit 0"));
            let outcome = evaluator.evaluate(&42u32, &task_dir(&dir)).await.unwrap();
            assert_eq!(outcome, Outcome::Improving);
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_not_improving() {
            let dir = TempDir::new().unwrap();
            let evaluator = Evaluator::new(script(&dir, "exit 3"));
            let task = task_dir(&dir);
            workspace::write_state(&task, &1u32).unwrap();
            let record = evaluator.run_in(&task).await.unwrap();
            assert_eq!(record, ExitRecord::Code(3));
            assert_eq!(record.outcome(), Outcome::NotImproving);
        }

        #[tokio::test]
        async fn test_evaluator_receives_state_file() {
            let dir = TempDir::new().unwrap();
            let evaluator = Evaluator::new(script(&dir, "grep -q '\"needle\"' \"$1\""));
            let task = task_dir(&dir);
            assert_eq!(
                evaluator.evaluate(&vec!["needle"], &task).await.unwrap(),
                Outcome::Improving
            );
            assert_eq!(
                evaluator.evaluate(&vec!["hay"], &task).await.unwrap(),
                Outcome::NotImproving
            );
        }

        #[tokio::test]
        async fn test_killed_by_cpu_signal_is_out_of_resources() {
            let dir = TempDir::new().unwrap();
            let evaluator = Evaluator::new(script(&dir, "kill -s XCPU $$"));
            let outcome = evaluator.evaluate(&0u32, &task_dir(&dir)).await.unwrap();
            assert_eq!(outcome, Outcome::OutOfResources);
        }

        #[tokio::test]
        async fn test_cpu_limit_is_enforced() {
            let dir = TempDir::new().unwrap();
            let evaluator = Evaluator::new(script(&dir, "while :; do :; done")).with_limits(
                ResourceLimits {
                    cpu_time: Some(Duration::from_secs(1)),
                    grace: Duration::from_secs(1),
                    memory_mb: None,
                },
            );
            let outcome = evaluator.evaluate(&0u32, &task_dir(&dir)).await.unwrap();
            assert_eq!(outcome, Outcome::OutOfResources);
        }

        fn memory_limited(program: PathBuf) -> Evaluator {
            Evaluator::new(program).with_limits(ResourceLimits {
                memory_mb: Some(1024),
                ..Default::default()
            })
        }

        #[tokio::test]
        async fn test_allocation_failure_under_memory_limit_is_out_of_resources() {
            let dir = TempDir::new().unwrap();
            let program = script(&dir, "echo 'MemoryError' >&2; exit 1");

            let task = task_dir(&dir);
            workspace::write_state(&task, &0u32).unwrap();
            let record = memory_limited(program.clone()).run_in(&task).await.unwrap();
            assert_eq!(record, ExitRecord::Code(OUT_OF_RESOURCES_EXIT_CODE));
            assert_eq!(record.outcome(), Outcome::OutOfResources);

            // Without a memory limit the same exit is an ordinary negative result
            let outcome = Evaluator::new(program).evaluate(&0u32, &task).await.unwrap();
            assert_eq!(outcome, Outcome::NotImproving);
        }

        #[tokio::test]
        async fn test_abort_under_memory_limit_is_out_of_resources() {
            let dir = TempDir::new().unwrap();
            let program = script(&dir, "kill -s ABRT $$");

            let outcome = memory_limited(program.clone())
                .evaluate(&0u32, &task_dir(&dir))
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::OutOfResources);

            let outcome = Evaluator::new(program)
                .evaluate(&0u32, &task_dir(&dir))
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::NotImproving);
        }

        #[tokio::test]
        async fn test_failures_unrelated_to_memory_keep_their_verdict() {
            let dir = TempDir::new().unwrap();
            let program = script(&dir, "echo 'assertion failed' >&2; exit 1");
            let outcome = memory_limited(program)
                .evaluate(&0u32, &task_dir(&dir))
                .await
                .unwrap();
            assert_eq!(outcome, Outcome::NotImproving);
        }

        #[tokio::test]
        async fn test_output_is_captured() {
            let dir = TempDir::new().unwrap();
            let evaluator = Evaluator::new(script(&dir, "echo hello; echo oops >&2; exit 1"));
            let task = task_dir(&dir);
            evaluator.evaluate(&0u32, &task).await.unwrap();
            let out = std::fs::read_to_string(task.join(STDOUT_FILE)).unwrap();
            let err = std::fs::read_to_string(task.join(STDERR_FILE)).unwrap();
            assert_eq!(out.trim(), "hello");
            assert_eq!(err.trim(), "oops");
        }

        #[tokio::test]
        async fn test_unlaunchable_program_is_an_error() {
            let dir = TempDir::new().unwrap();
            let evaluator = Evaluator::new(dir.path().join("missing.sh"));
            let err = evaluator.evaluate(&0u32, &task_dir(&dir)).await.unwrap_err();
            assert!(matches!(err, Error::Evaluator(_)));
        }
    }
}
