//! Talking to the Slurm command line tools
//!
//! `sbatch` submits a job script, `sacct` reports the state of each array
//! task, `scancel` abandons a job. The [`Scheduler`] trait sits in front of
//! them so the environment can be driven without a cluster.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::SlurmConfig;
use crate::{Error, Result};

/// State of one array task as far as the environment cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for resources
    Pending,
    /// Executing
    Running,
    /// Finished normally, the result artifact should exist
    Done,
    /// Ended in a state that leaves no trustworthy result
    Critical(String),
}

impl TaskState {
    /// Map a raw sacct state (e.g. `CANCELLED by 1234`)
    pub fn classify(raw: &str) -> Self {
        let state = raw.split_whitespace().next().unwrap_or("").trim_end_matches('+');
        match state {
            "COMPLETED" => TaskState::Done,
            "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD"
            | "RESV_DEL_HOLD" | "SUSPENDED" | "RESIZING" => TaskState::Pending,
            "RUNNING" | "COMPLETING" | "SIGNALING" | "STAGE_OUT" | "STOPPED" => {
                TaskState::Running
            }
            _ => TaskState::Critical(state.to_string()),
        }
    }

    /// Whether the task still has to be waited for
    pub fn is_busy(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Running)
    }
}

/// Scheduler interface used by the Slurm environment
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Submit the job script and return the job id
    async fn submit(&self, script: &Path) -> Result<String>;

    /// Current state of the reported array tasks by index
    async fn query(&self, job_id: &str) -> Result<HashMap<usize, TaskState>>;

    /// Cancel whatever is left of the job
    async fn cancel(&self, job_id: &str) -> Result<()>;
}

/// Scheduler backed by the real Slurm binaries
#[derive(Debug, Clone)]
pub struct SlurmCli {
    sbatch: String,
    sacct: String,
    scancel: String,
}

impl SlurmCli {
    /// Use the binaries named in the configuration
    pub fn new(config: &SlurmConfig) -> Self {
        Self {
            sbatch: config.sbatch.clone(),
            sacct: config.sacct.clone(),
            scancel: config.scancel.clone(),
        }
    }
}

impl Default for SlurmCli {
    fn default() -> Self {
        Self::new(&SlurmConfig::default())
    }
}

fn batch_label(script: &Path) -> String {
    script
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| script.display().to_string())
}

#[async_trait]
impl Scheduler for SlurmCli {
    async fn submit(&self, script: &Path) -> Result<String> {
        let batch = batch_label(script);
        let script = std::fs::canonicalize(script).map_err(|e| Error::Submission {
            batch: batch.clone(),
            message: format!("cannot read {}: {}", script.display(), e),
        })?;
        let mut cmd = Command::new(&self.sbatch);
        cmd.arg("--parsable").arg(&script);
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| Error::Submission {
            batch: batch.clone(),
            message: format!("failed to run {}: {}", self.sbatch, e),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(Error::Submission {
                batch,
                message: format!(
                    "{} exited with {}: {}",
                    self.sbatch,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        parse_job_id(&stdout).ok_or_else(|| Error::Submission {
            batch,
            message: format!("unexpected sbatch output: {:?}", stdout.trim()),
        })
    }

    async fn query(&self, job_id: &str) -> Result<HashMap<usize, TaskState>> {
        let output = Command::new(&self.sacct)
            .args(["-j", job_id, "--noheader", "--parsable2"])
            .arg("--format=JobID,State")
            .output()
            .await
            .map_err(|e| Error::Polling {
                job_id: job_id.to_string(),
                message: format!("failed to run {}: {}", self.sacct, e),
            })?;

        if !output.status.success() {
            return Err(Error::Polling {
                job_id: job_id.to_string(),
                message: format!(
                    "{} exited with {}: {}",
                    self.sacct,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        trace!("sacct output for {}:\n{}", job_id, stdout);
        Ok(parse_sacct(job_id, &stdout))
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        debug!("Cancelling job {}", job_id);
        let status = Command::new(&self.scancel)
            .arg(job_id)
            .status()
            .await
            .map_err(|e| Error::Command(format!("failed to run {}: {}", self.scancel, e)))?;

        if !status.success() {
            return Err(Error::Command(format!(
                "{} {} exited with {}",
                self.scancel, job_id, status
            )));
        }
        Ok(())
    }
}

/// Extract the job id from `sbatch` output.
///
/// Accepts `--parsable` output (`1234` or `1234;cluster`) as well as the
/// human readable `Submitted batch job 1234`.
pub fn parse_job_id(output: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^(?:Submitted batch job\s+)?(\d+)(?:;\S+)?$").expect("valid job id regex")
    });
    output
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .and_then(|line| re.captures(line))
        .map(|caps| caps[1].to_string())
}

/// Parse `sacct --parsable2 --format=JobID,State` output for array job `job_id`.
///
/// Step lines (`1234_5.batch`) are ignored. Pending tasks may be reported as
/// a range (`1234_[3-7,9%4]`). Indices that are not mentioned at all are
/// simply absent from the map.
pub fn parse_sacct(job_id: &str, output: &str) -> HashMap<usize, TaskState> {
    let prefix = format!("{}_", job_id);
    let mut states = HashMap::new();

    for line in output.lines() {
        let mut fields = line.trim().split('|');
        let (id, raw_state) = match (fields.next(), fields.next()) {
            (Some(id), Some(state)) => (id.trim(), state.trim()),
            _ => continue,
        };
        if id.contains('.') {
            continue;
        }
        let Some(indices) = id.strip_prefix(&prefix) else {
            continue;
        };

        let state = TaskState::classify(raw_state);
        for index in parse_indices(indices) {
            states.insert(index, state.clone());
        }
    }
    states
}

/// Expand `5`, `[3-7,9]` or `[3-7%4]` into indices
fn parse_indices(range: &str) -> Vec<usize> {
    let range = range.trim_start_matches('[').trim_end_matches(']');
    let range = range.split('%').next().unwrap_or("");

    let mut indices = Vec::new();
    for part in range.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                    indices.extend(start..=end);
                }
            }
            None => {
                if let Ok(index) = part.parse() {
                    indices.push(index);
                }
            }
        }
    }
    indices
}
