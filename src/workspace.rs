//! On-disk layout of a search run
//!
//! ```text
//! <root>/<run-id>/
//!   batch-0000/
//!     job.sh                  (slurm only)
//!     task-0000/
//!       state.json            serialized successor
//!       evaluator.out / .err  evaluator output
//!       exit_code             result artifact
//!     task-0001/
//!   batch-0001/
//! ```
//!
//! Every task owns its directory exclusively, so no locking is needed.
//! Network filesystems may show new files late; `wait_until_visible`
//! bridges that gap.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::evaluator::ExitRecord;
use crate::{Error, Result};

/// Serialized successor state
pub const STATE_FILE: &str = "state.json";
/// Result artifact written by the task wrapper
pub const EXIT_CODE_FILE: &str = "exit_code";
/// Evaluator stdout
pub const STDOUT_FILE: &str = "evaluator.out";
/// Evaluator stderr
pub const STDERR_FILE: &str = "evaluator.err";
/// Slurm job script of a batch
pub const JOB_SCRIPT: &str = "job.sh";

/// Directory of task `index` inside a batch directory
pub fn task_dir(batch_dir: &Path, index: usize) -> PathBuf {
    batch_dir.join(format!("task-{:04}", index))
}

/// Directory tree of one search run
#[derive(Debug)]
pub struct Workspace {
    run_dir: PathBuf,
    next_batch: usize,
    keep: bool,
}

impl Workspace {
    /// Create a fresh run directory below `root`.
    ///
    /// The run directory is always absolute. Evaluators run inside their
    /// task directory and array jobs start wherever Slurm puts them, so a
    /// relative root would resolve differently for each of them.
    pub fn create(root: &Path, keep: bool) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        let name = format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &id[..8]);
        let run_dir = root.join(name);
        std::fs::create_dir_all(&run_dir)?;
        let run_dir = std::fs::canonicalize(&run_dir)?;
        debug!("Created run directory {}", run_dir.display());

        Ok(Self {
            run_dir,
            next_batch: 0,
            keep,
        })
    }

    /// Root of this run
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Create the directory for the next batch
    pub fn next_batch_dir(&mut self) -> Result<PathBuf> {
        let dir = self.run_dir.join(format!("batch-{:04}", self.next_batch));
        self.next_batch += 1;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove a finished batch unless batches are kept
    pub fn discard(&self, batch_dir: &Path) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(batch_dir) {
            warn!("Failed to remove {}: {}", batch_dir.display(), e);
        }
    }
}

/// Write a state file into `dir`, creating the directory if needed
pub fn write_state<S: Serialize>(dir: &Path, state: &S) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(STATE_FILE);
    std::fs::write(&path, serde_json::to_vec(state)?)?;
    Ok(path)
}

/// Read the state file in `dir`
pub fn read_state<S: DeserializeOwned>(dir: &Path) -> Result<S> {
    let content = std::fs::read(dir.join(STATE_FILE))?;
    Ok(serde_json::from_slice(&content)?)
}

/// Write the result artifact.
///
/// The content goes to a temporary file first and is renamed into place,
/// so readers never see a half-written artifact.
pub fn write_exit_record(dir: &Path, record: ExitRecord) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", EXIT_CODE_FILE));
    std::fs::write(&tmp, format!("{}\n", record.as_artifact()))?;
    std::fs::rename(&tmp, dir.join(EXIT_CODE_FILE))?;
    Ok(())
}

/// Read the result artifact, `None` if it is missing or unreadable
pub fn read_exit_record(dir: &Path) -> Option<ExitRecord> {
    let path = dir.join(EXIT_CODE_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let record = ExitRecord::parse(&content);
            if record.is_none() {
                warn!("Malformed result artifact {}: {:?}", path.display(), content);
            }
            record
        }
        Err(e) => {
            debug!("No result artifact at {}: {}", path.display(), e);
            None
        }
    }
}

/// Wait until `path` exists, checking up to `attempts` times
pub async fn wait_until_visible(path: &Path, attempts: u32, interval: Duration) -> Result<()> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        debug!(
            "{} not visible yet (attempt {}/{})",
            path.display(),
            attempt,
            attempts
        );
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(Error::Visibility {
        path: path.to_path_buf(),
        attempts,
    })
}

/// Wait until every path in `paths` exists, checking up to `attempts`
/// times. Returns for each path whether it became visible.
pub async fn wait_until_all_visible(
    paths: &[PathBuf],
    attempts: u32,
    interval: Duration,
) -> Vec<bool> {
    let attempts = attempts.max(1);
    let mut visible = vec![false; paths.len()];
    for attempt in 1..=attempts {
        for (path, seen) in paths.iter().zip(visible.iter_mut()) {
            if !*seen {
                *seen = tokio::fs::try_exists(path).await.unwrap_or(false);
            }
        }
        let missing = visible.iter().filter(|v| !**v).count();
        if missing == 0 {
            break;
        }
        debug!(
            "{} of {} paths not visible yet (attempt {}/{})",
            missing,
            paths.len(),
            attempt,
            attempts
        );
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    visible
}
