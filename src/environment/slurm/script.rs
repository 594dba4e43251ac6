//! Job script rendering
//!
//! Each batch becomes one array job with one array task per successor.
//! Every array task runs `whittle run-task` for its own task directory, which
//! evaluates the state file and leaves the `exit_code` artifact behind.

use std::fmt::Write as _;
use std::path::Path;

use crate::config::SlurmConfig;
use crate::evaluator::Evaluator;

fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Array job script for one batch
pub struct JobScript<'a> {
    /// Slurm settings
    pub config: &'a SlurmConfig,
    /// Batch directory holding the task directories
    pub batch_dir: &'a Path,
    /// Number of array tasks
    pub tasks: usize,
    /// whittle binary on the nodes
    pub wrapper: &'a Path,
    /// Evaluator and its limits
    pub evaluator: &'a Evaluator,
}

impl JobScript<'_> {
    /// Render the script text
    pub fn render(&self) -> String {
        let config = self.config;
        let mut out = String::from("#!/bin/bash\n");
        let mut sbatch = |option: String| {
            let _ = writeln!(out, "#SBATCH {}", option);
        };

        sbatch(format!("--job-name={}", config.job_name));
        let last = self.tasks.saturating_sub(1);
        match config.max_parallel {
            Some(max) => sbatch(format!("--array=0-{}%{}", last, max)),
            None => sbatch(format!("--array=0-{}", last)),
        }
        sbatch(format!(
            "--output={}",
            self.batch_dir.join("slurm-%A_%a.out").display()
        ));
        sbatch(format!(
            "--error={}",
            self.batch_dir.join("slurm-%A_%a.err").display()
        ));
        sbatch("--ntasks=1".to_string());
        sbatch("--cpus-per-task=1".to_string());

        if let Some(partition) = &config.partition {
            sbatch(format!("--partition={}", partition));
        }
        if let Some(qos) = &config.qos {
            sbatch(format!("--qos={}", qos));
        }
        if let Some(memory) = &config.memory_per_cpu {
            sbatch(format!("--mem-per-cpu={}", memory));
        }
        if let Some(time) = &config.time_limit {
            sbatch(format!("--time={}", time));
        }
        if let Some(nice) = config.nice {
            sbatch(format!("--nice={}", nice));
        }
        if let Some(email) = &config.email {
            sbatch("--mail-type=END,FAIL".to_string());
            sbatch(format!("--mail-user={}", email));
        }
        if !config.export.is_empty() {
            sbatch(format!("--export={}", config.export.join(",")));
        }
        for option in &config.extra_options {
            sbatch(option.clone());
        }

        out.push('\n');
        for line in &config.setup {
            out.push_str(line);
            out.push('\n');
        }

        out.push_str(&self.command_line());
        out.push('\n');
        out
    }

    fn command_line(&self) -> String {
        let limits = self.evaluator.limits();
        let mut line = format!(
            "exec {} run-task {} --index \"$SLURM_ARRAY_TASK_ID\" --evaluator {}",
            quote_path(self.wrapper),
            quote_path(self.batch_dir),
            quote_path(self.evaluator.program())
        );
        if let Some(cpu) = limits.cpu_time {
            let _ = write!(
                line,
                " --cpu-time {}",
                quote(&humantime::format_duration(cpu).to_string())
            );
        }
        if let Some(memory) = limits.memory_mb {
            let _ = write!(line, " --memory {}", memory);
        }
        let _ = write!(
            line,
            " --grace {}",
            quote(&humantime::format_duration(limits.grace).to_string())
        );
        line
    }
}
