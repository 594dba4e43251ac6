//! Configuration loading and management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::evaluator::ResourceLimits;
use crate::{Error, Result};

/// Default batch size of the local environment
pub const DEFAULT_LOCAL_BATCH_SIZE: usize = 1;
/// Default batch size of the Slurm environment
pub const DEFAULT_SLURM_BATCH_SIZE: usize = 100;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Which environment evaluates successors
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Limits applied to every evaluator run
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Where batches are materialized
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Slurm specific settings
    #[serde(default)]
    pub slurm: SlurmConfig,
}

impl Config {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .whittle/config.toml in current directory
            let local = PathBuf::from(".whittle/config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.whittle/config.toml
            dirs::home_dir().map(|h| h.join(".whittle/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                Self::parse(&content)
            }
            Some(p) if path.is_some() => Err(Error::Config(format!(
                "Config file {} does not exist",
                p.display()
            ))),
            _ => Ok(Config::default()),
        }
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the search cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.environment.batch_size == Some(0) {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.slurm.max_parallel == Some(0) {
            return Err(Error::Config("max_parallel must be at least 1".to_string()));
        }
        if self.slurm.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must not be zero".to_string()));
        }
        Ok(())
    }

    /// Batch size of the configured environment
    pub fn batch_size(&self) -> usize {
        self.environment
            .batch_size
            .unwrap_or(match self.environment.kind {
                EnvironmentKind::Local => DEFAULT_LOCAL_BATCH_SIZE,
                EnvironmentKind::Slurm => DEFAULT_SLURM_BATCH_SIZE,
            })
    }

    /// Resource limits for evaluator runs
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_time: self.limits.cpu_time,
            memory_mb: self.limits.memory_mb,
            grace: self.limits.grace,
        }
    }

    /// Workspace root with `~` expanded
    pub fn workspace_dir(&self) -> PathBuf {
        let raw = self.workspace.directory.to_string_lossy();
        PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
    }
}

/// Environment selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Which environment to use
    #[serde(default)]
    pub kind: EnvironmentKind,

    /// Successors per batch (defaults depend on the kind)
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Trade strict enumeration order for throughput when evaluations fail
    #[serde(default)]
    pub allow_nondeterministic_successor_choice: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            kind: EnvironmentKind::Local,
            batch_size: None,
            allow_nondeterministic_successor_choice: false,
        }
    }
}

/// Environment kind enum for config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentKind {
    #[default]
    Local,
    Slurm,
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentKind::Local => write!(f, "local"),
            EnvironmentKind::Slurm => write!(f, "slurm"),
        }
    }
}

impl std::str::FromStr for EnvironmentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(EnvironmentKind::Local),
            "slurm" | "cluster" => Ok(EnvironmentKind::Slurm),
            _ => Err(Error::Config(format!("Unknown environment kind: {}", s))),
        }
    }
}

/// Resource limits configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Soft CPU time limit per evaluation
    #[serde(default, with = "humantime_serde::option")]
    pub cpu_time: Option<Duration>,

    /// Address space limit per evaluation in MiB
    #[serde(default)]
    pub memory_mb: Option<u64>,

    /// Hard CPU limit is this much above the soft one
    #[serde(default = "default_grace", with = "humantime_serde")]
    pub grace: Duration,
}

fn default_grace() -> Duration {
    Duration::from_secs(5)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cpu_time: None,
            memory_mb: None,
            grace: default_grace(),
        }
    }
}

/// Workspace configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory holding run directories (must be shared with the cluster nodes)
    #[serde(default = "default_workspace_dir")]
    pub directory: PathBuf,

    /// Keep batch directories after their batch is decided
    #[serde(default)]
    pub keep: bool,
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".whittle/runs")
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            directory: default_workspace_dir(),
            keep: false,
        }
    }
}

/// Slurm environment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlurmConfig {
    /// Job name shown by the scheduler
    #[serde(default = "default_job_name")]
    pub job_name: String,

    /// Partition to submit to
    #[serde(default)]
    pub partition: Option<String>,

    /// Quality of service
    #[serde(default)]
    pub qos: Option<String>,

    /// Memory per CPU, in Slurm syntax (e.g. "3872M")
    #[serde(default)]
    pub memory_per_cpu: Option<String>,

    /// Wall-clock limit per task, in Slurm syntax
    #[serde(default)]
    pub time_limit: Option<String>,

    /// Scheduling priority adjustment
    #[serde(default)]
    pub nice: Option<i32>,

    /// Mail address notified when the job ends or fails
    #[serde(default)]
    pub email: Option<String>,

    /// Environment variables forwarded to the tasks
    #[serde(default)]
    pub export: Vec<String>,

    /// Extra `#SBATCH` options, e.g. "--exclude=node01"
    #[serde(default)]
    pub extra_options: Vec<String>,

    /// Shell commands run before the task wrapper
    #[serde(default)]
    pub setup: Vec<String>,

    /// Upper bound on concurrently running tasks of one array job
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Time between status queries
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How often to look for files on the shared filesystem
    #[serde(default = "default_visibility_retries")]
    pub visibility_retries: u32,

    /// Time between two filesystem visibility checks
    #[serde(default = "default_visibility_interval", with = "humantime_serde")]
    pub visibility_interval: Duration,

    /// Call scancel for tasks nobody waits for anymore
    #[serde(default)]
    pub cancel_abandoned_tasks: bool,

    /// sbatch binary
    #[serde(default = "default_sbatch")]
    pub sbatch: String,

    /// sacct binary
    #[serde(default = "default_sacct")]
    pub sacct: String,

    /// scancel binary
    #[serde(default = "default_scancel")]
    pub scancel: String,

    /// whittle binary run on the nodes (defaults to the current executable)
    #[serde(default)]
    pub wrapper: Option<PathBuf>,
}

fn default_job_name() -> String {
    "whittle".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_visibility_retries() -> u32 {
    20
}

fn default_visibility_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_sbatch() -> String {
    "sbatch".to_string()
}

fn default_sacct() -> String {
    "sacct".to_string()
}

fn default_scancel() -> String {
    "scancel".to_string()
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            job_name: default_job_name(),
            partition: None,
            qos: None,
            memory_per_cpu: None,
            time_limit: None,
            nice: None,
            email: None,
            export: Vec::new(),
            extra_options: Vec::new(),
            setup: Vec::new(),
            max_parallel: None,
            poll_interval: default_poll_interval(),
            visibility_retries: default_visibility_retries(),
            visibility_interval: default_visibility_interval(),
            cancel_abandoned_tasks: false,
            sbatch: default_sbatch(),
            sacct: default_sacct(),
            scancel: default_scancel(),
            wrapper: None,
        }
    }
}

/// Initialize the .whittle directory with a default config
pub fn init(force: bool) -> Result<PathBuf> {
    let whittle_dir = PathBuf::from(".whittle");
    std::fs::create_dir_all(&whittle_dir)?;

    let config_path = whittle_dir.join("config.toml");
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists, use --force to overwrite",
            config_path.display()
        )));
    }

    let config_str = toml::to_string_pretty(&Config::default())
        .map_err(|e| Error::Config(e.to_string()))?;
    std::fs::write(&config_path, config_str)?;

    Ok(config_path)
}

// Custom serde module for Duration using humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => {
                    let s = humantime::format_duration(*d).to_string();
                    serializer.serialize_some(&s)
                }
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt: Option<String> = Option::deserialize(deserializer)?;
            match opt {
                Some(s) => humantime::parse_duration(&s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
