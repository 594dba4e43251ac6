//! Whittle CLI
//!
//! Minimizes failure-inducing JSON documents, locally or on a Slurm cluster.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use whittle::config::EnvironmentKind;
use whittle::generators::{RemoveArrayElements, RemoveObjectFields, Shuffled, SimplifyScalars};
use whittle::signals::InterruptHandler;
use whittle::workspace;
use whittle::{
    create_environment, search, ChainGenerators, Config, Evaluator, ResourceLimits, Result,
    SearchOptions, SuccessorGenerator,
};

#[derive(Parser)]
#[command(name = "whittle")]
#[command(author, version, about = "Test-case minimization by first-choice hill climbing")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Minimize a JSON document
    Minimize {
        /// Document that triggers the failure
        input: PathBuf,

        /// Program that exits with 0 iff the failure is reproduced
        #[arg(long, short)]
        evaluator: String,

        /// Where to write the minimized document (default: <input>.min.json)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Where to write the search report (default: report.json next to the output)
        #[arg(long)]
        report: Option<PathBuf>,

        /// Environment to evaluate in (local, slurm)
        #[arg(long)]
        environment: Option<String>,

        /// Successors per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Take any improving successor instead of the first one
        #[arg(long)]
        lenient: bool,

        /// Enumerate successors in a random order seeded with this value
        #[arg(long)]
        seed: Option<u64>,

        /// Stop after this many accepted steps
        #[arg(long)]
        max_steps: Option<usize>,

        /// CPU time limit per evaluation (e.g. "30s", "5m")
        #[arg(long, value_parser = humantime::parse_duration)]
        cpu_time: Option<Duration>,

        /// Memory limit per evaluation in MiB
        #[arg(long)]
        memory: Option<u64>,
    },

    /// Evaluate one task of a batch (run by Slurm array jobs)
    RunTask {
        /// Batch directory
        batch_dir: PathBuf,

        /// Array index of the task
        #[arg(long)]
        index: usize,

        /// Evaluator program
        #[arg(long)]
        evaluator: PathBuf,

        /// CPU time limit
        #[arg(long, value_parser = humantime::parse_duration)]
        cpu_time: Option<Duration>,

        /// Memory limit in MiB
        #[arg(long)]
        memory: Option<u64>,

        /// Distance between soft and hard CPU limit
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
        grace: Duration,
    },

    /// Initialize .whittle directory
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Minimize {
            input,
            evaluator,
            output,
            report,
            environment,
            batch_size,
            lenient,
            seed,
            max_steps,
            cpu_time,
            memory,
        } => {
            let mut config = Config::load(cli.config.as_deref())?;
            if let Some(kind) = environment {
                config.environment.kind = kind.parse::<EnvironmentKind>()?;
            }
            if batch_size.is_some() {
                config.environment.batch_size = batch_size;
            }
            if lenient {
                config.environment.allow_nondeterministic_successor_choice = true;
            }
            if cpu_time.is_some() {
                config.limits.cpu_time = cpu_time;
            }
            if memory.is_some() {
                config.limits.memory_mb = memory;
            }
            config.validate()?;

            let output = output.unwrap_or_else(|| input.with_extension("min.json"));
            let report = report.unwrap_or_else(|| output.with_file_name("report.json"));
            let options = SearchOptions {
                max_steps,
                interrupt: None,
            };
            minimize(&config, &input, &evaluator, &output, &report, seed, options).await?;
        }

        Commands::RunTask {
            batch_dir,
            index,
            evaluator,
            cpu_time,
            memory,
            grace,
        } => {
            let dir = workspace::task_dir(&batch_dir, index);
            let limits = ResourceLimits {
                cpu_time,
                memory_mb: memory,
                grace,
            };
            let evaluator = Evaluator::resolve(&evaluator.to_string_lossy())?.with_limits(limits);
            let record = evaluator.run_in(&dir).await?;
            workspace::write_exit_record(&dir, record)?;
            info!("Task {} in {} ended with {}", index, batch_dir.display(), record);
        }

        Commands::Init { force } => {
            let path = whittle::config::init(force)?;
            info!("Initialized .whittle directory ({})", path.display());
        }

        Commands::Config => {
            let config = Config::load(cli.config.as_deref())?;
            let content = toml::to_string_pretty(&config)
                .map_err(|e| whittle::Error::Config(e.to_string()))?;
            println!("{}", content);
        }
    }

    Ok(())
}

/// JSON reductions, largest first
fn json_generator(seed: Option<u64>) -> ChainGenerators<Value> {
    let generators: Vec<Box<dyn SuccessorGenerator<Value>>> = match seed {
        Some(seed) => vec![
            Box::new(Shuffled::new(RemoveObjectFields, seed)),
            Box::new(Shuffled::new(RemoveArrayElements, seed.wrapping_add(1))),
            Box::new(Shuffled::new(SimplifyScalars, seed.wrapping_add(2))),
        ],
        None => vec![
            Box::new(RemoveObjectFields),
            Box::new(RemoveArrayElements),
            Box::new(SimplifyScalars),
        ],
    };
    ChainGenerators::new(generators)
}

async fn minimize(
    config: &Config,
    input: &Path,
    evaluator: &str,
    output: &Path,
    report_path: &Path,
    seed: Option<u64>,
    mut options: SearchOptions,
) -> Result<()> {
    let initial: Value = serde_json::from_str(&std::fs::read_to_string(input)?)?;
    let evaluator = Evaluator::resolve(evaluator)?.with_limits(config.resource_limits());
    let generator = json_generator(seed);
    let mut environment = create_environment::<Value>(config)?;

    let handler = InterruptHandler::new();
    handler.install()?;
    options.interrupt = Some(handler.interrupt_flag());

    info!(
        "Minimizing {} with {}",
        input.display(),
        evaluator.program().display()
    );
    let result = search(
        initial,
        &generator,
        &evaluator,
        environment.as_mut(),
        &options,
    )
    .await?;

    std::fs::write(output, serde_json::to_string_pretty(&result.state)?)?;
    std::fs::write(report_path, serde_json::to_string_pretty(&result.report)?)?;
    if handler.is_interrupted() {
        warn!("Search was interrupted, the result is not a local optimum");
    }
    info!("Wrote {} and {}", output.display(), report_path.display());
    println!("{}", result.report.summary());
    Ok(())
}
