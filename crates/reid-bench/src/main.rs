mod experiments;
mod pipeline;
pub mod results;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{ExperimentsArgs, ScheduleArgs, SyntheticArgs, TrainArgs, ValidateArgs};

/// reid-bench: identity-balanced metric-learning experiments from YAML configs.
#[derive(Parser)]
#[command(name = "reid-bench", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for training, schedule inspection, validation and
/// experiment sessions.
#[derive(Subcommand)]
enum Command {
    /// Train one experiment on synthetic identity data.
    Train {
        /// Path to the experiment YAML file.
        #[arg(long)]
        config: PathBuf,
        /// Dotted `key=value` override, e.g. `train.max_epoch=5`. Repeatable.
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
        #[command(flatten)]
        synthetic: SyntheticArgs,
    },
    /// Print the learning rate at each epoch boundary.
    Schedule {
        /// Path to the experiment YAML file.
        #[arg(long)]
        config: PathBuf,
        /// Optimizer steps per epoch.
        #[arg(long, default_value_t = 100)]
        steps_per_epoch: usize,
    },
    /// Load and validate a config, then print the resolved training setup.
    Validate {
        /// Path to the experiment YAML file.
        #[arg(long)]
        config: PathBuf,
        /// Dotted `key=value` override. Repeatable.
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },
    /// Run registered experiments or groups sequentially.
    Experiments {
        /// Experiment keys or group names.
        names: Vec<String>,
        /// Show available experiments and groups, then exit.
        #[arg(long, alias = "show")]
        list: bool,
        /// Print the plan without running anything.
        #[arg(long)]
        dry_run: bool,
        /// Timeout per experiment in seconds.
        #[arg(long, default_value_t = 14_400)]
        timeout: u64,
        /// Seconds to wait between experiments.
        #[arg(long, default_value_t = 10)]
        wait: u64,
        /// Directory holding the experiment YAML files.
        #[arg(long, default_value = "configs")]
        configs_dir: PathBuf,
        /// Root directory for run outputs and session summaries.
        #[arg(long, default_value = "log")]
        log_root: PathBuf,
        #[command(flatten)]
        synthetic: SyntheticArgs,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            overrides,
            synthetic,
        } => pipeline::run_train(TrainArgs {
            config,
            overrides,
            synthetic,
        }),
        Command::Schedule {
            config,
            steps_per_epoch,
        } => pipeline::run_schedule(ScheduleArgs {
            config,
            steps_per_epoch,
        }),
        Command::Validate { config, overrides } => {
            pipeline::run_validate(ValidateArgs { config, overrides })
        }
        Command::Experiments {
            names,
            list,
            dry_run,
            timeout,
            wait,
            configs_dir,
            log_root,
            synthetic,
        } => pipeline::run_experiments(ExperimentsArgs {
            names,
            list,
            dry_run,
            timeout_secs: timeout,
            wait_secs: wait,
            configs_dir,
            log_root,
            synthetic,
        }),
    }
}
