use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use mediaflow_core::model::TaskId;

#[derive(Parser, Debug)]
#[command(
    name = "mediaflowctl",
    version,
    about = "Run and inspect the mediaflow task orchestrator"
)]
pub struct Cli {
    /// Path to mediaflow.toml (defaults to ./mediaflow.toml or ./config/mediaflow.toml)
    #[arg(long, global = true, env = "MEDIAFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a .env file loaded before the environment is read
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Recover persisted tasks and run workers plus maintenance until interrupted
    Run(RunArgs),
    /// Queue one task in the configured database
    Submit(SubmitArgs),
    /// Run a single maintenance pass (stall detection, idle quotas, retention)
    Sweep,
    /// Print the snapshot of a task
    Status {
        #[arg(value_parser = parse_task_id)]
        task_id: TaskId,
    },
    /// Print the progress events of a task as JSON lines
    Events {
        #[arg(value_parser = parse_task_id)]
        task_id: TaskId,
        /// Only print events with a sequence number greater than this
        #[arg(long)]
        after: Option<u64>,
    },
    /// Count tasks by status over a recent window
    Report {
        /// Window length, e.g. `24h` or `90m` (defaults to maintenance.report_window_secs)
        #[arg(long, value_parser = humantime::parse_duration)]
        window: Option<Duration>,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Submit this many demo tasks and exit once all of them are terminal
    #[arg(long, value_name = "TASKS")]
    pub demo: Option<u32>,

    /// Number of demo owners the demo tasks are spread across
    #[arg(long, default_value_t = 2)]
    pub owners: u32,

    /// Probability that a demo stage attempt fails with a retryable error
    #[arg(long, default_value_t = 0.1)]
    pub failure_rate: f64,

    /// Multiplier applied to the simulated stage durations
    #[arg(long, default_value_t = 1.0)]
    pub time_scale: f64,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[arg(long)]
    pub owner: String,

    #[arg(long, default_value = "media")]
    pub template: String,

    /// Opaque reference to the input media (object key, URL, path)
    #[arg(long)]
    pub payload: String,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Load the configuration, apply guard rails and print a summary
    Check,
}

fn parse_task_id(raw: &str) -> Result<TaskId, String> {
    raw.parse::<TaskId>()
        .map_err(|err| format!("invalid task id `{raw}`: {err}"))
}
